use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::json;

use super::{
    build_machine_set, master_provider_spec, mismatch_error, set_field, zone_replicas, Actuator,
    ActuatorContext, Generated, Result,
};
use crate::crd::{
    cluster_deployment::ClusterDeployment,
    machine_api::{MachineTemplate, MachineTemplateSpec},
    MachinePool, PlatformKind, CLUSTER_DEPLOYMENT_LABEL, MACHINE_POOL_LABEL,
};
use std::collections::BTreeMap;

/// Pools spread over the configured failure domains, or stay in a single
/// group when none are set.
pub struct VSphereActuator;

impl VSphereActuator {
    fn group_names(infra_id: &str, pool: &MachinePool) -> Vec<(String, Option<String>)> {
        let zones = pool
            .spec
            .platform
            .vsphere
            .as_ref()
            .and_then(|v| v.zones.as_ref());
        match zones {
            Some(zones) if !zones.is_empty() => zones
                .iter()
                .map(|zone| {
                    (
                        format!("{infra_id}-{pool}-{zone}", pool = pool.spec.name),
                        Some(zone.clone()),
                    )
                })
                .collect(),
            _ => vec![(
                format!("{infra_id}-{pool}", pool = pool.spec.name),
                None,
            )],
        }
    }
}

#[async_trait]
impl Actuator for VSphereActuator {
    async fn generate_machine_sets(
        &self,
        cd: &ClusterDeployment,
        pool: &MachinePool,
        ctx: &ActuatorContext<'_>,
    ) -> Result<Generated> {
        let Some(vsphere) = pool.spec.platform.vsphere.as_ref() else {
            return Err(mismatch_error(pool, PlatformKind::VSphere));
        };

        let skeleton = master_provider_spec(ctx.master_machine)?;
        let infra_id = cd.infra_id().unwrap_or_default();
        let groups = Self::group_names(infra_id, pool);
        let (replicas, bounds) = zone_replicas(pool, groups.len());

        let machine_sets = groups
            .iter()
            .enumerate()
            .map(|(i, (name, zone))| {
                let mut provider_spec = skeleton.clone();
                set_field(&mut provider_spec, &["numCPUs"], json!(vsphere.num_cpus));
                set_field(&mut provider_spec, &["memoryMiB"], json!(vsphere.memory_mi_b));
                set_field(&mut provider_spec, &["diskGiB"], json!(vsphere.disk_gi_b));
                if let Some(zone) = zone {
                    set_field(&mut provider_spec, &["failureDomain"], json!(zone));
                }
                build_machine_set(
                    cd,
                    pool,
                    name,
                    replicas[i],
                    bounds.as_ref().map(|b| b[i]),
                    provider_spec,
                )
            })
            .collect();

        Ok(Generated::Ready(machine_sets))
    }

    async fn generate_machine_templates(
        &self,
        cd: &ClusterDeployment,
        pool: &MachinePool,
        _ctx: &ActuatorContext<'_>,
    ) -> Result<Vec<MachineTemplate>> {
        let Some(vsphere) = pool.spec.platform.vsphere.as_ref() else {
            return Err(mismatch_error(pool, PlatformKind::VSphere));
        };

        let infra_id = cd.infra_id().unwrap_or_default();
        let templates = Self::group_names(infra_id, pool)
            .into_iter()
            .map(|(name, zone)| {
                let mut template = MachineTemplate::new(
                    &name,
                    MachineTemplateSpec {
                        template: Some(json!({
                            "spec": {
                                "numCPUs": vsphere.num_cpus,
                                "memoryMiB": vsphere.memory_mi_b,
                                "diskGiB": vsphere.disk_gi_b,
                                "failureDomain": zone,
                            }
                        })),
                    },
                );
                template.metadata.labels = Some(BTreeMap::from([
                    (MACHINE_POOL_LABEL.to_owned(), pool.spec.name.clone()),
                    (CLUSTER_DEPLOYMENT_LABEL.to_owned(), cd.name_any()),
                ]));
                template
            })
            .collect();

        Ok(templates)
    }
}
