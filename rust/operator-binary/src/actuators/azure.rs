use async_trait::async_trait;
use serde_json::json;

use super::{
    build_machine_set, master_provider_spec, master_zone, mismatch_error, set_field,
    zone_replicas, Actuator, ActuatorContext, ConfigurationSnafu, Generated, Result,
};
use crate::crd::{
    cluster_deployment::ClusterDeployment, MachinePool, MachinePoolConditionType, PlatformKind,
};

pub struct AzureActuator;

#[async_trait]
impl Actuator for AzureActuator {
    async fn generate_machine_sets(
        &self,
        cd: &ClusterDeployment,
        pool: &MachinePool,
        ctx: &ActuatorContext<'_>,
    ) -> Result<Generated> {
        let Some(azure) = pool.spec.platform.azure.as_ref() else {
            return Err(mismatch_error(pool, PlatformKind::Azure));
        };

        let skeleton = master_provider_spec(ctx.master_machine)?;
        let zones = match azure.zones.as_ref() {
            Some(zones) if !zones.is_empty() => zones.clone(),
            _ => master_zone(&skeleton, "/zone").into_iter().collect(),
        };
        if zones.is_empty() {
            return ConfigurationSnafu {
                condition: MachinePoolConditionType::UnsupportedConfiguration,
                reason: "NoZonesKnown",
                message: "neither the pool nor the master machine names a zone",
            }
            .fail();
        }

        let infra_id = cd.infra_id().unwrap_or_default();
        let (replicas, bounds) = zone_replicas(pool, zones.len());
        let machine_sets = zones
            .iter()
            .enumerate()
            .map(|(i, zone)| {
                let mut provider_spec = skeleton.clone();
                set_field(&mut provider_spec, &["vmSize"], json!(azure.vm_size));
                set_field(&mut provider_spec, &["zone"], json!(zone));
                let name = format!("{infra_id}-{pool}-{zone}", pool = pool.spec.name);
                build_machine_set(
                    cd,
                    pool,
                    &name,
                    replicas[i],
                    bounds.as_ref().map(|b| b[i]),
                    provider_spec,
                )
            })
            .collect();

        Ok(Generated::Ready(machine_sets))
    }
}
