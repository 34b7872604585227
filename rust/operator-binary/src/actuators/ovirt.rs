use async_trait::async_trait;
use serde_json::json;

use super::{
    build_machine_set, master_provider_spec, mismatch_error, set_field, zone_replicas, Actuator,
    ActuatorContext, Generated, Result,
};
use crate::crd::{cluster_deployment::ClusterDeployment, MachinePool, PlatformKind};

/// oVirt has no zone concept; a pool is a single group.
pub struct OvirtActuator;

#[async_trait]
impl Actuator for OvirtActuator {
    async fn generate_machine_sets(
        &self,
        cd: &ClusterDeployment,
        pool: &MachinePool,
        ctx: &ActuatorContext<'_>,
    ) -> Result<Generated> {
        let Some(ovirt) = pool.spec.platform.ovirt.as_ref() else {
            return Err(mismatch_error(pool, PlatformKind::Ovirt));
        };

        let skeleton = master_provider_spec(ctx.master_machine)?;
        let infra_id = cd.infra_id().unwrap_or_default();
        let (replicas, bounds) = zone_replicas(pool, 1);

        let mut provider_spec = skeleton.clone();
        set_field(&mut provider_spec, &["cpu", "cores"], json!(ovirt.cores));
        set_field(&mut provider_spec, &["memoryMiB"], json!(ovirt.memory_mi_b));

        let name = format!("{infra_id}-{pool}", pool = pool.spec.name);
        Ok(Generated::Ready(vec![build_machine_set(
            cd,
            pool,
            &name,
            replicas[0],
            bounds.as_ref().map(|b| b[0]),
            provider_spec,
        )]))
    }
}
