use async_trait::async_trait;
use serde_json::json;

use super::{
    build_machine_set, master_provider_spec, master_zone, mismatch_error, set_field,
    zone_replicas, Actuator, ActuatorContext, Generated, Result,
};
use crate::crd::{cluster_deployment::ClusterDeployment, MachinePool, PlatformKind};

/// OpenStack clouds expose no zone inventory to us; the pool lands in the
/// master machine's availability zone.
pub struct OpenStackActuator;

#[async_trait]
impl Actuator for OpenStackActuator {
    async fn generate_machine_sets(
        &self,
        cd: &ClusterDeployment,
        pool: &MachinePool,
        ctx: &ActuatorContext<'_>,
    ) -> Result<Generated> {
        let Some(openstack) = pool.spec.platform.openstack.as_ref() else {
            return Err(mismatch_error(pool, PlatformKind::OpenStack));
        };

        let skeleton = master_provider_spec(ctx.master_machine)?;
        let zone = master_zone(&skeleton, "/availabilityZone").unwrap_or_else(|| "nova".to_owned());

        let infra_id = cd.infra_id().unwrap_or_default();
        let (replicas, bounds) = zone_replicas(pool, 1);

        let mut provider_spec = skeleton.clone();
        set_field(&mut provider_spec, &["flavor"], json!(openstack.flavor));
        set_field(&mut provider_spec, &["availabilityZone"], json!(zone));

        let name = format!("{infra_id}-{pool}-{zone}", pool = pool.spec.name);
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
