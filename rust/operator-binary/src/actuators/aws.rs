use async_trait::async_trait;
use serde_json::json;

use super::{
    build_machine_set, master_provider_spec, master_zone, mismatch_error, set_field,
    zone_replicas, Actuator, ActuatorContext, ConfigurationSnafu, Error, Generated, Result,
    AWS_ASSUME_ROLE_SECRET_ENV,
};
use crate::crd::{
    cluster_deployment::ClusterDeployment, MachinePool, MachinePoolConditionType, PlatformKind,
};

/// Spreads the pool over its availability zones; falls back to the master
/// machine's zone when the pool pins none.
pub struct AwsActuator {
    assume_role_secret: Option<String>,
}

impl AwsActuator {
    pub fn from_env() -> Self {
        AwsActuator {
            assume_role_secret: std::env::var(AWS_ASSUME_ROLE_SECRET_ENV).ok(),
        }
    }

    #[cfg(test)]
    fn with_assume_role_secret(secret: Option<&str>) -> Self {
        AwsActuator {
            assume_role_secret: secret.map(str::to_owned),
        }
    }
}

#[async_trait]
impl Actuator for AwsActuator {
    async fn generate_machine_sets(
        &self,
        cd: &ClusterDeployment,
        pool: &MachinePool,
        ctx: &ActuatorContext<'_>,
    ) -> Result<Generated> {
        let Some(aws) = pool.spec.platform.aws.as_ref() else {
            return Err(mismatch_error(pool, PlatformKind::Aws));
        };

        let skeleton = master_provider_spec(ctx.master_machine)?;
        let zones = match aws.zones.as_ref() {
            Some(zones) if !zones.is_empty() => zones.clone(),
            _ => master_zone(&skeleton, "/placement/availabilityZone")
                .into_iter()
                .collect(),
        };
        if zones.is_empty() {
            return ConfigurationSnafu {
                condition: MachinePoolConditionType::UnsupportedConfiguration,
                reason: "NoZonesKnown",
                message: "neither the pool nor the master machine names an availability zone",
            }
            .fail();
        }

        let subnets = aws.subnets.as_deref().unwrap_or_default();
        if !subnets.is_empty() && subnets.len() != zones.len() {
            return ConfigurationSnafu {
                condition: MachinePoolConditionType::InvalidSubnets,
                reason: "SubnetCountMismatch",
                message: format!(
                    "{subnets} subnets cannot cover {zones} zones",
                    subnets = subnets.len(),
                    zones = zones.len(),
                ),
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
                set_field(&mut provider_spec, &["instanceType"], json!(aws.instance_type));
                set_field(&mut provider_spec, &["placement", "availabilityZone"], json!(zone));
                if let Some(subnet) = subnets.get(i) {
                    set_field(&mut provider_spec, &["subnet", "id"], json!(subnet));
                }
                if let Some(secret) = self.assume_role_secret.as_ref() {
                    set_field(&mut provider_spec, &["credentialsSecret", "name"], json!(secret));
                }
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
