//! Platform-variant generators for the desired machine sets of a pool.
//!
//! Every variant starts from the provider spec of a sampled master machine
//! and projects the pool's shape and zone spread onto it. The registry
//! dispatches on the parent cluster's platform; tests substitute a fake
//! variant through the [`Actuator`] trait.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use kube::{Client, ResourceExt};
use semver::Version;
use serde_json::Value;
use snafu::{OptionExt, Snafu};

use crate::{
    apportion::{apportion, zone_bounds, ZoneBounds},
    crd::{
        cluster_deployment::ClusterDeployment,
        machine_api::{
            Machine, MachineSet, MachineSetSelector, MachineSetSpec, MachineSetTemplate,
            MachineSpec, MachineTemplate, ProviderSpec, TemplateMetadata, MACHINE_CLUSTER_LABEL,
            MACHINE_SET_LABEL,
        },
        MachinePool, MachinePoolConditionType, MachinePoolNameLease, PlatformKind,
        AUTOSCALER_MAX_ANNOTATION, AUTOSCALER_MIN_ANNOTATION, CLUSTER_DEPLOYMENT_LABEL,
        MACHINE_API_NAMESPACE, MACHINE_POOL_LABEL,
    },
    expectations::Expectations,
};

mod aws;
mod azure;
mod gcp;
mod openstack;
mod ovirt;
mod vsphere;

pub use aws::AwsActuator;
pub use azure::AzureActuator;
pub use gcp::GcpActuator;
pub use openstack::OpenStackActuator;
pub use ovirt::OvirtActuator;
pub use vsphere::VSphereActuator;

/// Names the secret holding assume-role credentials for AWS clusters that
/// are provisioned through a service provider account.
pub const AWS_ASSUME_ROLE_SECRET_ENV: &str = "AWS_SERVICE_PROVIDER_CREDENTIALS_SECRET_NAME";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster {cluster} has no platform this operator can actuate"))]
    UnsupportedPlatform { cluster: String },

    /// The pool asks for something its platform cannot provide. Surfaced as
    /// a condition; not retried until the spec changes.
    #[snafu(display("{message}"))]
    Configuration {
        condition: MachinePoolConditionType,
        reason: String,
        message: String,
    },

    #[snafu(display("master machine {name} has no provider spec to derive worker shapes from"))]
    MissingProviderSpec { name: String },

    #[snafu(display("failed to create name lease {name}"))]
    CreateLease { source: kube::Error, name: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Outcome of a generation pass.
#[derive(Debug)]
pub enum Generated {
    Ready(Vec<MachineSet>),
    /// Remote state is not observable enough yet. The reconcile returns
    /// benignly; a watch event re-drives it.
    NotReady,
}

/// Read-only inputs shared by all variants.
pub struct ActuatorContext<'a> {
    /// Master machine sampled from the target cluster; source of the
    /// provider-spec skeleton and of region/zone identity.
    pub master_machine: &'a Machine,
    /// Machine sets currently on the target API, used by variants that
    /// must honor historical name stems.
    pub remote_machine_sets: &'a [MachineSet],
    /// Name leases of the parent cluster.
    pub leases: &'a [MachinePoolNameLease],
    /// Version label of the parent cluster, when present.
    pub cluster_version: Option<&'a str>,
}

#[async_trait]
pub trait Actuator: Send + Sync {
    /// Synthesizes the desired per-zone machine sets for the pool.
    async fn generate_machine_sets(
        &self,
        cd: &ClusterDeployment,
        pool: &MachinePool,
        ctx: &ActuatorContext<'_>,
    ) -> Result<Generated>;

    /// Companion infrastructure templates, only meaningful under central
    /// machine management.
    async fn generate_machine_templates(
        &self,
        _cd: &ClusterDeployment,
        _pool: &MachinePool,
        _ctx: &ActuatorContext<'_>,
    ) -> Result<Vec<MachineTemplate>> {
        Ok(Vec::new())
    }
}

pub struct ActuatorDeps {
    pub local_client: Client,
    pub expectations: Arc<Expectations>,
}

/// Picks the variant for the parent cluster's platform.
pub fn for_cluster(cd: &ClusterDeployment, deps: &ActuatorDeps) -> Result<Box<dyn Actuator>> {
    match cd.spec.platform.kind() {
        Some(PlatformKind::Aws) => Ok(Box::new(AwsActuator::from_env())),
        Some(PlatformKind::Gcp) => Ok(Box::new(GcpActuator::new(
            deps.local_client.clone(),
            deps.expectations.clone(),
        ))),
        Some(PlatformKind::Azure) => Ok(Box::new(AzureActuator)),
        Some(PlatformKind::OpenStack) => Ok(Box::new(OpenStackActuator)),
        Some(PlatformKind::VSphere) => Ok(Box::new(VSphereActuator)),
        Some(PlatformKind::Ovirt) => Ok(Box::new(OvirtActuator)),
        None => UnsupportedPlatformSnafu {
            cluster: cd.name_any(),
        }
        .fail(),
    }
}

/// Whether the platform accepts autoscaling pools whose minimum is smaller
/// than the zone spread (all the way down to zero machines per zone).
pub fn allows_zero_min(platform: PlatformKind, cluster_version: Option<&str>) -> bool {
    match platform {
        PlatformKind::Aws | PlatformKind::Azure | PlatformKind::Gcp => true,
        PlatformKind::OpenStack => match cluster_version.map(Version::parse) {
            Some(Ok(version)) => version >= Version::new(4, 7, 0),
            Some(Err(_)) | None => {
                tracing::debug!(
                    "cluster version missing or unparseable, assuming zero-sized zones are unsupported"
                );
                false
            }
        },
        PlatformKind::VSphere | PlatformKind::Ovirt => false,
    }
}

/// Per-zone replica shares for the pool: the fixed count apportioned, or the
/// autoscaling minimum per zone alongside the bounds.
pub(crate) fn zone_replicas(
    pool: &MachinePool,
    zone_count: usize,
) -> (Vec<i32>, Option<Vec<ZoneBounds>>) {
    match pool.autoscaling() {
        Some(autoscaling) => {
            let bounds = zone_bounds(
                autoscaling.min_replicas,
                autoscaling.max_replicas,
                zone_count,
            );
            (bounds.iter().map(|b| b.min).collect(), Some(bounds))
        }
        None => (apportion(pool.spec.replicas.unwrap_or(0), zone_count), None),
    }
}

pub(crate) fn master_provider_spec(master: &Machine) -> Result<Value> {
    master
        .spec
        .provider_spec
        .as_ref()
        .and_then(|ps| ps.value.clone())
        .context(MissingProviderSpecSnafu {
            name: master.name_any(),
        })
}

pub(crate) fn master_zone(skeleton: &Value, pointer: &str) -> Option<String> {
    skeleton
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Writes `value` at the given object path, creating intermediate objects.
pub(crate) fn set_field(spec: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = spec;
    for key in parents {
        let Some(map) = current.as_object_mut() else {
            return;
        };
        current = map
            .entry((*key).to_owned())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if let Some(map) = current.as_object_mut() {
        map.insert((*last).to_owned(), value);
    }
}

pub(crate) fn mismatch_error(pool: &MachinePool, platform: PlatformKind) -> Error {
    Error::Configuration {
        condition: MachinePoolConditionType::UnsupportedConfiguration,
        reason: "PlatformMismatch".to_owned(),
        message: format!(
            "pool {pool} carries no {platform} stanza matching its cluster platform",
            pool = pool.name_any(),
        ),
    }
}

/// Assembles one desired machine set in the machine API namespace, labeled
/// for ownership and selectable by name.
pub(crate) fn build_machine_set(
    cd: &ClusterDeployment,
    pool: &MachinePool,
    name: &str,
    replicas: i32,
    bounds: Option<ZoneBounds>,
    provider_spec: Value,
) -> MachineSet {
    let infra_id = cd.infra_id().unwrap_or_default().to_owned();

    let selector_labels = BTreeMap::from([
        (MACHINE_SET_LABEL.to_owned(), name.to_owned()),
        (MACHINE_CLUSTER_LABEL.to_owned(), infra_id.clone()),
    ]);

    let mut machine_set = MachineSet::new(
        name,
        MachineSetSpec {
            replicas: Some(replicas),
            selector: MachineSetSelector {
                match_labels: Some(selector_labels.clone()),
            },
            template: MachineSetTemplate {
                metadata: Some(TemplateMetadata {
                    labels: Some(selector_labels),
                }),
                spec: MachineSpec {
                    metadata: pool
                        .spec
                        .labels
                        .clone()
                        .map(|labels| TemplateMetadata {
                            labels: Some(labels),
                        }),
                    taints: pool.spec.taints.clone(),
                    provider_spec: Some(ProviderSpec {
                        value: Some(provider_spec),
                    }),
                },
            },
        },
    );

    machine_set.metadata.namespace = Some(MACHINE_API_NAMESPACE.to_owned());
    machine_set.metadata.labels = Some(BTreeMap::from([
        (MACHINE_POOL_LABEL.to_owned(), pool.spec.name.clone()),
        (CLUSTER_DEPLOYMENT_LABEL.to_owned(), cd.name_any()),
        (MACHINE_CLUSTER_LABEL.to_owned(), infra_id),
    ]));
    if let Some(bounds) = bounds {
        machine_set.metadata.annotations = Some(BTreeMap::from([
            (AUTOSCALER_MIN_ANNOTATION.to_owned(), bounds.min.to_string()),
            (AUTOSCALER_MAX_ANNOTATION.to_owned(), bounds.max.to_string()),
        ]));
    }
    machine_set
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(PlatformKind::Aws, None, true)]
    #[case(PlatformKind::Azure, None, true)]
    #[case(PlatformKind::Gcp, None, true)]
    #[case(PlatformKind::VSphere, Some("4.8.0"), false)]
    #[case(PlatformKind::Ovirt, Some("4.8.0"), false)]
    #[case(PlatformKind::OpenStack, Some("4.7.0"), true)]
    #[case(PlatformKind::OpenStack, Some("4.8.2"), true)]
    #[case(PlatformKind::OpenStack, Some("4.6.9"), false)]
    #[case(PlatformKind::OpenStack, Some("not-a-version"), false)]
    #[case(PlatformKind::OpenStack, None, false)]
    fn zero_min_policy(
        #[case] platform: PlatformKind,
        #[case] version: Option<&str>,
        #[case] allowed: bool,
    ) {
        assert_eq!(allows_zero_min(platform, version), allowed);
    }

    #[test]
    fn set_field_creates_intermediate_objects() {
        let mut spec = serde_json::json!({"instanceType": "m5.xlarge"});
        set_field(&mut spec, &["placement", "availabilityZone"], "eu-central-1a".into());
        set_field(&mut spec, &["instanceType"], "m5.large".into());
        assert_eq!(
            spec,
            serde_json::json!({
                "instanceType": "m5.large",
                "placement": {"availabilityZone": "eu-central-1a"},
            })
        );
    }
}
