use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

pub mod cluster_deployment;
pub mod machine_api;

pub const API_GROUP: &str = "hive.openshift.io";

// Well-known labels
pub const MACHINE_POOL_LABEL: &str = "hive.openshift.io/machine-pool";
pub const CLUSTER_DEPLOYMENT_LABEL: &str = "hive.openshift.io/cluster-deployment-name";

// Deletion guard installed on pools once the parent cluster is seen installed
pub const MACHINE_POOL_FINALIZER: &str = "hive.openshift.io/machinepool";

/// Namespace on the target cluster that hosts the machine API objects.
pub const MACHINE_API_NAMESPACE: &str = "openshift-machine-api";

// Autoscaling bounds ride on the standard machine API annotations so the
// cluster autoscaler and this operator agree on them.
pub const AUTOSCALER_MIN_ANNOTATION: &str =
    "machine.openshift.io/cluster-api-autoscaler-node-group-min-size";
pub const AUTOSCALER_MAX_ANNOTATION: &str =
    "machine.openshift.io/cluster-api-autoscaler-node-group-max-size";

/// A MachinePool is the user-authored declaration of a homogeneous set of
/// worker machines on a previously installed cluster, parameterized by a
/// replica count or autoscaling bounds and a platform-specific shape.
///
/// The object must be named `<clusterDeploymentName>-<spec.name>` so that
/// child objects can be routed back to it by label.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "hive.openshift.io",
    version = "v1",
    kind = "MachinePool",
    plural = "machinepools",
    shortname = "mp",
    status = "MachinePoolStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolSpec {
    /// The cluster deployment this pool belongs to, in the same namespace.
    pub cluster_deployment_ref: ObjectReference,

    /// Short name of the pool, embedded in generated machine set names.
    pub name: String,

    /// Fixed worker count. Mutually exclusive with `autoscaling`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Autoscaling bounds. Mutually exclusive with `replicas`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<MachinePoolAutoscaling>,

    /// Labels applied to the machines created from this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// Taints applied to the machines created from this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taints: Option<Vec<TaintSpec>>,

    pub platform: MachinePoolPlatform,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolAutoscaling {
    pub min_replicas: i32,
    pub max_replicas: i32,
}

/// Reference to an object in the same namespace.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaintSpec {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub effect: String,
}

/// Exactly one platform stanza must be set, and it must match the platform
/// of the referenced cluster deployment.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolPlatform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsMachinePoolPlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpMachinePoolPlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureMachinePoolPlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openstack: Option<OpenStackMachinePoolPlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsphere: Option<VSphereMachinePoolPlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovirt: Option<OvirtMachinePoolPlatform>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsMachinePoolPlatform {
    pub instance_type: String,
    /// Availability zones to spread the pool over. Defaults to the zone of
    /// the sampled master machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<String>>,
    /// Subnet ids, one per zone, in zone order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnets: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpMachinePoolPlatform {
    pub machine_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureMachinePoolPlatform {
    pub vm_size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenStackMachinePoolPlatform {
    pub flavor: String,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VSphereMachinePoolPlatform {
    pub num_cpus: i32,
    pub memory_mi_b: i64,
    pub disk_gi_b: i32,
    /// Failure domains to spread the pool over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OvirtMachinePoolPlatform {
    pub cores: i32,
    pub memory_mi_b: i64,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolStatus {
    /// Total replicas across all machine sets generated from this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_sets: Vec<MachineSetSummary>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<MachinePoolCondition>,
}

/// Observed state of one machine set generated from a pool.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSummary {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolCondition {
    #[serde(rename = "type")]
    pub type_: MachinePoolConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum MachinePoolConditionType {
    /// The pool's autoscaling minimum cannot cover its zone spread.
    NotEnoughReplicas,
    /// All lease characters for generated names are taken on this cluster.
    NoNameLeasesAvailable,
    /// The pool pins subnets that do not line up with its zones.
    InvalidSubnets,
    /// The pool asks for something its platform cannot provide.
    UnsupportedConfiguration,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Platform variants this operator can actuate.
#[derive(Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, PartialEq)]
pub enum PlatformKind {
    #[strum(serialize = "aws")]
    Aws,
    #[strum(serialize = "gcp")]
    Gcp,
    #[strum(serialize = "azure")]
    Azure,
    #[strum(serialize = "openstack")]
    OpenStack,
    #[strum(serialize = "vsphere")]
    VSphere,
    #[strum(serialize = "ovirt")]
    Ovirt,
}

impl MachinePoolPlatform {
    pub fn kind(&self) -> Option<PlatformKind> {
        if self.aws.is_some() {
            Some(PlatformKind::Aws)
        } else if self.gcp.is_some() {
            Some(PlatformKind::Gcp)
        } else if self.azure.is_some() {
            Some(PlatformKind::Azure)
        } else if self.openstack.is_some() {
            Some(PlatformKind::OpenStack)
        } else if self.vsphere.is_some() {
            Some(PlatformKind::VSphere)
        } else if self.ovirt.is_some() {
            Some(PlatformKind::Ovirt)
        } else {
            None
        }
    }
}

impl MachinePool {
    /// Key under which asynchronous child creations are tracked.
    pub fn tracking_key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|f| f == MACHINE_POOL_FINALIZER)
    }

    pub fn autoscaling(&self) -> Option<&MachinePoolAutoscaling> {
        self.spec.autoscaling.as_ref()
    }

    /// Exactly one of `replicas` and `autoscaling` must be set.
    pub fn replica_settings_valid(&self) -> bool {
        self.spec.replicas.is_some() != self.spec.autoscaling.is_some()
    }

    /// Name prefix shared by all machine sets generated for this pool on the
    /// given cluster.
    pub fn generated_name_prefix(&self, infra_id: &str) -> String {
        format!("{infra_id}-{name}-", name = self.spec.name)
    }

    pub fn condition(&self, type_: MachinePoolConditionType) -> Option<&MachinePoolCondition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
            .iter()
            .find(|c| c.type_ == type_)
    }
}

/// Claims one name-stem character for a pool on a cluster, so generated
/// machine set names stay within platform name-length limits. The lease is
/// named `<infraId>-<char>` and labeled with the owning pool and cluster
/// deployment.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "hive.openshift.io",
    version = "v1",
    kind = "MachinePoolNameLease",
    plural = "machinepoolnameleases",
    shortname = "mpnl",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolNameLeaseSpec {}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_from_yaml(input: &str) -> MachinePool {
        serde_yaml::from_str(input).expect("illegal test input")
    }

    #[test]
    fn replica_settings_must_be_exactly_one_of() {
        let fixed = pool_from_yaml(
            r#"
            apiVersion: hive.openshift.io/v1
            kind: MachinePool
            metadata:
              name: prod-worker
            spec:
              clusterDeploymentRef:
                name: prod
              name: worker
              replicas: 3
              platform:
                aws:
                  instanceType: m5.large
            "#,
        );
        assert!(fixed.replica_settings_valid());

        let both = pool_from_yaml(
            r#"
            apiVersion: hive.openshift.io/v1
            kind: MachinePool
            metadata:
              name: prod-worker
            spec:
              clusterDeploymentRef:
                name: prod
              name: worker
              replicas: 3
              autoscaling:
                minReplicas: 1
                maxReplicas: 5
              platform:
                aws:
                  instanceType: m5.large
            "#,
        );
        assert!(!both.replica_settings_valid());
    }

    #[test]
    fn platform_kind_follows_the_set_stanza() {
        let pool = pool_from_yaml(
            r#"
            apiVersion: hive.openshift.io/v1
            kind: MachinePool
            metadata:
              name: prod-worker
            spec:
              clusterDeploymentRef:
                name: prod
              name: worker
              replicas: 3
              platform:
                vsphere:
                  numCpus: 4
                  memoryMiB: 16384
                  diskGiB: 120
            "#,
        );
        assert_eq!(pool.spec.platform.kind(), Some(PlatformKind::VSphere));
        assert_eq!(
            pool.generated_name_prefix("prod-x7f2k"),
            "prod-x7f2k-worker-"
        );
    }
}
