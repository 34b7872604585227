//! Read-only view of the installed-cluster record. This operator never
//! mutates a ClusterDeployment, it only consumes the fields below.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::PlatformKind;

// The engine idles while a cluster is paused or mid-relocation.
pub const PAUSE_ANNOTATION: &str = "hive.openshift.io/reconcile-pause";
pub const RELOCATING_ANNOTATION: &str = "hive.openshift.io/relocating";

/// Test shortcut: clusters carrying this annotation have no real API to
/// reconcile against.
pub const FAKE_CLUSTER_ANNOTATION: &str = "hive.openshift.io/fake-cluster";

/// Version label, consumed by platform capability gates.
pub const VERSION_LABEL: &str = "hive.openshift.io/version";

#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "hive.openshift.io",
    version = "v1",
    kind = "ClusterDeployment",
    plural = "clusterdeployments",
    shortname = "cd",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDeploymentSpec {
    /// Friendly name of the cluster, distinct from the generated infra id.
    pub cluster_name: String,

    /// Set once installation has finished and the cluster API is live.
    #[serde(default)]
    pub installed: bool,

    pub platform: Platform,

    /// Populated by the installer. Absent until installation has progressed
    /// far enough to know the infra id and admin kubeconfig.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_metadata: Option<ClusterMetadata>,

    /// When set, machine sets and their infrastructure templates are managed
    /// on the local cluster instead of the target cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_management: Option<MachineManagement>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsPlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpPlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzurePlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openstack: Option<OpenStackPlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsphere: Option<VSpherePlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovirt: Option<OvirtPlatform>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsPlatform {
    pub region: String,
    pub credentials_secret_ref: SecretReference,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpPlatform {
    pub region: String,
    pub credentials_secret_ref: SecretReference,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AzurePlatform {
    pub region: String,
    pub credentials_secret_ref: SecretReference,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenStackPlatform {
    pub cloud: String,
    pub credentials_secret_ref: SecretReference,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VSpherePlatform {
    pub datacenter: String,
    pub credentials_secret_ref: SecretReference,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OvirtPlatform {
    pub credentials_secret_ref: SecretReference,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetadata {
    /// Unique id the installer stamped into every cloud resource name.
    pub infra_id: String,
    pub admin_kubeconfig_secret_ref: SecretReference,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineManagement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub central: Option<CentralMachineManagement>,
    /// Namespace on the local cluster that hosts the managed machine sets
    /// and templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CentralMachineManagement {}

impl Platform {
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

impl ClusterDeployment {
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Paused or mid-relocation clusters get no writes and no status churn.
    pub fn is_paused(&self) -> bool {
        let annotations = self.metadata.annotations.as_ref();
        let paused = annotations
            .and_then(|a| a.get(PAUSE_ANNOTATION))
            .is_some_and(|v| v == "true");
        let relocating = annotations
            .and_then(|a| a.get(RELOCATING_ANNOTATION))
            .is_some();
        paused || relocating
    }

    pub fn is_fake(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(FAKE_CLUSTER_ANNOTATION))
            .is_some_and(|v| v == "true")
    }

    pub fn version_label(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(VERSION_LABEL))
            .map(String::as_str)
    }

    pub fn infra_id(&self) -> Option<&str> {
        self.spec
            .cluster_metadata
            .as_ref()
            .map(|m| m.infra_id.as_str())
    }

    pub fn central_machine_management(&self) -> bool {
        self.spec
            .machine_management
            .as_ref()
            .is_some_and(|m| m.central.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_from_yaml(input: &str) -> ClusterDeployment {
        serde_yaml::from_str(input).expect("illegal test input")
    }

    #[test]
    fn pause_and_relocate_annotations_idle_the_cluster() {
        let paused = cluster_from_yaml(
            r#"
            apiVersion: hive.openshift.io/v1
            kind: ClusterDeployment
            metadata:
              name: prod
              annotations:
                hive.openshift.io/reconcile-pause: "true"
            spec:
              clusterName: prod
              installed: true
              platform:
                aws:
                  region: eu-central-1
                  credentialsSecretRef:
                    name: prod-aws-creds
            "#,
        );
        assert!(paused.is_paused());

        let relocating = cluster_from_yaml(
            r#"
            apiVersion: hive.openshift.io/v1
            kind: ClusterDeployment
            metadata:
              name: prod
              annotations:
                hive.openshift.io/relocating: outbound
            spec:
              clusterName: prod
              installed: true
              platform:
                aws:
                  region: eu-central-1
                  credentialsSecretRef:
                    name: prod-aws-creds
            "#,
        );
        assert!(relocating.is_paused());
        assert_eq!(relocating.spec.platform.kind(), Some(PlatformKind::Aws));
    }
}
