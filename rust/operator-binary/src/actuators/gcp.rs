use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use kube::{
    api::{Api, PostParams},
    Client, ResourceExt,
};
use serde_json::json;
use snafu::ResultExt;

use super::{
    build_machine_set, master_provider_spec, master_zone, mismatch_error, set_field,
    zone_replicas, Actuator, ActuatorContext, ConfigurationSnafu, CreateLeaseSnafu, Generated,
    Result,
};
use crate::{
    crd::{
        cluster_deployment::ClusterDeployment,
        machine_api::MachineSet,
        MachinePool, MachinePoolConditionType, MachinePoolNameLease, MachinePoolNameLeaseSpec,
        PlatformKind, CLUSTER_DEPLOYMENT_LABEL, MACHINE_POOL_LABEL,
    },
    expectations::Expectations,
};

const LEASE_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz";

/// GCP machine set names are tightly length-limited, so pools lease a
/// one-character stem instead of embedding their full name. Leases are
/// created asynchronously; the reconcile that creates one records an
/// expectation and backs off until the lease watch confirms it.
pub struct GcpActuator {
    client: Client,
    expectations: Arc<Expectations>,
}

impl GcpActuator {
    pub fn new(client: Client, expectations: Arc<Expectations>) -> Self {
        GcpActuator {
            client,
            expectations,
        }
    }
}

#[async_trait]
impl Actuator for GcpActuator {
    async fn generate_machine_sets(
        &self,
        cd: &ClusterDeployment,
        pool: &MachinePool,
        ctx: &ActuatorContext<'_>,
    ) -> Result<Generated> {
        let Some(gcp) = pool.spec.platform.gcp.as_ref() else {
            return Err(mismatch_error(pool, PlatformKind::Gcp));
        };

        let skeleton = master_provider_spec(ctx.master_machine)?;
        let infra_id = cd.infra_id().unwrap_or_default();

        let stem = match leased_char(ctx.leases, &pool.spec.name) {
            Some(stem) => stem,
            None => {
                let used = used_chars(infra_id, ctx.leases, ctx.remote_machine_sets);
                let Some(stem) = next_free_char(&used) else {
                    return ConfigurationSnafu {
                        condition: MachinePoolConditionType::NoNameLeasesAvailable,
                        reason: "AllLeaseCharactersInUse",
                        message: format!(
                            "all {count} lease characters on cluster {cluster} are taken",
                            count = LEASE_ALPHABET.len(),
                            cluster = cd.name_any(),
                        ),
                    }
                    .fail();
                };

                let lease = build_lease(cd, pool, infra_id, stem);
                let leases: Api<MachinePoolNameLease> = Api::namespaced(
                    self.client.clone(),
                    &pool.namespace().unwrap_or_default(),
                );
                // Record the expectation before the write so a racing watch
                // event cannot be missed.
                let key = pool.tracking_key();
                self.expectations.expect_creations(&key, 1);
                if let Err(source) = leases.create(&PostParams::default(), &lease).await {
                    self.expectations.creation_observed(&key);
                    return Err(source).context(CreateLeaseSnafu {
                        name: lease.name_any(),
                    });
                }
                tracing::info!(lease = %lease.name_any(), "created name lease");
                return Ok(Generated::NotReady);
            }
        };

        let zones = match gcp.zones.as_ref() {
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

        let (replicas, bounds) = zone_replicas(pool, zones.len());
        let machine_sets = zones
            .iter()
            .enumerate()
            .map(|(i, zone)| {
                let mut provider_spec = skeleton.clone();
                set_field(&mut provider_spec, &["machineType"], json!(gcp.machine_type));
                set_field(&mut provider_spec, &["zone"], json!(zone));
                // Leased stem instead of the pool name; ownership rides on
                // the label.
                let name = format!("{infra_id}-{stem}-{zone}");
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

/// The stem already leased to this pool, if any.
fn leased_char(leases: &[MachinePoolNameLease], pool_name: &str) -> Option<char> {
    leases
        .iter()
        .filter(|lease| {
            lease
                .labels()
                .get(MACHINE_POOL_LABEL)
                .is_some_and(|owner| owner == pool_name)
        })
        .find_map(|lease| lease_suffix(&lease.name_any()))
}

/// Stems taken by any pool of the cluster, from both the lease records and
/// the machine set names already on the remote API.
fn used_chars(
    infra_id: &str,
    leases: &[MachinePoolNameLease],
    remote_machine_sets: &[MachineSet],
) -> BTreeSet<char> {
    let mut used: BTreeSet<char> = leases
        .iter()
        .filter_map(|lease| lease_suffix(&lease.name_any()))
        .collect();
    for machine_set in remote_machine_sets {
        if let Some(rest) = machine_set.name_any().strip_prefix(&format!("{infra_id}-")) {
            let mut segments = rest.splitn(2, '-');
            if let Some(stem) = segments.next() {
                let mut chars = stem.chars();
                if let (Some(c), None) = (chars.next(), chars.next()) {
                    used.insert(c);
                }
            }
        }
    }
    used
}

fn lease_suffix(name: &str) -> Option<char> {
    let (_, suffix) = name.rsplit_once('-')?;
    let mut chars = suffix.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

fn next_free_char(used: &BTreeSet<char>) -> Option<char> {
    LEASE_ALPHABET.chars().find(|c| !used.contains(c))
}

fn build_lease(
    cd: &ClusterDeployment,
    pool: &MachinePool,
    infra_id: &str,
    stem: char,
) -> MachinePoolNameLease {
    let mut lease = MachinePoolNameLease::new(
        &format!("{infra_id}-{stem}"),
        MachinePoolNameLeaseSpec {},
    );
    lease.metadata.namespace = pool.namespace();
    lease.metadata.labels = Some(BTreeMap::from([
        (MACHINE_POOL_LABEL.to_owned(), pool.spec.name.clone()),
        (CLUSTER_DEPLOYMENT_LABEL.to_owned(), cd.name_any()),
    ]));
    lease
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::machine_api::{MachineSetSpec, MachineSetTemplate, MachineSpec};

    fn lease(name: &str, pool: &str) -> MachinePoolNameLease {
        let mut lease = MachinePoolNameLease::new(name, MachinePoolNameLeaseSpec {});
        lease.metadata.labels = Some(BTreeMap::from([(
            MACHINE_POOL_LABEL.to_owned(),
            pool.to_owned(),
        )]));
        lease
    }

    fn machine_set(name: &str) -> MachineSet {
        MachineSet::new(
            name,
            MachineSetSpec {
                replicas: Some(1),
                template: MachineSetTemplate {
                    metadata: None,
                    spec: MachineSpec::default(),
                },
                ..MachineSetSpec::default()
            },
        )
    }

    #[test]
    fn a_pool_reuses_its_own_lease() {
        let leases = vec![lease("prod-x7f2k-a", "infra"), lease("prod-x7f2k-b", "worker")];
        assert_eq!(leased_char(&leases, "worker"), Some('b'));
        assert_eq!(leased_char(&leases, "compute"), None);
    }

    #[test]
    fn used_stems_combine_leases_and_remote_names() {
        let leases = vec![lease("prod-x7f2k-a", "infra")];
        let sets = vec![
            machine_set("prod-x7f2k-c-europe-west1-b"),
            machine_set("prod-x7f2k-worker-europe-west1-b"),
        ];
        let used = used_chars("prod-x7f2k", &leases, &sets);
        // 'a' from the lease, 'c' from the remote name; the full-length
        // "worker" stem is not a lease character
        assert_eq!(used, BTreeSet::from(['a', 'c']));
        assert_eq!(next_free_char(&used), Some('b'));
    }

    #[test]
    fn a_full_alphabet_means_no_lease() {
        let used: BTreeSet<char> = LEASE_ALPHABET.chars().collect();
        assert_eq!(next_free_char(&used), None);
    }
}
