//! Three-way synchronization of desired against observed objects.
//!
//! One generic planning routine serves machine sets, machine autoscalers and
//! machine templates; per-kind logic lives in the drift predicates. Deletion
//! is scoped by ownership so foreign objects in the shared namespace are
//! never touched.

use std::collections::{BTreeMap, BTreeSet};

use kube::{
    api::{Api, DeleteParams, ObjectMeta, PostParams},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use snafu::{ResultExt, Snafu};

use crate::{
    apportion::ZoneBounds,
    crd::{
        machine_api::{
            ClusterAutoscaler, ClusterAutoscalerSpec, MachineAutoscaler, MachineAutoscalerSpec,
            MachineSet, MachineTemplate, ScaleDownConfig, ScaleTargetRef, CLUSTER_AUTOSCALER_NAME,
        },
        TaintSpec, AUTOSCALER_MAX_ANNOTATION, AUTOSCALER_MIN_ANNOTATION, CLUSTER_DEPLOYMENT_LABEL,
        MACHINE_API_NAMESPACE, MACHINE_POOL_LABEL,
    },
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create {name}"))]
    CreateObject { source: kube::Error, name: String },

    #[snafu(display("failed to update {name}"))]
    UpdateObject { source: kube::Error, name: String },

    #[snafu(display("failed to delete {name}"))]
    DeleteObject { source: kube::Error, name: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// An observed object belongs to a pool iff its name carries the generated
/// prefix or it is labeled with the pool name. Everything else is foreign
/// and out of bounds.
pub fn owned_by_pool(meta: &ObjectMeta, infra_id: &str, pool_name: &str) -> bool {
    let prefix = format!("{infra_id}-{pool_name}-");
    let named = meta
        .name
        .as_deref()
        .is_some_and(|name| name.starts_with(&prefix));
    let labeled = meta
        .labels
        .as_ref()
        .and_then(|labels| labels.get(MACHINE_POOL_LABEL))
        .is_some_and(|value| value == pool_name);
    named || labeled
}

#[derive(Debug)]
pub struct SyncPlan<K> {
    pub creates: Vec<K>,
    pub updates: Vec<K>,
    pub deletes: Vec<K>,
}

impl<K> SyncPlan<K> {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Computes the three disjoint write sets, keyed by name.
///
/// `drift` receives (observed, desired) and returns the mutated object when
/// the observed one has drifted. `owned` scopes the delete set; a desired
/// set of zero (pool deletion) turns this into a teardown plan.
pub fn plan_sync<K, O, D>(desired: Vec<K>, observed: &[K], owned: O, drift: D) -> SyncPlan<K>
where
    K: Resource + Clone,
    O: Fn(&K) -> bool,
    D: Fn(&K, &K) -> Option<K>,
{
    let observed_names: BTreeSet<String> = observed.iter().map(|o| o.name_any()).collect();
    let desired_by_name: BTreeMap<String, &K> =
        desired.iter().map(|d| (d.name_any(), d)).collect();

    let mut updates = Vec::new();
    let mut deletes = Vec::new();
    for existing in observed {
        match desired_by_name.get(&existing.name_any()) {
            Some(wanted) => {
                if let Some(updated) = drift(existing, wanted) {
                    updates.push(updated);
                }
            }
            None => {
                if owned(existing) {
                    deletes.push(existing.clone());
                }
            }
        }
    }

    let creates = desired
        .into_iter()
        .filter(|d| !observed_names.contains(&d.name_any()))
        .collect();

    SyncPlan {
        creates,
        updates,
        deletes,
    }
}

/// Applies a plan in Create, Update, Delete order. Every write is
/// independent; the first failure aborts and the next reconcile re-diffs.
/// Returns the number of writes issued.
pub async fn apply_sync<K>(api: &Api<K>, plan: &SyncPlan<K>) -> Result<usize>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    let kind = K::kind(&());
    let mut writes = 0;

    for obj in &plan.creates {
        let name = obj.name_any();
        api.create(&PostParams::default(), obj)
            .await
            .context(CreateObjectSnafu { name: name.clone() })?;
        tracing::info!(%kind, %name, "created object");
        writes += 1;
    }
    for obj in &plan.updates {
        let name = obj.name_any();
        api.replace(&name, &PostParams::default(), obj)
            .await
            .context(UpdateObjectSnafu { name: name.clone() })?;
        tracing::info!(%kind, %name, "updated object");
        writes += 1;
    }
    for obj in &plan.deletes {
        let name = obj.name_any();
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                tracing::info!(%kind, %name, "deleted object");
                writes += 1;
            }
            // Someone beat us to it, which is what we wanted anyway
            Err(kube::Error::Api(response)) if response.code == 404 => {}
            Err(source) => return Err(Error::DeleteObject { source, name }),
        }
    }

    Ok(writes)
}

/// Autoscaling bounds carried on a generated machine set.
pub fn autoscaling_bounds(machine_set: &MachineSet) -> Option<ZoneBounds> {
    let annotations = machine_set.metadata.annotations.as_ref()?;
    let min = annotations.get(AUTOSCALER_MIN_ANNOTATION)?.parse().ok()?;
    let max = annotations.get(AUTOSCALER_MAX_ANNOTATION)?.parse().ok()?;
    Some(ZoneBounds { min, max })
}

/// Drift predicate for machine sets.
///
/// Metadata uses ensure semantics: entries we manage are (re)asserted,
/// foreign labels and annotations are preserved. Replicas are authoritative
/// without autoscaling and clamped into the zone bounds with it (when
/// min == max the autoscaler ignores the group, so the bound is enforced
/// here). Template labels and taints compare by deep equality, treating
/// empty and absent as equal.
pub fn machine_set_drift(
    autoscaling: bool,
    observed: &MachineSet,
    desired: &MachineSet,
) -> Option<MachineSet> {
    let mut updated = observed.clone();
    let mut changed = false;

    changed |= ensure_map_entries(&mut updated.metadata.labels, desired.metadata.labels.as_ref());
    changed |= ensure_map_entries(
        &mut updated.metadata.annotations,
        desired.metadata.annotations.as_ref(),
    );

    let replicas = if autoscaling {
        clamped_replicas(observed.spec.replicas, desired)
    } else {
        desired.spec.replicas
    };
    if updated.spec.replicas != replicas {
        updated.spec.replicas = replicas;
        changed = true;
    }

    let observed_labels = observed
        .spec
        .template
        .spec
        .metadata
        .as_ref()
        .and_then(|m| m.labels.as_ref());
    let desired_labels = desired
        .spec
        .template
        .spec
        .metadata
        .as_ref()
        .and_then(|m| m.labels.as_ref());
    if !maps_equal(observed_labels, desired_labels) {
        updated.spec.template.spec.metadata = desired.spec.template.spec.metadata.clone();
        changed = true;
    }

    if !taints_equal(
        observed.spec.template.spec.taints.as_deref(),
        desired.spec.template.spec.taints.as_deref(),
    ) {
        updated.spec.template.spec.taints = desired.spec.template.spec.taints.clone();
        changed = true;
    }

    if changed {
        bump_generation(&mut updated.metadata);
        Some(updated)
    } else {
        None
    }
}

fn clamped_replicas(current: Option<i32>, desired: &MachineSet) -> Option<i32> {
    match autoscaling_bounds(desired) {
        None => desired.spec.replicas,
        Some(bounds) => match current {
            None => Some(bounds.min),
            Some(replicas) if replicas < bounds.min => Some(bounds.min),
            Some(replicas) if replicas > bounds.max => Some(bounds.max),
            Some(replicas) => Some(replicas),
        },
    }
}

/// One machine autoscaler per generated machine set, named after it. The
/// bindings live in the machine API namespace of the target cluster even
/// when the machine sets themselves are managed on the local cluster.
pub fn desired_machine_autoscalers(machine_sets: &[MachineSet]) -> Vec<MachineAutoscaler> {
    machine_sets
        .iter()
        .filter_map(|machine_set| {
            let bounds = autoscaling_bounds(machine_set)?;
            let name = machine_set.name_any();
            let mut autoscaler = MachineAutoscaler::new(
                &name,
                MachineAutoscalerSpec {
                    min_replicas: bounds.min,
                    max_replicas: bounds.max,
                    scale_target_ref: ScaleTargetRef {
                        api_version: "machine.openshift.io/v1beta1".to_owned(),
                        kind: "MachineSet".to_owned(),
                        name: name.clone(),
                    },
                },
            );
            autoscaler.metadata.namespace = Some(MACHINE_API_NAMESPACE.to_owned());
            autoscaler.metadata.labels = Some(ownership_labels(machine_set));
            Some(autoscaler)
        })
        .collect()
}

fn ownership_labels(machine_set: &MachineSet) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    if let Some(source) = machine_set.metadata.labels.as_ref() {
        for key in [MACHINE_POOL_LABEL, CLUSTER_DEPLOYMENT_LABEL] {
            if let Some(value) = source.get(key) {
                labels.insert(key.to_owned(), value.clone());
            }
        }
    }
    labels
}

pub fn machine_autoscaler_drift(
    observed: &MachineAutoscaler,
    desired: &MachineAutoscaler,
) -> Option<MachineAutoscaler> {
    if observed.spec.min_replicas == desired.spec.min_replicas
        && observed.spec.max_replicas == desired.spec.max_replicas
    {
        return None;
    }
    let mut updated = observed.clone();
    updated.spec.min_replicas = desired.spec.min_replicas;
    updated.spec.max_replicas = desired.spec.max_replicas;
    bump_generation(&mut updated.metadata);
    Some(updated)
}

/// Drift predicate for infrastructure templates under central machine
/// management. Only metadata is inspected.
// TODO: also diff spec.template payloads once the actuators normalize
// provider specs well enough to compare them field by field.
pub fn machine_template_drift(
    observed: &MachineTemplate,
    desired: &MachineTemplate,
) -> Option<MachineTemplate> {
    let mut updated = observed.clone();
    let mut changed = false;
    changed |= ensure_map_entries(&mut updated.metadata.labels, desired.metadata.labels.as_ref());
    changed |= ensure_map_entries(
        &mut updated.metadata.annotations,
        desired.metadata.annotations.as_ref(),
    );
    if changed {
        bump_generation(&mut updated.metadata);
        Some(updated)
    } else {
        None
    }
}

/// Pending write against the singleton cluster autoscaler.
#[derive(Debug)]
pub enum ClusterAutoscalerWrite {
    Create(ClusterAutoscaler),
    Update(ClusterAutoscaler),
}

/// With any autoscaling pool present, scale-down must be enabled. The
/// singleton is created if absent and fixed up if disabled; it is never
/// deleted here.
pub fn ensure_scale_down_enabled(
    existing: Option<ClusterAutoscaler>,
) -> Option<ClusterAutoscalerWrite> {
    match existing {
        None => Some(ClusterAutoscalerWrite::Create(ClusterAutoscaler::new(
            CLUSTER_AUTOSCALER_NAME,
            ClusterAutoscalerSpec {
                scale_down: Some(ScaleDownConfig { enabled: true }),
            },
        ))),
        Some(existing)
            if existing
                .spec
                .scale_down
                .as_ref()
                .is_some_and(|sd| sd.enabled) =>
        {
            None
        }
        Some(mut existing) => {
            existing.spec.scale_down = Some(ScaleDownConfig { enabled: true });
            bump_generation(&mut existing.metadata);
            Some(ClusterAutoscalerWrite::Update(existing))
        }
    }
}

fn bump_generation(meta: &mut ObjectMeta) {
    meta.generation = Some(meta.generation.unwrap_or_default() + 1);
}

/// Asserts the wanted entries into the map, preserving everything else.
fn ensure_map_entries(
    into: &mut Option<BTreeMap<String, String>>,
    wanted: Option<&BTreeMap<String, String>>,
) -> bool {
    let Some(wanted) = wanted else {
        return false;
    };
    if wanted.is_empty() {
        return false;
    }
    let target = into.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (key, value) in wanted {
        if target.get(key) != Some(value) {
            target.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

fn maps_equal(a: Option<&BTreeMap<String, String>>, b: Option<&BTreeMap<String, String>>) -> bool {
    a.filter(|m| !m.is_empty()) == b.filter(|m| !m.is_empty())
}

fn taints_equal(a: Option<&[TaintSpec]>, b: Option<&[TaintSpec]>) -> bool {
    a.filter(|t| !t.is_empty()) == b.filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::machine_api::{MachineSetSpec, MachineSetTemplate, MachineSpec, TemplateMetadata};

    const INFRA_ID: &str = "prod-x7f2k";
    const POOL: &str = "worker";

    fn machine_set(name: &str, replicas: Option<i32>) -> MachineSet {
        let mut ms = MachineSet::new(
            name,
            MachineSetSpec {
                replicas,
                template: MachineSetTemplate {
                    metadata: None,
                    spec: MachineSpec::default(),
                },
                ..MachineSetSpec::default()
            },
        );
        ms.metadata.labels = Some(BTreeMap::from([(
            MACHINE_POOL_LABEL.to_owned(),
            POOL.to_owned(),
        )]));
        ms
    }

    fn with_bounds(mut ms: MachineSet, min: i32, max: i32) -> MachineSet {
        ms.metadata.annotations.get_or_insert_with(BTreeMap::new).extend([
            (AUTOSCALER_MIN_ANNOTATION.to_owned(), min.to_string()),
            (AUTOSCALER_MAX_ANNOTATION.to_owned(), max.to_string()),
        ]);
        ms
    }

    fn owned(ms: &MachineSet) -> bool {
        owned_by_pool(&ms.metadata, INFRA_ID, POOL)
    }

    #[test]
    fn ownership_by_prefix_or_label() {
        let by_prefix = ObjectMeta {
            name: Some("prod-x7f2k-worker-eu-central-1a".to_owned()),
            ..ObjectMeta::default()
        };
        assert!(owned_by_pool(&by_prefix, INFRA_ID, POOL));

        let by_label = ObjectMeta {
            name: Some("prod-x7f2k-w-eu-central-1a".to_owned()),
            labels: Some(BTreeMap::from([(
                MACHINE_POOL_LABEL.to_owned(),
                POOL.to_owned(),
            )])),
            ..ObjectMeta::default()
        };
        assert!(owned_by_pool(&by_label, INFRA_ID, POOL));

        let foreign = ObjectMeta {
            name: Some("prod-x7f2k-infra-eu-central-1a".to_owned()),
            labels: Some(BTreeMap::from([(
                MACHINE_POOL_LABEL.to_owned(),
                "infra".to_owned(),
            )])),
            ..ObjectMeta::default()
        };
        assert!(!owned_by_pool(&foreign, INFRA_ID, POOL));
    }

    #[test]
    fn fresh_pool_creates_every_zone() {
        let desired = vec![
            machine_set("prod-x7f2k-worker-a", Some(2)),
            machine_set("prod-x7f2k-worker-b", Some(2)),
            machine_set("prod-x7f2k-worker-c", Some(1)),
        ];
        let plan = plan_sync(desired, &[], owned, |o, d| machine_set_drift(false, o, d));
        assert_eq!(plan.creates.len(), 3);
        assert!(plan.updates.is_empty());
        assert!(plan.deletes.is_empty());
        let replicas: Vec<_> = plan.creates.iter().map(|ms| ms.spec.replicas).collect();
        assert_eq!(replicas, vec![Some(2), Some(2), Some(1)]);
    }

    #[test]
    fn converged_state_plans_zero_writes() {
        let desired = vec![machine_set("prod-x7f2k-worker-a", Some(2))];
        let observed = vec![machine_set("prod-x7f2k-worker-a", Some(2))];
        let plan = plan_sync(desired, &observed, owned, |o, d| {
            machine_set_drift(false, o, d)
        });
        assert!(plan.is_empty());
    }

    #[test]
    fn replica_drift_is_restored_without_autoscaling() {
        // A user hand-edited the remote group from 2 up to 9
        let desired = vec![machine_set("prod-x7f2k-worker-a", Some(2))];
        let observed = vec![machine_set("prod-x7f2k-worker-a", Some(9))];
        let plan = plan_sync(desired, &observed, owned, |o, d| {
            machine_set_drift(false, o, d)
        });
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].spec.replicas, Some(2));
        assert_eq!(plan.updates[0].metadata.generation, Some(1));
    }

    #[test]
    fn autoscaling_clamps_instead_of_overwriting() {
        let desired = with_bounds(machine_set("prod-x7f2k-worker-a", Some(1)), 1, 3);

        // inside the bounds: left alone
        let observed = vec![machine_set("prod-x7f2k-worker-a", Some(2))];
        let plan = plan_sync(vec![desired.clone()], &observed, owned, |o, d| {
            machine_set_drift(true, o, d)
        });
        assert!(plan.updates.is_empty());

        // above max: clamped down
        let observed = vec![machine_set("prod-x7f2k-worker-a", Some(9))];
        let plan = plan_sync(vec![desired.clone()], &observed, owned, |o, d| {
            machine_set_drift(true, o, d)
        });
        assert_eq!(plan.updates[0].spec.replicas, Some(3));

        // unset: pinned to min
        let observed = vec![machine_set("prod-x7f2k-worker-a", None)];
        let plan = plan_sync(vec![desired], &observed, owned, |o, d| {
            machine_set_drift(true, o, d)
        });
        assert_eq!(plan.updates[0].spec.replicas, Some(1));
    }

    #[test]
    fn teardown_deletes_only_owned_objects() {
        let mut foreign = machine_set("prod-x7f2k-infra-a", Some(1));
        foreign.metadata.labels = Some(BTreeMap::from([(
            MACHINE_POOL_LABEL.to_owned(),
            "infra".to_owned(),
        )]));
        let observed = vec![
            machine_set("prod-x7f2k-worker-a", Some(2)),
            machine_set("prod-x7f2k-worker-b", Some(2)),
            machine_set("prod-x7f2k-worker-c", Some(1)),
            foreign,
        ];
        let plan = plan_sync(Vec::new(), &observed, owned, |o, d| {
            machine_set_drift(false, o, d)
        });
        assert!(plan.creates.is_empty());
        assert!(plan.updates.is_empty());
        let deleted: Vec<_> = plan.deletes.iter().map(|ms| ms.name_any()).collect();
        assert_eq!(
            deleted,
            vec![
                "prod-x7f2k-worker-a",
                "prod-x7f2k-worker-b",
                "prod-x7f2k-worker-c"
            ]
        );
    }

    #[test]
    fn metadata_merge_preserves_foreign_entries() {
        let mut desired = machine_set("prod-x7f2k-worker-a", Some(2));
        desired
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(CLUSTER_DEPLOYMENT_LABEL.to_owned(), "prod".to_owned());

        let mut observed = machine_set("prod-x7f2k-worker-a", Some(2));
        observed.metadata.labels = Some(BTreeMap::from([(
            "team.example.com/cost-center".to_owned(),
            "1234".to_owned(),
        )]));

        let updated = machine_set_drift(false, &observed, &desired).expect("drift expected");
        let labels = updated.metadata.labels.expect("labels");
        assert_eq!(labels.get("team.example.com/cost-center").unwrap(), "1234");
        assert_eq!(labels.get(CLUSTER_DEPLOYMENT_LABEL).unwrap(), "prod");
        assert_eq!(labels.get(MACHINE_POOL_LABEL).unwrap(), POOL);
    }

    #[test]
    fn template_labels_compare_with_empty_as_absent() {
        let mut desired = machine_set("prod-x7f2k-worker-a", Some(2));
        desired.spec.template.spec.metadata = Some(TemplateMetadata {
            labels: Some(BTreeMap::new()),
        });
        let observed = machine_set("prod-x7f2k-worker-a", Some(2));
        assert!(machine_set_drift(false, &observed, &desired).is_none());
    }

    #[test]
    fn autoscaler_bindings_follow_the_machine_sets() {
        let sets = vec![
            with_bounds(machine_set("prod-x7f2k-worker-a", Some(2)), 2, 3),
            with_bounds(machine_set("prod-x7f2k-worker-b", Some(1)), 1, 2),
        ];
        let autoscalers = desired_machine_autoscalers(&sets);
        assert_eq!(autoscalers.len(), 2);
        assert_eq!(autoscalers[0].spec.min_replicas, 2);
        assert_eq!(autoscalers[0].spec.max_replicas, 3);
        assert_eq!(autoscalers[0].spec.scale_target_ref.name, "prod-x7f2k-worker-a");
        assert_eq!(
            autoscalers[0].metadata.namespace.as_deref(),
            Some(MACHINE_API_NAMESPACE)
        );
        assert_eq!(
            autoscalers[0]
                .metadata
                .labels
                .as_ref()
                .unwrap()
                .get(MACHINE_POOL_LABEL)
                .unwrap(),
            POOL
        );

        // plain machine sets without bounds produce no bindings
        assert!(desired_machine_autoscalers(&[machine_set("x", Some(1))]).is_empty());
    }

    #[test]
    fn cluster_autoscaler_is_created_or_repaired_never_deleted() {
        let Some(ClusterAutoscalerWrite::Create(created)) = ensure_scale_down_enabled(None) else {
            panic!("expected a create");
        };
        assert_eq!(created.name_any(), CLUSTER_AUTOSCALER_NAME);
        assert!(created.spec.scale_down.unwrap().enabled);

        let disabled = ClusterAutoscaler::new(
            CLUSTER_AUTOSCALER_NAME,
            ClusterAutoscalerSpec {
                scale_down: Some(ScaleDownConfig { enabled: false }),
            },
        );
        let Some(ClusterAutoscalerWrite::Update(updated)) =
            ensure_scale_down_enabled(Some(disabled))
        else {
            panic!("expected an update");
        };
        assert!(updated.spec.scale_down.unwrap().enabled);

        let enabled = ClusterAutoscaler::new(
            CLUSTER_AUTOSCALER_NAME,
            ClusterAutoscalerSpec {
                scale_down: Some(ScaleDownConfig { enabled: true }),
            },
        );
        assert!(ensure_scale_down_enabled(Some(enabled)).is_none());
    }
}
