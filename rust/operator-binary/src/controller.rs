//! Per-pool reconcile state machine.
//!
//! Each queued pool is driven through the same sequence: re-fetch, seed
//! conditions, gate on expectations and on the parent cluster, install the
//! deletion guard, obtain a client for the target API, generate the desired
//! machine sets and sync them three-ways, then reconcile status. Writes are
//! idempotent; any failure aborts the pass and the next one re-diffs.

use std::{sync::Arc, time::Duration};

use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    runtime::controller::Action,
    Client, ResourceExt,
};
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    actuators::{self, ActuatorContext, ActuatorDeps, Generated},
    crd::{
        cluster_deployment::ClusterDeployment,
        machine_api::{
            ClusterAutoscaler, Machine, MachineAutoscaler, MachineSet, MachineTemplate,
            CLUSTER_AUTOSCALER_NAME, MACHINE_TYPE_LABEL,
        },
        ConditionStatus, MachinePool, MachinePoolConditionType, MachinePoolNameLease,
        MachinePoolStatus, CLUSTER_DEPLOYMENT_LABEL, MACHINE_API_NAMESPACE, MACHINE_POOL_LABEL,
    },
    expectations::Expectations,
    remote::{RemoteClusterClientBuilder, RemoteConnection},
    status::{self, REASON_ENOUGH_REPLICAS, REASON_MIN_REPLICAS_TOO_SMALL},
    sync::{self, ClusterAutoscalerWrite},
};

/// Requeue while a machine set is still converging; remote machine changes
/// do not otherwise reach this controller.
const UNSTEADY_REQUEUE: Duration = Duration::from_secs(10 * 60);

/// Requeue while owned groups drain during teardown.
const TEARDOWN_REQUEUE: Duration = Duration::from_secs(10);

pub struct Ctx {
    pub client: Client,
    pub remote_clients: Arc<dyn RemoteClusterClientBuilder>,
    pub expectations: Arc<Expectations>,
}

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("pool has no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to re-fetch pool"))]
    GetPool { source: kube::Error },

    #[snafu(display("failed to get cluster deployment {name}"))]
    GetClusterDeployment { source: kube::Error, name: String },

    #[snafu(display("failed to update pool status"))]
    ApplyStatus { source: kube::Error },

    #[snafu(display("failed to update pool finalizers"))]
    ApplyFinalizers { source: kube::Error },

    #[snafu(display("failed to build remote cluster client"))]
    BuildRemoteClient { source: crate::remote::Error },

    #[snafu(display("no master machine found on cluster {cluster}"))]
    NoMasterMachine { cluster: String },

    #[snafu(display("failed to list master machines"))]
    ListMasterMachines { source: kube::Error },

    #[snafu(display("failed to list machine sets"))]
    ListMachineSets { source: kube::Error },

    #[snafu(display("failed to list machines of {name}"))]
    ListMachines { source: kube::Error, name: String },

    #[snafu(display("failed to list name leases"))]
    ListNameLeases { source: kube::Error },

    #[snafu(display("failed to delete name lease {name}"))]
    DeleteNameLease { source: kube::Error, name: String },

    #[snafu(display("failed to list machine autoscalers"))]
    ListMachineAutoscalers { source: kube::Error },

    #[snafu(display("failed to list machine templates"))]
    ListMachineTemplates { source: kube::Error },

    #[snafu(display("actuator failed"))]
    Actuator { source: actuators::Error },

    #[snafu(display("failed to sync machine sets"))]
    SyncMachineSets { source: sync::Error },

    #[snafu(display("failed to sync machine autoscalers"))]
    SyncMachineAutoscalers { source: sync::Error },

    #[snafu(display("failed to sync machine templates"))]
    SyncMachineTemplates { source: sync::Error },

    #[snafu(display("failed to read cluster autoscaler"))]
    ReadClusterAutoscaler { source: kube::Error },

    #[snafu(display("failed to write cluster autoscaler"))]
    ApplyClusterAutoscaler { source: kube::Error },

    #[snafu(display(
        "cluster deployment {name} enables central machine management without a target namespace"
    ))]
    NoTargetNamespace { name: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// APIs the sync writes against. Under central machine management the
/// machine sets and templates move to the local cluster; the autoscaler
/// bindings and the singleton cluster autoscaler stay on the target
/// cluster either way.
struct TargetApis {
    /// Namespace the machine sets and templates land in.
    namespace: String,
    machine_sets: Api<MachineSet>,
    autoscalers: Api<MachineAutoscaler>,
    cluster_autoscaler: Api<ClusterAutoscaler>,
    templates: Option<Api<MachineTemplate>>,
    /// Machines always live on the target cluster.
    machines: Api<Machine>,
}

pub async fn reconcile(pool: Arc<MachinePool>, ctx: Arc<Ctx>) -> Result<Action> {
    tracing::info!("Starting reconcile");
    let namespace = pool.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let pools: Api<MachinePool> = Api::namespaced(ctx.client.clone(), &namespace);

    // The cached object may be stale; a tombstone also drops its
    // expectations here.
    let Some(pool) = pools.get_opt(&pool.name_any()).await.context(GetPoolSnafu)? else {
        ctx.expectations.forget(&pool.tracking_key());
        return Ok(Action::await_change());
    };

    let mut status = pool.status.clone().unwrap_or_default();
    if status::init_conditions(&mut status.conditions) {
        persist_status(&pools, &pool, &status).await?;
        return Ok(Action::requeue(Duration::ZERO));
    }

    if pool.is_deleting() && !pool.has_finalizer() {
        return Ok(Action::await_change());
    }

    if !ctx.expectations.satisfied(&pool.tracking_key()) {
        tracing::debug!("expectations not yet satisfied, waiting for the lease watch");
        return Ok(Action::await_change());
    }

    let cds: Api<ClusterDeployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let cd_name = pool.spec.cluster_deployment_ref.name.clone();
    let cd = match cds
        .get_opt(&cd_name)
        .await
        .context(GetClusterDeploymentSnafu { name: cd_name })?
    {
        None => {
            remove_finalizer(&pools, &pool).await?;
            return Ok(Action::await_change());
        }
        Some(cd) if cd.is_deleting() => {
            remove_finalizer(&pools, &pool).await?;
            return Ok(Action::await_change());
        }
        Some(cd) => cd,
    };

    if cd.is_paused() {
        tracing::info!("cluster deployment is paused or relocating");
        return Ok(Action::await_change());
    }
    if !cd.spec.installed {
        tracing::debug!("cluster is not installed yet");
        return Ok(Action::await_change());
    }
    if cd.spec.cluster_metadata.is_none() {
        tracing::info!("cluster has no metadata yet");
        return Ok(Action::await_change());
    }

    if !pool.has_finalizer() {
        add_finalizer(&pools, &pool).await?;
        return Ok(Action::requeue(Duration::ZERO));
    }

    if cd.is_fake() {
        return Ok(Action::await_change());
    }

    if let Some((reason, message)) = configuration_problem(&pool, &cd) {
        if status::set_condition(
            &mut status.conditions,
            MachinePoolConditionType::UnsupportedConfiguration,
            ConditionStatus::True,
            reason,
            &message,
        ) {
            persist_status(&pools, &pool, &status).await?;
        }
        return Ok(Action::await_change());
    }

    let remote = match ctx
        .remote_clients
        .build(&cd)
        .await
        .context(BuildRemoteClientSnafu)?
    {
        RemoteConnection::Connected(client) => client,
        RemoteConnection::Unreachable => {
            tracing::info!("remote cluster is not reachable yet");
            return Ok(Action::await_change());
        }
    };

    let machines: Api<Machine> = Api::namespaced(remote.clone(), MACHINE_API_NAMESPACE);
    let masters = machines
        .list(&ListParams::default().labels(&format!("{MACHINE_TYPE_LABEL}=master")))
        .await
        .context(ListMasterMachinesSnafu)?;
    let master = masters
        .items
        .into_iter()
        .next()
        .context(NoMasterMachineSnafu {
            cluster: cd.name_any(),
        })?;

    let apis = if cd.central_machine_management() {
        let target_namespace = cd
            .spec
            .machine_management
            .as_ref()
            .and_then(|m| m.target_namespace.clone())
            .context(NoTargetNamespaceSnafu {
                name: cd.name_any(),
            })?;
        TargetApis {
            machine_sets: Api::namespaced(ctx.client.clone(), &target_namespace),
            autoscalers: Api::namespaced(remote.clone(), MACHINE_API_NAMESPACE),
            cluster_autoscaler: Api::all(remote.clone()),
            templates: Some(Api::namespaced(ctx.client.clone(), &target_namespace)),
            machines,
            namespace: target_namespace,
        }
    } else {
        TargetApis {
            namespace: MACHINE_API_NAMESPACE.to_owned(),
            machine_sets: Api::namespaced(remote.clone(), MACHINE_API_NAMESPACE),
            autoscalers: Api::namespaced(remote.clone(), MACHINE_API_NAMESPACE),
            cluster_autoscaler: Api::all(remote.clone()),
            templates: None,
            machines,
        }
    };

    sync_pool(&ctx, &pools, &pool, status, &cd, &master, &apis).await
}

/// Engine-level spec validation ahead of actuator dispatch.
fn configuration_problem(
    pool: &MachinePool,
    cd: &ClusterDeployment,
) -> Option<(&'static str, String)> {
    if !pool.replica_settings_valid() {
        return Some((
            "InvalidReplicaSettings",
            "exactly one of replicas and autoscaling must be set".to_owned(),
        ));
    }
    let pool_platform = pool.spec.platform.kind();
    let cluster_platform = cd.spec.platform.kind();
    if pool_platform.is_none() || pool_platform != cluster_platform {
        return Some((
            "PlatformMismatch",
            format!(
                "pool platform does not match cluster platform of {cluster}",
                cluster = cd.name_any(),
            ),
        ));
    }
    None
}

/// The autoscaling minimum must cover one machine per zone, unless the
/// platform accepts zero-sized zones.
fn min_replicas_too_small(pool: &MachinePool, cd: &ClusterDeployment, zone_count: usize) -> bool {
    let Some(autoscaling) = pool.autoscaling() else {
        return false;
    };
    let Some(platform) = cd.spec.platform.kind() else {
        return false;
    };
    autoscaling.min_replicas < zone_count as i32
        && !actuators::allows_zero_min(platform, cd.version_label())
}

#[derive(Debug, Eq, PartialEq)]
enum TeardownStep {
    AwaitDrain,
    RemoveFinalizer,
}

/// Teardown gate for a deleting pool: the deletion guard may only come off
/// once no owned machine set is observed any more. Foreign groups in the
/// shared namespace never hold it.
fn teardown_step(remaining: &[MachineSet], infra_id: &str, pool_name: &str) -> TeardownStep {
    if remaining
        .iter()
        .any(|ms| sync::owned_by_pool(&ms.metadata, infra_id, pool_name))
    {
        TeardownStep::AwaitDrain
    } else {
        TeardownStep::RemoveFinalizer
    }
}

async fn sync_pool(
    ctx: &Ctx,
    pools: &Api<MachinePool>,
    pool: &MachinePool,
    mut status: MachinePoolStatus,
    cd: &ClusterDeployment,
    master: &Machine,
    apis: &TargetApis,
) -> Result<Action> {
    let observed = apis
        .machine_sets
        .list(&ListParams::default())
        .await
        .context(ListMachineSetsSnafu)?
        .items;

    let lease_api: Api<MachinePoolNameLease> = Api::namespaced(
        ctx.client.clone(),
        &pool.namespace().context(ObjectHasNoNamespaceSnafu)?,
    );
    let leases = lease_api
        .list(&ListParams::default().labels(&format!(
            "{CLUSTER_DEPLOYMENT_LABEL}={name}",
            name = cd.name_any()
        )))
        .await
        .context(ListNameLeasesSnafu)?
        .items;

    let deps = ActuatorDeps {
        local_client: ctx.client.clone(),
        expectations: ctx.expectations.clone(),
    };
    let actuator = match actuators::for_cluster(cd, &deps) {
        Ok(actuator) => actuator,
        Err(actuators::Error::UnsupportedPlatform { cluster }) => {
            if status::set_condition(
                &mut status.conditions,
                MachinePoolConditionType::UnsupportedConfiguration,
                ConditionStatus::True,
                "UnsupportedPlatform",
                &format!("cluster {cluster} has no platform this operator can actuate"),
            ) {
                persist_status(pools, pool, &status).await?;
            }
            return Ok(Action::await_change());
        }
        Err(source) => return Err(Error::Actuator { source }),
    };

    let actuator_ctx = ActuatorContext {
        master_machine: master,
        remote_machine_sets: &observed,
        leases: &leases,
        cluster_version: cd.version_label(),
    };

    let mut desired = if pool.is_deleting() {
        Vec::new()
    } else {
        match actuator.generate_machine_sets(cd, pool, &actuator_ctx).await {
            Ok(Generated::Ready(machine_sets)) => machine_sets,
            Ok(Generated::NotReady) => {
                tracing::debug!("desired state is not observable yet");
                return Ok(Action::await_change());
            }
            Err(actuators::Error::Configuration {
                condition,
                reason,
                message,
            }) => {
                if status::set_condition(
                    &mut status.conditions,
                    condition,
                    ConditionStatus::True,
                    &reason,
                    &message,
                ) {
                    persist_status(pools, pool, &status).await?;
                }
                return Ok(Action::await_change());
            }
            Err(source) => return Err(Error::Actuator { source }),
        }
    };
    // Central machine management hosts the objects in the configured local
    // namespace instead of the machine API namespace.
    for machine_set in &mut desired {
        machine_set.metadata.namespace = Some(apis.namespace.clone());
    }

    // Generation succeeded, so earlier configuration verdicts are stale
    status::set_condition(
        &mut status.conditions,
        MachinePoolConditionType::InvalidSubnets,
        ConditionStatus::False,
        "ValidSubnets",
        "subnets cover the zone spread",
    );
    status::set_condition(
        &mut status.conditions,
        MachinePoolConditionType::UnsupportedConfiguration,
        ConditionStatus::False,
        "SupportedConfiguration",
        "the pool configuration is supported",
    );

    if !pool.is_deleting() {
        if min_replicas_too_small(pool, cd, desired.len()) {
            status::set_condition(
                &mut status.conditions,
                MachinePoolConditionType::NotEnoughReplicas,
                ConditionStatus::True,
                REASON_MIN_REPLICAS_TOO_SMALL,
                &format!(
                    "minReplicas must cover all {zones} zones",
                    zones = desired.len()
                ),
            );
            persist_status(pools, pool, &status).await?;
            return Ok(Action::await_change());
        }
        if pool.autoscaling().is_some() {
            status::set_condition(
                &mut status.conditions,
                MachinePoolConditionType::NotEnoughReplicas,
                ConditionStatus::False,
                REASON_ENOUGH_REPLICAS,
                "the autoscaling minimum covers every zone",
            );
        }
    }

    let infra_id = cd.infra_id().unwrap_or_default().to_owned();
    let pool_name = pool.spec.name.clone();
    let autoscaling = pool.autoscaling().is_some();

    // Autoscaler bindings are derived from the desired sets before the plan
    // consumes them.
    let desired_autoscalers = if autoscaling && !pool.is_deleting() {
        sync::desired_machine_autoscalers(&desired)
    } else {
        Vec::new()
    };

    let plan = sync::plan_sync(
        desired,
        &observed,
        |ms: &MachineSet| sync::owned_by_pool(&ms.metadata, &infra_id, &pool_name),
        |o, d| sync::machine_set_drift(autoscaling, o, d),
    );
    sync::apply_sync(&apis.machine_sets, &plan)
        .await
        .context(SyncMachineSetsSnafu)?;

    let observed_autoscalers = apis
        .autoscalers
        .list(&ListParams::default())
        .await
        .context(ListMachineAutoscalersSnafu)?
        .items;
    let autoscaler_plan = sync::plan_sync(
        desired_autoscalers,
        &observed_autoscalers,
        |ma: &MachineAutoscaler| sync::owned_by_pool(&ma.metadata, &infra_id, &pool_name),
        sync::machine_autoscaler_drift,
    );
    sync::apply_sync(&apis.autoscalers, &autoscaler_plan)
        .await
        .context(SyncMachineAutoscalersSnafu)?;

    if autoscaling && !pool.is_deleting() {
        let existing = apis
            .cluster_autoscaler
            .get_opt(CLUSTER_AUTOSCALER_NAME)
            .await
            .context(ReadClusterAutoscalerSnafu)?;
        match sync::ensure_scale_down_enabled(existing) {
            Some(ClusterAutoscalerWrite::Create(autoscaler)) => {
                apis.cluster_autoscaler
                    .create(&PostParams::default(), &autoscaler)
                    .await
                    .context(ApplyClusterAutoscalerSnafu)?;
                tracing::info!("created cluster autoscaler");
            }
            Some(ClusterAutoscalerWrite::Update(autoscaler)) => {
                apis.cluster_autoscaler
                    .replace(CLUSTER_AUTOSCALER_NAME, &PostParams::default(), &autoscaler)
                    .await
                    .context(ApplyClusterAutoscalerSnafu)?;
                tracing::info!("enabled scale-down on the cluster autoscaler");
            }
            None => {}
        }
    }

    if let Some(templates_api) = apis.templates.as_ref() {
        sync_templates(
            pools,
            pool,
            &mut status,
            cd,
            &actuator_ctx,
            actuator.as_ref(),
            templates_api,
            &apis.namespace,
            &infra_id,
            &pool_name,
        )
        .await?;
    }

    // Post-apply view drives both the drain check and the status summary
    let remaining = apis
        .machine_sets
        .list(&ListParams::default())
        .await
        .context(ListMachineSetsSnafu)?
        .items;
    let owned_remaining: Vec<&MachineSet> = remaining
        .iter()
        .filter(|ms| sync::owned_by_pool(&ms.metadata, &infra_id, &pool_name))
        .collect();

    if pool.is_deleting() {
        if teardown_step(&remaining, &infra_id, &pool_name) == TeardownStep::AwaitDrain {
            return Ok(Action::requeue(TEARDOWN_REQUEUE));
        }
        // the pool's name leases go with it
        for lease in leases
            .iter()
            .filter(|lease| lease.labels().get(MACHINE_POOL_LABEL) == Some(&pool_name))
        {
            let name = lease.name_any();
            match lease_api.delete(&name, &Default::default()).await {
                Ok(_) => tracing::info!(lease = %name, "deleted name lease"),
                Err(kube::Error::Api(response)) if response.code == 404 => {}
                Err(source) => return Err(Error::DeleteNameLease { source, name }),
            }
        }
        status.machine_sets = Vec::new();
        status.replicas = Some(0);
        if pool.status.as_ref() != Some(&status) {
            persist_status(pools, pool, &status).await?;
        }
        remove_finalizer(pools, pool).await?;
        return Ok(Action::await_change());
    }

    let mut summaries = Vec::new();
    let mut unsteady = false;
    for machine_set in &owned_remaining {
        let mut summary = status::machine_set_summary(machine_set);
        if !status::machine_set_steady(machine_set) {
            unsteady = true;
        }
        if summary.error_reason.is_none()
            && summary.ready_replicas.unwrap_or(0) < summary.replicas.unwrap_or(0)
        {
            if let Some(selector) = machine_selector(machine_set) {
                let machines = apis
                    .machines
                    .list(&ListParams::default().labels(&selector))
                    .await
                    .context(ListMachinesSnafu {
                        name: summary.name.clone(),
                    })?;
                if let Some((reason, message)) = status::summarize_machine_failures(&machines.items)
                {
                    summary.error_reason = Some(reason);
                    summary.error_message = Some(message);
                }
            }
        }
        summaries.push(summary);
    }
    summaries.sort_by(|a, b| a.name.cmp(&b.name));

    status.replicas = Some(summaries.iter().map(|s| s.replicas.unwrap_or(0)).sum());
    status.machine_sets = summaries;
    if pool.status.as_ref() != Some(&status) {
        persist_status(pools, pool, &status).await?;
    }

    if unsteady {
        return Ok(Action::requeue(UNSTEADY_REQUEUE));
    }
    Ok(Action::await_change())
}

#[allow(clippy::too_many_arguments)]
async fn sync_templates(
    pools: &Api<MachinePool>,
    pool: &MachinePool,
    status: &mut MachinePoolStatus,
    cd: &ClusterDeployment,
    actuator_ctx: &ActuatorContext<'_>,
    actuator: &dyn actuators::Actuator,
    templates_api: &Api<MachineTemplate>,
    target_namespace: &str,
    infra_id: &str,
    pool_name: &str,
) -> Result<()> {
    let observed = templates_api
        .list(&ListParams::default())
        .await
        .context(ListMachineTemplatesSnafu)?
        .items;

    let mut desired = if pool.is_deleting() {
        Vec::new()
    } else {
        match actuator
            .generate_machine_templates(cd, pool, actuator_ctx)
            .await
        {
            Ok(templates) => templates,
            Err(actuators::Error::Configuration {
                condition,
                reason,
                message,
            }) => {
                if status::set_condition(
                    &mut status.conditions,
                    condition,
                    ConditionStatus::True,
                    &reason,
                    &message,
                ) {
                    persist_status(pools, pool, status).await?;
                }
                return Ok(());
            }
            Err(source) => return Err(Error::Actuator { source }),
        }
    };
    for template in &mut desired {
        template.metadata.namespace = Some(target_namespace.to_owned());
    }

    let plan = sync::plan_sync(
        desired,
        &observed,
        |t: &MachineTemplate| sync::owned_by_pool(&t.metadata, infra_id, pool_name),
        sync::machine_template_drift,
    );
    sync::apply_sync(templates_api, &plan)
        .await
        .context(SyncMachineTemplatesSnafu)?;
    Ok(())
}

fn machine_selector(machine_set: &MachineSet) -> Option<String> {
    let labels = machine_set.spec.selector.match_labels.as_ref()?;
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

async fn persist_status(
    pools: &Api<MachinePool>,
    pool: &MachinePool,
    status: &MachinePoolStatus,
) -> Result<()> {
    pools
        .patch_status(
            &pool.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await
        .context(ApplyStatusSnafu)?;
    Ok(())
}

async fn add_finalizer(pools: &Api<MachinePool>, pool: &MachinePool) -> Result<()> {
    let mut finalizers = pool.finalizers().to_vec();
    finalizers.push(crate::crd::MACHINE_POOL_FINALIZER.to_owned());
    patch_finalizers(pools, pool, finalizers).await
}

/// Idempotent; only issues a write while the guard is still present.
async fn remove_finalizer(pools: &Api<MachinePool>, pool: &MachinePool) -> Result<()> {
    if !pool.has_finalizer() {
        return Ok(());
    }
    let finalizers: Vec<String> = pool
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != crate::crd::MACHINE_POOL_FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(pools, pool, finalizers).await
}

async fn patch_finalizers(
    pools: &Api<MachinePool>,
    pool: &MachinePool,
    finalizers: Vec<String>,
) -> Result<()> {
    pools
        .patch(
            &pool.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
        )
        .await
        .context(ApplyFinalizersSnafu)?;
    Ok(())
}

pub fn error_policy(_pool: Arc<MachinePool>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    tracing::warn!(%error, "reconcile failed, requeueing");
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::crd::machine_api::{MachineSetSelector, MachineSetSpec};

    fn cluster(platform: &str) -> ClusterDeployment {
        serde_yaml::from_str(&format!(
            r#"
            apiVersion: hive.openshift.io/v1
            kind: ClusterDeployment
            metadata:
              name: prod
              namespace: hive
            spec:
              clusterName: prod
              installed: true
              platform:
                {platform}
            "#
        ))
        .expect("illegal test input")
    }

    fn pool(platform: &str, replica_stanza: &str) -> MachinePool {
        serde_yaml::from_str(&format!(
            r#"
            apiVersion: hive.openshift.io/v1
            kind: MachinePool
            metadata:
              name: prod-worker
              namespace: hive
            spec:
              clusterDeploymentRef:
                name: prod
              name: worker
              {replica_stanza}
              platform:
                {platform}
            "#
        ))
        .expect("illegal test input")
    }

    const AWS_CLUSTER: &str = r#"aws:
                  region: eu-central-1
                  credentialsSecretRef:
                    name: prod-aws-creds"#;
    const VSPHERE_CLUSTER: &str = r#"vsphere:
                  datacenter: dc1
                  credentialsSecretRef:
                    name: prod-vsphere-creds"#;

    #[test]
    fn platform_mismatch_is_a_configuration_problem() {
        let pool = pool(
            "aws:\n                  instanceType: m5.large",
            "replicas: 3",
        );
        let (reason, _) = configuration_problem(&pool, &cluster(VSPHERE_CLUSTER))
            .expect("mismatch must be rejected");
        assert_eq!(reason, "PlatformMismatch");
        assert!(configuration_problem(&pool, &cluster(AWS_CLUSTER)).is_none());
    }

    #[test]
    fn both_replica_settings_are_a_configuration_problem() {
        let pool = pool(
            "aws:\n                  instanceType: m5.large",
            "replicas: 3\n              autoscaling:\n                minReplicas: 1\n                maxReplicas: 4",
        );
        let (reason, _) = configuration_problem(&pool, &cluster(AWS_CLUSTER))
            .expect("double replica settings must be rejected");
        assert_eq!(reason, "InvalidReplicaSettings");
    }

    #[test]
    fn vsphere_min_must_cover_the_zones() {
        // three failure domains but a minimum of two machines
        let vsphere_pool = pool(
            "vsphere:\n                  numCpus: 4\n                  memoryMiB: 16384\n                  diskGiB: 120",
            "autoscaling:\n                minReplicas: 2\n                maxReplicas: 5",
        );
        assert!(min_replicas_too_small(&vsphere_pool, &cluster(VSPHERE_CLUSTER), 3));

        // aws accepts zero-sized zones, so the same shape passes there
        let aws_pool = pool(
            "aws:\n                  instanceType: m5.large",
            "autoscaling:\n                minReplicas: 2\n                maxReplicas: 5",
        );
        assert!(!min_replicas_too_small(&aws_pool, &cluster(AWS_CLUSTER), 3));
    }

    fn remote_machine_set(name: &str, pool_label: Option<&str>) -> MachineSet {
        let mut machine_set = MachineSet::new(name, MachineSetSpec::default());
        if let Some(pool) = pool_label {
            machine_set.metadata.labels = Some(BTreeMap::from([(
                MACHINE_POOL_LABEL.to_owned(),
                pool.to_owned(),
            )]));
        }
        machine_set
    }

    #[test]
    fn finalizer_is_held_while_owned_groups_are_observed() {
        let owned_by_prefix = remote_machine_set("prod-x7f2k-worker-eu-central-1a", None);
        assert_eq!(
            teardown_step(&[owned_by_prefix], "prod-x7f2k", "worker"),
            TeardownStep::AwaitDrain
        );

        // leased names carry no pool prefix; the label alone holds the guard
        let owned_by_label = remote_machine_set("prod-x7f2k-b-europe-west1-b", Some("worker"));
        assert_eq!(
            teardown_step(&[owned_by_label], "prod-x7f2k", "worker"),
            TeardownStep::AwaitDrain
        );
    }

    #[test]
    fn foreign_groups_never_hold_the_finalizer() {
        let foreign = remote_machine_set("prod-x7f2k-infra-eu-central-1a", Some("infra"));
        assert_eq!(
            teardown_step(&[foreign], "prod-x7f2k", "worker"),
            TeardownStep::RemoveFinalizer
        );
        assert_eq!(
            teardown_step(&[], "prod-x7f2k", "worker"),
            TeardownStep::RemoveFinalizer
        );
    }

    #[test]
    fn machine_selectors_render_as_label_queries() {
        let mut machine_set = MachineSet::new("prod-x7f2k-worker-a", MachineSetSpec::default());
        assert_eq!(machine_selector(&machine_set), None);

        machine_set.spec.selector = MachineSetSelector {
            match_labels: Some(BTreeMap::from([
                (
                    "machine.openshift.io/cluster-api-cluster".to_owned(),
                    "prod-x7f2k".to_owned(),
                ),
                (
                    "machine.openshift.io/cluster-api-machineset".to_owned(),
                    "prod-x7f2k-worker-a".to_owned(),
                ),
            ])),
        };
        assert_eq!(
            machine_selector(&machine_set).as_deref(),
            Some(
                "machine.openshift.io/cluster-api-cluster=prod-x7f2k,\
                 machine.openshift.io/cluster-api-machineset=prod-x7f2k-worker-a"
            )
        );
    }
}
