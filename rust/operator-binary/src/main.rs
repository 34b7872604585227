#![allow(clippy::result_large_err)]

mod actuators;
mod apportion;
mod controller;
mod crd;
mod expectations;
mod remote;
mod status;
mod sync;
mod trigger;

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::{
    api::Api,
    core::NamespaceResourceScope,
    runtime::{
        reflector::{self, ObjectRef},
        watcher, Controller, WatchStreamExt,
    },
    Client, CustomResourceExt, ResourceExt,
};
use tracing_subscriber::EnvFilter;

use crate::{
    controller::Ctx,
    crd::{
        cluster_deployment::ClusterDeployment, MachinePool, MachinePoolNameLease,
        CLUSTER_DEPLOYMENT_LABEL, MACHINE_POOL_LABEL,
    },
    expectations::Expectations,
    remote::KubeconfigClientBuilder,
};

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Print the CRD schemas this operator serves
    Crd,
    /// Run the controller
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Restrict all watches to one namespace
    #[clap(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Reconciles processed in parallel; each pool stays serialized
    #[clap(long, default_value_t = 16)]
    concurrency: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => {
            for crd in [
                serde_yaml::to_string(&MachinePool::crd())?,
                serde_yaml::to_string(&MachinePoolNameLease::crd())?,
                serde_yaml::to_string(&ClusterDeployment::crd())?,
            ] {
                println!("---");
                print!("{crd}");
            }
        }
        Command::Run(args) => run(args).await?,
    }
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let client = Client::try_default().await?;
    let expectations = Arc::new(Expectations::default());

    let pools: Api<MachinePool> = namespaced_or_all(&client, args.watch_namespace.as_deref());
    let leases: Api<MachinePoolNameLease> =
        namespaced_or_all(&client, args.watch_namespace.as_deref());
    let clusters: Api<ClusterDeployment> =
        namespaced_or_all(&client, args.watch_namespace.as_deref());

    // The primary watch is predicate-filtered: only error-condition
    // transitions admit a pool update. Spec edits converge through the
    // periodic source, child and cluster events through the watches below.
    let (reader, writer) = reflector::store();
    let pool_stream = watcher(pools, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(trigger::error_condition_fingerprint);

    let store = reader.clone();
    let lease_expectations = expectations.clone();

    Controller::for_stream(pool_stream, reader)
        .watches(
            leases,
            watcher::Config::default(),
            move |lease: MachinePoolNameLease| {
                let pool_ref = owning_pool(&lease);
                if let Some(pool_ref) = pool_ref.as_ref() {
                    // Seeing the lease satisfies the expectation its
                    // creation recorded
                    lease_expectations.creation_observed(&format!(
                        "{namespace}/{name}",
                        namespace = pool_ref.namespace.as_deref().unwrap_or_default(),
                        name = pool_ref.name,
                    ));
                }
                pool_ref
            },
        )
        .watches(
            clusters,
            watcher::Config::default(),
            move |cluster: ClusterDeployment| {
                let name = cluster.name_any();
                let namespace = cluster.namespace();
                store
                    .state()
                    .into_iter()
                    .filter(move |pool| {
                        pool.spec.cluster_deployment_ref.name == name
                            && pool.namespace() == namespace
                    })
                    .map(|pool| ObjectRef::from_obj(&*pool))
            },
        )
        .reconcile_all_on(trigger::periodic_ticks(trigger::SYNC_PERIOD))
        .shutdown_on_signal()
        .run(
            controller::reconcile,
            controller::error_policy,
            Arc::new(Ctx {
                client: client.clone(),
                remote_clients: Arc::new(KubeconfigClientBuilder::new(client.clone())),
                expectations,
            }),
        )
        .for_each_concurrent(args.concurrency, |result| async move {
            match result {
                Ok((object, _action)) => tracing::debug!(%object, "reconciled"),
                Err(error) => tracing::warn!(%error, "reconcile dispatch failed"),
            }
        })
        .await;

    Ok(())
}

/// Routes a lease event back to the pool that owns it. Pools are named
/// `<clusterDeployment>-<poolName>`, which the lease labels reconstruct.
fn owning_pool(lease: &MachinePoolNameLease) -> Option<ObjectRef<MachinePool>> {
    let labels = lease.labels();
    let cluster = labels.get(CLUSTER_DEPLOYMENT_LABEL)?;
    let pool = labels.get(MACHINE_POOL_LABEL)?;
    let namespace = lease.namespace()?;
    Some(ObjectRef::new(&format!("{cluster}-{pool}")).within(&namespace))
}

fn namespaced_or_all<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}
