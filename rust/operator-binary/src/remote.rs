//! Builds typed clients for the target cluster's API.
//!
//! The admin kubeconfig lives in a secret next to the cluster deployment.
//! Clients are memoized per cluster and invalidated when the secret content
//! changes. A missing secret means the cluster is not reachable yet, which
//! is a first-class return and not an error.

use std::{collections::HashMap, hash::Hasher};

use async_trait::async_trait;
use fnv::FnvHasher;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config, ResourceExt,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::Mutex;

use crate::crd::cluster_deployment::ClusterDeployment;

pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster {cluster} has no cluster metadata yet"))]
    MissingClusterMetadata { cluster: String },

    #[snafu(display("cluster {cluster} has no namespace"))]
    MissingNamespace { cluster: String },

    #[snafu(display("failed to read admin kubeconfig secret {name}"))]
    ReadKubeconfigSecret { source: kube::Error, name: String },

    #[snafu(display("admin kubeconfig secret {name} does not parse"))]
    MalformedKubeconfig { name: String },

    #[snafu(display("failed to build a client from the admin kubeconfig"))]
    BuildClient { source: kube::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

pub enum RemoteConnection {
    Connected(Client),
    /// The admin kubeconfig is not available (yet). Wait for an event.
    Unreachable,
}

#[async_trait]
pub trait RemoteClusterClientBuilder: Send + Sync {
    async fn build(&self, cd: &ClusterDeployment) -> Result<RemoteConnection>;
}

struct CachedClient {
    credentials_hash: u64,
    client: Client,
}

/// Production builder: reads the admin kubeconfig secret and caches the
/// resulting client keyed by cluster, hashed over the secret content.
pub struct KubeconfigClientBuilder {
    local: Client,
    cache: Mutex<HashMap<String, CachedClient>>,
}

impl KubeconfigClientBuilder {
    pub fn new(local: Client) -> Self {
        KubeconfigClientBuilder {
            local,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RemoteClusterClientBuilder for KubeconfigClientBuilder {
    async fn build(&self, cd: &ClusterDeployment) -> Result<RemoteConnection> {
        let namespace = cd.namespace().context(MissingNamespaceSnafu {
            cluster: cd.name_any(),
        })?;
        let secret_name = cd
            .spec
            .cluster_metadata
            .as_ref()
            .map(|m| m.admin_kubeconfig_secret_ref.name.clone())
            .context(MissingClusterMetadataSnafu {
                cluster: cd.name_any(),
            })?;

        let secrets: Api<Secret> = Api::namespaced(self.local.clone(), &namespace);
        let Some(secret) = secrets
            .get_opt(&secret_name)
            .await
            .context(ReadKubeconfigSecretSnafu {
                name: secret_name.clone(),
            })?
        else {
            return Ok(RemoteConnection::Unreachable);
        };
        let Some(raw) = secret
            .data
            .as_ref()
            .and_then(|data| data.get(KUBECONFIG_SECRET_KEY))
        else {
            return Ok(RemoteConnection::Unreachable);
        };

        let credentials_hash = {
            let mut hasher = FnvHasher::with_key(0);
            hasher.write(&raw.0);
            hasher.finish()
        };
        let cache_key = format!("{namespace}/{name}", name = cd.name_any());

        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&cache_key) {
                if cached.credentials_hash == credentials_hash {
                    return Ok(RemoteConnection::Connected(cached.client.clone()));
                }
            }
        }

        let yaml = std::str::from_utf8(&raw.0).ok().context(MalformedKubeconfigSnafu {
            name: secret_name.clone(),
        })?;
        let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|error| {
            tracing::debug!(%error, secret = %secret_name, "kubeconfig does not parse");
            Error::MalformedKubeconfig {
                name: secret_name.clone(),
            }
        })?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|error| {
                tracing::debug!(%error, secret = %secret_name, "kubeconfig is not usable");
                Error::MalformedKubeconfig {
                    name: secret_name.clone(),
                }
            })?;
        let client = Client::try_from(config).context(BuildClientSnafu)?;

        self.cache.lock().await.insert(
            cache_key,
            CachedClient {
                credentials_hash,
                client: client.clone(),
            },
        );
        Ok(RemoteConnection::Connected(client))
    }
}
