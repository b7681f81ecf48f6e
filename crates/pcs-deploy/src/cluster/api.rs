//! Cluster API access
//!
//! [`ClusterApi`] is all the resource manager needs from a cluster: create
//! and delete a typed manifest. [`KubeClusterApi`] implements it with kube-rs
//! and classifies failures so the caller can tell a cluster that is still
//! coming up from a request the cluster rejected.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource, ResourceExt};
use pcs_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error as ThisError;
use tracing::debug;

use super::manifest::ClusterManifest;

/// Connection timeout for cluster clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Read timeout for cluster clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a cluster call failed
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ClusterApiError {
    /// The API server did not answer in time
    #[error("connection to the cluster API timed out: {0}")]
    ConnectTimeout(String),
    /// The object does not exist
    #[error("{0} not found")]
    NotFound(String),
    /// The object already exists
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// Any other failure
    #[error("cluster API error for {resource}: {message}")]
    Other {
        /// `Kind/name`
        resource: String,
        /// Underlying error
        message: String,
    },
}

impl ClusterApiError {
    /// Whether the call may succeed once the cluster is reachable
    pub fn is_connect_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout(_))
    }
}

/// Create and delete typed manifests in a cluster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create `manifest` in `namespace`
    async fn create(
        &self,
        namespace: &str,
        manifest: &ClusterManifest,
    ) -> std::result::Result<(), ClusterApiError>;

    /// Delete the object `manifest` names from `namespace`
    async fn delete(
        &self,
        namespace: &str,
        manifest: &ClusterManifest,
    ) -> std::result::Result<(), ClusterApiError>;
}

/// Builds a [`ClusterApi`] for a downloaded kubeconfig
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect using the kubeconfig at `path`
    async fn connect(&self, path: &Path) -> Result<Arc<dyn ClusterApi>>;
}

/// [`ClusterConnector`] producing [`KubeClusterApi`] clients
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, path: &Path) -> Result<Arc<dyn ClusterApi>> {
        Ok(Arc::new(KubeClusterApi::from_kubeconfig(path).await?))
    }
}

/// kube-rs backed [`ClusterApi`]
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client for the kubeconfig at `path`, with bounded connect and read timeouts
    pub async fn from_kubeconfig(path: &Path) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path)
            .map_err(|e| Error::configuration_at(path, format!("failed to read kubeconfig: {}", e)))?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::configuration_at(path, format!("invalid kubeconfig: {}", e)))?;
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
        let client = Client::try_from(config)
            .map_err(|e| Error::configuration_at(path, format!("failed to create cluster client: {}", e)))?;
        Ok(Self::new(client))
    }
}

/// Whether an error chain bottoms out in a timeout
fn is_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        let message = e.to_string().to_lowercase();
        if message.contains("timed out") || message.contains("deadline has elapsed") {
            return true;
        }
        current = e.source();
    }
    false
}

/// Map a kube error for `resource` onto [`ClusterApiError`]
pub fn classify(err: kube::Error, resource: &str) -> ClusterApiError {
    match &err {
        kube::Error::Api(response) if response.code == 404 => {
            ClusterApiError::NotFound(resource.to_string())
        }
        kube::Error::Api(response) if response.code == 409 => {
            ClusterApiError::AlreadyExists(resource.to_string())
        }
        kube::Error::Api(_) => ClusterApiError::Other {
            resource: resource.to_string(),
            message: err.to_string(),
        },
        _ if is_timeout(&err) => ClusterApiError::ConnectTimeout(err.to_string()),
        _ => ClusterApiError::Other {
            resource: resource.to_string(),
            message: err.to_string(),
        },
    }
}

async fn create_namespaced<K>(
    client: &Client,
    namespace: &str,
    object: &K,
) -> std::result::Result<(), ClusterApiError>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned,
    K::DynamicType: Default,
{
    let resource = format!("{}/{}", K::kind(&K::DynamicType::default()), object.name_any());
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    api.create(&PostParams::default(), object)
        .await
        .map(|_| ())
        .map_err(|e| classify(e, &resource))
}

async fn delete_namespaced<K>(
    client: &Client,
    namespace: &str,
    object: &K,
) -> std::result::Result<(), ClusterApiError>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned,
    K::DynamicType: Default,
{
    let resource = format!("{}/{}", K::kind(&K::DynamicType::default()), object.name_any());
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    api.delete(&object.name_any(), &DeleteParams::default())
        .await
        .map(|_| ())
        .map_err(|e| classify(e, &resource))
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn create(
        &self,
        namespace: &str,
        manifest: &ClusterManifest,
    ) -> std::result::Result<(), ClusterApiError> {
        debug!(resource = %manifest.describe(), namespace = %namespace, "Creating cluster resource");
        let client = &self.client;
        match manifest {
            ClusterManifest::Namespace(ns) => {
                let api: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(client.clone());
                api.create(&PostParams::default(), ns)
                    .await
                    .map(|_| ())
                    .map_err(|e| classify(e, &manifest.describe()))
            }
            ClusterManifest::Secret(r) => create_namespaced(client, namespace, r).await,
            ClusterManifest::ConfigMap(r) => create_namespaced(client, namespace, r).await,
            ClusterManifest::Service(r) => create_namespaced(client, namespace, r).await,
            ClusterManifest::ReplicationController(r) => {
                create_namespaced(client, namespace, r).await
            }
            ClusterManifest::Deployment(r) => create_namespaced(client, namespace, r).await,
            ClusterManifest::Ingress(r) => create_namespaced(client, namespace, r).await,
        }
    }

    async fn delete(
        &self,
        namespace: &str,
        manifest: &ClusterManifest,
    ) -> std::result::Result<(), ClusterApiError> {
        debug!(resource = %manifest.describe(), namespace = %namespace, "Deleting cluster resource");
        let client = &self.client;
        match manifest {
            ClusterManifest::Namespace(ns) => {
                let api: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(client.clone());
                api.delete(&ns.name_any(), &DeleteParams::default())
                    .await
                    .map(|_| ())
                    .map_err(|e| classify(e, &manifest.describe()))
            }
            ClusterManifest::Secret(r) => delete_namespaced(client, namespace, r).await,
            ClusterManifest::ConfigMap(r) => delete_namespaced(client, namespace, r).await,
            ClusterManifest::Service(r) => delete_namespaced(client, namespace, r).await,
            ClusterManifest::ReplicationController(r) => {
                delete_namespaced(client, namespace, r).await
            }
            ClusterManifest::Deployment(r) => delete_namespaced(client, namespace, r).await,
            ClusterManifest::Ingress(r) => delete_namespaced(client, namespace, r).await,
        }
    }
}
