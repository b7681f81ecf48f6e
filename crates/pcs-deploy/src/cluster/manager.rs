//! Ordered setup and teardown of the solution's cluster resources
//!
//! Resources go in as stages: namespace, TLS secret, ConfigMap, then every
//! workload from the all-in-one template. All calls of a stage run
//! concurrently and the next stage starts only once the whole stage
//! settled, so workloads never start before the Secret and ConfigMap they
//! mount. Templates are read from disk on every call.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use k8s_openapi::api::core::v1::ConfigMap;
use pcs_common::progress::ProgressReporter;
use pcs_common::retry::{retry_with_backoff, RetryConfig, RetryError};
use pcs_common::{Error, Result, MAX_RETRY};
use tracing::{debug, info, warn};

use super::api::{ClusterApi, ClusterApiError};
use super::manifest::{
    generate_shared_secret, namespace_manifest, parse_documents, render_config_map,
    render_workload, tls_secret, ClusterManifest, TemplateDocument, WorkloadContext,
};
use super::ClusterConfig;
use crate::solution::ManifestSources;

/// Interval between attempts on a cluster that is not answering yet
pub const CLUSTER_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Namespace used unless the caller picks another one
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Create,
    Delete,
}

impl Action {
    fn verb(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
        }
    }
}

/// Creates and deletes the solution's resources in dependency order
pub struct ClusterResourceManager {
    api: Arc<dyn ClusterApi>,
    namespace: String,
    sources: ManifestSources,
    config: ClusterConfig,
    retry: RetryConfig,
    progress: Arc<dyn ProgressReporter>,
}

impl ClusterResourceManager {
    /// Manager for `namespace`, retrying timeouts every 10s up to 36 times per call
    pub fn new(
        api: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        sources: ManifestSources,
        config: ClusterConfig,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            api,
            namespace: namespace.into(),
            sources,
            config,
            retry: RetryConfig::fixed(CLUSTER_RETRY_INTERVAL, MAX_RETRY),
            progress,
        }
    }

    /// Override the per-call retry schedule
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Create every resource, stage by stage
    pub async fn setup_all(&self) -> Result<()> {
        if self.namespace != DEFAULT_NAMESPACE {
            self.progress
                .start(&format!("Setting up Kubernetes: Creating namespace {}", self.namespace));
            self.run_stage(Action::Create, vec![namespace_manifest(&self.namespace)])
                .await?;
        }

        self.progress.start("Setting up Kubernetes: Uploading secrets");
        self.run_stage(Action::Create, vec![tls_secret(&self.namespace, &self.config.tls)])
            .await?;

        self.progress
            .start("Setting up Kubernetes: Uploading config map");
        let shared_secret = generate_shared_secret(&mut rand::thread_rng());
        let config_map = self.load_config_map(&shared_secret)?;
        self.run_stage(Action::Create, vec![config_map]).await?;

        self.progress
            .start("Setting up Kubernetes: Starting web app and microservices");
        let workloads = self.load_workloads()?;
        self.run_stage(Action::Create, workloads).await?;

        info!(namespace = %self.namespace, "Cluster setup complete");
        Ok(())
    }

    /// Delete every resource. Missing objects count as deleted.
    pub async fn delete_all(&self) -> Result<()> {
        self.progress.start("Deleting Kubernetes resources: secrets");
        self.run_stage(Action::Delete, vec![tls_secret(&self.namespace, &self.config.tls)])
            .await?;

        self.progress.start("Deleting Kubernetes resources: config map");
        // The secret value is irrelevant for deletion
        let config_map = self.load_config_map("")?;
        self.run_stage(Action::Delete, vec![config_map]).await?;

        self.progress
            .start("Deleting Kubernetes resources: web app and microservices");
        let workloads = self.load_workloads()?;
        self.run_stage(Action::Delete, workloads).await?;

        info!(namespace = %self.namespace, "Cluster resources deleted");
        Ok(())
    }

    fn read_template(path: &Path) -> Result<String> {
        std::fs::read_to_string(path)
            .map_err(|e| Error::configuration_at(path, format!("cannot read manifest: {}", e)))
    }

    fn load_config_map(&self, shared_secret: &str) -> Result<ClusterManifest> {
        let path = &self.sources.config_map;
        let template: ConfigMap = serde_yaml::from_str(&Self::read_template(path)?)
            .map_err(|e| Error::configuration_at(path, format!("invalid ConfigMap: {}", e)))?;
        Ok(render_config_map(
            template,
            &self.namespace,
            &self.config,
            shared_secret,
        ))
    }

    fn load_workloads(&self) -> Result<Vec<ClusterManifest>> {
        let path = &self.sources.workloads;
        let documents = parse_documents(&Self::read_template(path)?).map_err(|e| match e {
            Error::Configuration { message, .. } => Error::configuration_at(path, message),
            other => Error::configuration_at(path, other.to_string()),
        })?;

        let ctx = WorkloadContext {
            namespace: &self.namespace,
            load_balancer_ip: &self.config.load_balancer_ip,
            runtime: self.config.runtime.as_str(),
            dns: &self.config.dns,
        };
        let mut manifests = Vec::with_capacity(documents.len());
        for document in documents {
            match document {
                TemplateDocument::Known(manifest) => manifests.push(render_workload(manifest, &ctx)),
                TemplateDocument::Unrecognized { kind, name } => {
                    warn!(
                        kind = %kind,
                        name = name.as_deref().unwrap_or("<unnamed>"),
                        template = %path.display(),
                        "Skipping manifest of unexpected kind"
                    );
                }
            }
        }
        Ok(manifests)
    }

    /// Issue every call of a stage at once; the first failure in manifest
    /// order fails the stage after all calls settled
    async fn run_stage(&self, action: Action, manifests: Vec<ClusterManifest>) -> Result<()> {
        debug!(action = action.verb(), count = manifests.len(), "Running cluster stage");
        let results = join_all(manifests.iter().map(|m| self.apply(action, m))).await;
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    async fn apply(&self, action: Action, manifest: &ClusterManifest) -> Result<()> {
        let resource = manifest.describe();
        let operation = format!("{} {}", action.verb(), resource);
        let namespace = self.namespace.as_str();

        let result = retry_with_backoff(
            &self.retry,
            &operation,
            ClusterApiError::is_connect_timeout,
            || async move {
                match action {
                    Action::Create => self.api.create(namespace, manifest).await,
                    Action::Delete => self.api.delete(namespace, manifest).await,
                }
            },
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(RetryError::Fatal(ClusterApiError::AlreadyExists(_)))
                if action == Action::Create && matches!(manifest, ClusterManifest::Namespace(_)) =>
            {
                debug!(namespace = %namespace, "Namespace already exists");
                Ok(())
            }
            Err(RetryError::Fatal(ClusterApiError::NotFound(_))) if action == Action::Delete => {
                debug!(resource = %resource, "Already deleted");
                Ok(())
            }
            Err(RetryError::Fatal(e)) => Err(Error::provisioning(resource, e.to_string())),
            Err(RetryError::Exhausted { attempts, last }) => {
                Err(Error::timeout(operation, attempts, last.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::api::MockClusterApi;
    use crate::cluster::TlsMaterial;
    use pcs_common::progress::LogProgress;
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const CONFIG_MAP: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: deployment-configmap
data:
  webui-config.js: "aadTenant: '{TenantId}'"
"#;

    const WORKLOADS: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: web
spec:
  type: LoadBalancer
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  selector: {}
  template:
    spec:
      containers:
      - name: web
        image: azureiotpcs/web-{runtime}:latest
---
apiVersion: policy/v1
kind: PodDisruptionBudget
metadata:
  name: ignored
"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        sources: ManifestSources,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sources = ManifestSources {
            config_map: dir.path().join("deployment-configmap.yaml"),
            workloads: dir.path().join("all-in-one.yaml"),
        };
        fs::write(&sources.config_map, CONFIG_MAP).unwrap();
        fs::write(&sources.workloads, WORKLOADS).unwrap();
        Fixture { _dir: dir, sources }
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            aad_tenant_id: "tenant".into(),
            dns: "contoso.cloudapp.azure.com".into(),
            load_balancer_ip: "10.0.0.4".into(),
            tls: TlsMaterial {
                cert: "cert".into(),
                key: "key".into(),
                fingerprint: "fp".into(),
            },
            ..Default::default()
        }
    }

    fn manager(api: MockClusterApi, namespace: &str, sources: ManifestSources) -> ClusterResourceManager {
        ClusterResourceManager::new(Arc::new(api), namespace, sources, config(), Arc::new(LogProgress))
            .with_retry(RetryConfig::fixed(Duration::ZERO, MAX_RETRY))
    }

    fn timeout() -> ClusterApiError {
        ClusterApiError::ConnectTimeout("ETIMEDOUT".into())
    }

    #[tokio::test]
    async fn setup_creates_in_dependency_order() {
        let fixture = fixture();
        let created = Arc::new(Mutex::new(Vec::new()));
        let log = created.clone();

        let mut api = MockClusterApi::new();
        api.expect_create().returning(move |namespace, manifest| {
            assert_eq!(namespace, "default");
            log.lock().unwrap().push(manifest.describe());
            Ok(())
        });

        manager(api, "default", fixture.sources).setup_all().await.unwrap();

        let created = created.lock().unwrap();
        assert_eq!(created[0], "Secret/tls-certificate");
        assert_eq!(created[1], "ConfigMap/deployment-configmap");
        let mut workloads = created[2..].to_vec();
        workloads.sort();
        assert_eq!(workloads, ["Deployment/web", "Service/web"]);
    }

    #[tokio::test]
    async fn secret_timing_out_twice_still_succeeds() {
        let fixture = fixture();
        let secret_attempts = Arc::new(AtomicU32::new(0));
        let counter = secret_attempts.clone();

        let mut api = MockClusterApi::new();
        api.expect_create().returning(move |_, manifest| {
            if let ClusterManifest::Secret(_) = manifest {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(timeout());
                }
            }
            Ok(())
        });

        manager(api, "default", fixture.sources).setup_all().await.unwrap();
        assert_eq!(secret_attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn each_call_has_its_own_retry_budget() {
        let fixture = fixture();
        let calls = Arc::new(Mutex::new(std::collections::HashMap::<String, u32>::new()));
        let log = calls.clone();

        let mut api = MockClusterApi::new();
        api.expect_create().returning(move |_, manifest| {
            let mut calls = log.lock().unwrap();
            let count = calls.entry(manifest.describe()).or_default();
            *count += 1;
            // Every call needs 30 attempts; a shared counter would run out
            if *count < 30 {
                Err(timeout())
            } else {
                Ok(())
            }
        });

        manager(api, "default", fixture.sources).setup_all().await.unwrap();
        assert!(calls.lock().unwrap().values().all(|c| *c == 30));
    }

    #[tokio::test]
    async fn persistent_timeout_exhausts_budget() {
        let fixture = fixture();
        let mut api = MockClusterApi::new();
        api.expect_create().times(36).returning(|_, _| Err(timeout()));

        let err = manager(api, "default", fixture.sources)
            .setup_all()
            .await
            .unwrap_err();
        match err {
            Error::Timeout { operation, attempts, .. } => {
                assert_eq!(operation, "create Secret/tls-certificate");
                assert_eq!(attempts, 36);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn other_errors_are_fatal_immediately() {
        let fixture = fixture();
        let mut api = MockClusterApi::new();
        api.expect_create().times(1).returning(|_, m| {
            Err(ClusterApiError::Other {
                resource: m.describe(),
                message: "forbidden".into(),
            })
        });

        let err = manager(api, "default", fixture.sources)
            .setup_all()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provisioning { ref resource, .. } if resource == "Secret/tls-certificate"));
    }

    #[tokio::test]
    async fn custom_namespace_is_created_first_and_may_exist() {
        let fixture = fixture();
        let created = Arc::new(Mutex::new(Vec::new()));
        let log = created.clone();

        let mut api = MockClusterApi::new();
        api.expect_create().returning(move |namespace, manifest| {
            assert_eq!(namespace, "pcs");
            log.lock().unwrap().push(manifest.kind());
            match manifest {
                ClusterManifest::Namespace(_) => Err(ClusterApiError::AlreadyExists("Namespace/pcs".into())),
                _ => Ok(()),
            }
        });

        manager(api, "pcs", fixture.sources).setup_all().await.unwrap();
        assert_eq!(created.lock().unwrap()[0], "Namespace");
    }

    #[tokio::test]
    async fn delete_treats_not_found_as_success() {
        let fixture = fixture();
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let log = deleted.clone();

        let mut api = MockClusterApi::new();
        api.expect_create().never();
        api.expect_delete().returning(move |_, manifest| {
            log.lock().unwrap().push(manifest.describe());
            Err(ClusterApiError::NotFound(manifest.describe()))
        });

        manager(api, "default", fixture.sources).delete_all().await.unwrap();
        let deleted = deleted.lock().unwrap();
        assert_eq!(deleted.len(), 4);
        assert_eq!(deleted[0], "Secret/tls-certificate");
        assert_eq!(deleted[1], "ConfigMap/deployment-configmap");
    }

    #[tokio::test]
    async fn stage_failure_stops_later_stages() {
        let fixture = fixture();
        let mut api = MockClusterApi::new();
        api.expect_create().returning(|_, manifest| match manifest {
            ClusterManifest::ConfigMap(_) => Err(ClusterApiError::AlreadyExists(manifest.describe())),
            ClusterManifest::Deployment(_) | ClusterManifest::Service(_) => {
                panic!("workloads must not start after a failed stage")
            }
            _ => Ok(()),
        });

        let err = manager(api, "default", fixture.sources)
            .setup_all()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn missing_template_is_configuration_error() {
        let fixture = fixture();
        fs::remove_file(&fixture.sources.workloads).unwrap();
        let mut api = MockClusterApi::new();
        api.expect_create().returning(|_, _| Ok(()));

        let err = manager(api, "default", fixture.sources.clone())
            .setup_all()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { path: Some(ref p), .. } if p == &fixture.sources.workloads));
    }
}
