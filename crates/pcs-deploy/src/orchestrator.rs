//! End-to-end deployment of a solution
//!
//! [`Orchestrator::run`] sequences the workers for the selected SKU:
//!
//! 1. pick and load the template, merge the answers into its parameters
//! 2. submit the deployment and wait for it
//! 3. `standard`: download the cluster credentials and set up Kubernetes
//! 4. `local`: print the environment for running the microservices locally
//! 5. otherwise: wait for the website and persist a summary
//!
//! Stages run one after another; the first error ends the run.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pcs_common::progress::{FinalStatus, ProgressReporter};
use pcs_common::retry::RetryConfig;
use pcs_common::{Error, Result, MAX_RETRY, TROUBLESHOOTING_GUIDE_URL};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::cluster::api::{ClusterConnector, KubeConnector};
use crate::cluster::manager::{ClusterResourceManager, CLUSTER_RETRY_INTERVAL, DEFAULT_NAMESPACE};
use crate::cluster::{ClusterConfig, ClusterIdentity, TlsMaterial, CLUSTER_OUTPUTS, MAP_KEY_OUTPUT};
use crate::environment::CloudEnvironment;
use crate::outputs::{
    local_environment, resource_group_url, write_summary, DeploymentSummary, LOCAL_OUTPUTS,
};
use crate::platform::arm::solution_tags;
use crate::platform::{DeploymentOutputs, Platform, ResourceGroup};
use crate::readiness::ReadinessProber;
use crate::remote::{
    kube_config_dir, local_kubeconfig_path, RemoteConfigRetriever, RemoteTarget, SecureShell,
    SftpShell, REMOTE_KUBECONFIG, REMOTE_RETRY_INTERVAL,
};
use crate::solution::{
    environment_parameters, insert_parameters, use_static_map, Runtime, Sku, SolutionLoader,
    SolutionType,
};
use crate::status::DEFAULT_STATUS_INTERVAL;
use crate::submitter::{DeploymentSubmitter, SubmitRequest};

/// Output holding the public site URL
pub const WEBSITE_OUTPUT: &str = "azureWebsite";

/// What to deploy and where
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentTarget {
    /// Solution kind
    pub solution_type: SolutionType,
    /// Deployment flavour
    pub sku: Sku,
    /// Cloud
    pub environment: CloudEnvironment,
}

/// User-provided values for one deployment
#[derive(Debug, Clone, Default)]
pub struct DeploymentAnswers {
    /// Solution name; also the resource group name
    pub solution_name: String,
    /// Region
    pub location: String,
    /// Microservice runtime
    pub runtime: Runtime,
    /// Website name, when it differs from the solution name
    pub website_name: Option<String>,
    /// VM or cluster admin user
    pub admin_username: Option<String>,
    /// VM admin password
    pub admin_password: Option<String>,
    /// SSH public key file; the private key `id_rsa` must sit next to it
    pub ssh_public_key: Option<PathBuf>,
    /// Service principal for the cluster
    pub service_principal_id: Option<String>,
    /// Service principal secret
    pub service_principal_secret: Option<String>,
    /// AAD tenant
    pub aad_tenant_id: Option<String>,
    /// AAD application id
    pub app_id: Option<String>,
    /// AAD application URL, recorded in the summary
    pub app_url: Option<String>,
    /// AAD domain, used in portal links
    pub domain: Option<String>,
    /// Certificate for the site's TLS endpoint
    pub certificate: Option<TlsMaterial>,
}

impl DeploymentAnswers {
    /// Name of the platform deployment
    pub fn deployment_name(&self) -> String {
        format!("deployment-{}", self.solution_name)
    }

    /// Reject answers that cannot produce a working deployment for `sku`
    pub fn validate(&self, sku: Sku) -> Result<()> {
        if self.solution_name.trim().is_empty() || self.location.trim().is_empty() {
            return Err(Error::validation(
                "Solution name, subscription id and location cannot be empty",
            ));
        }
        if self.service_principal_id.is_some() != self.service_principal_secret.is_some() {
            return Err(Error::validation(
                "service principal id and secret must be provided together",
            ));
        }
        if sku == Sku::Standard {
            if self.ssh_public_key.is_none() {
                return Err(Error::validation(
                    "an SSH public key is required to set up the cluster",
                ));
            }
            if self.certificate.is_none() {
                return Err(Error::validation(
                    "a TLS certificate and key are required to set up the cluster",
                ));
            }
        }
        Ok(())
    }

    /// Parameter values derived from the answers
    pub fn parameter_overrides(&self) -> Result<BTreeMap<String, Value>> {
        let mut overrides = BTreeMap::new();
        let mut set = |name: &str, value: Option<&String>| {
            if let Some(value) = value {
                overrides.insert(name.to_string(), json!(value));
            }
        };

        set("solutionName", Some(&self.solution_name));
        set("adminUsername", self.admin_username.as_ref());
        set("adminPassword", self.admin_password.as_ref());
        set("servicePrincipalSecret", self.service_principal_secret.as_ref());
        set("servicePrincipalClientId", self.service_principal_id.as_ref());
        set("azureWebsiteName", self.website_name.as_ref());
        set("aadTenantId", self.aad_tenant_id.as_ref());
        set("aadClientId", self.app_id.as_ref());
        if let Some(cert) = &self.certificate {
            set("remoteEndpointSSLThumbprint", Some(&cert.fingerprint));
            set("remoteEndpointCertificate", Some(&cert.cert));
            set("remoteEndpointCertificateKey", Some(&cert.key));
        }

        if let Some(path) = &self.ssh_public_key {
            let key = std::fs::read_to_string(path).map_err(|e| {
                Error::configuration_at(path, format!("cannot read SSH public key: {}", e))
            })?;
            overrides.insert("sshRSAPublicKey".to_string(), json!(key.trim_end()));
        }
        overrides.insert(
            "microServiceRuntime".to_string(),
            json!(self.runtime.as_str()),
        );
        Ok(overrides)
    }

    fn cluster_identity(&self) -> ClusterIdentity {
        ClusterIdentity {
            aad_tenant_id: self.aad_tenant_id.clone().unwrap_or_default(),
            application_id: self.app_id.clone().unwrap_or_default(),
            runtime: self.runtime,
            tls: self.certificate.clone().unwrap_or_default(),
        }
    }
}

/// What a completed run produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentReport {
    /// Platform deployment name
    pub deployment_name: String,
    /// Portal link to the resource group
    pub resource_group_url: Option<String>,
    /// Public site, for cloud SKUs
    pub website_url: Option<String>,
    /// Whether the site answered healthy in time
    pub website_ready: bool,
    /// Where the summary was written
    pub summary_path: Option<PathBuf>,
    /// Downloaded cluster credentials
    pub kubeconfig: Option<PathBuf>,
    /// Environment for local development
    pub environment: Vec<String>,
}

/// Runs deployments end to end
pub struct Orchestrator {
    platform: Arc<dyn Platform>,
    progress: Arc<dyn ProgressReporter>,
    loader: SolutionLoader,
    target: DeploymentTarget,
    shell: Arc<dyn SecureShell>,
    connector: Arc<dyn ClusterConnector>,
    prober: ReadinessProber,
    output_dir: PathBuf,
    kube_dir: Option<PathBuf>,
    namespace: String,
    status_interval: Duration,
    remote_retry: RetryConfig,
    cluster_retry: RetryConfig,
}

impl Orchestrator {
    /// Orchestrator with the production collaborators and schedules
    pub fn new(
        platform: Arc<dyn Platform>,
        progress: Arc<dyn ProgressReporter>,
        loader: SolutionLoader,
        target: DeploymentTarget,
    ) -> Result<Self> {
        Ok(Self {
            platform,
            progress,
            loader,
            target,
            shell: Arc::new(SftpShell::default()),
            connector: Arc::new(KubeConnector),
            prober: ReadinessProber::new()?,
            output_dir: PathBuf::from("."),
            kube_dir: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            status_interval: DEFAULT_STATUS_INTERVAL,
            remote_retry: RetryConfig::fixed(REMOTE_RETRY_INTERVAL, MAX_RETRY),
            cluster_retry: RetryConfig::fixed(CLUSTER_RETRY_INTERVAL, MAX_RETRY),
        })
    }

    /// Remote shell used to fetch cluster credentials
    #[must_use]
    pub fn with_shell(mut self, shell: Arc<dyn SecureShell>) -> Self {
        self.shell = shell;
        self
    }

    /// How to reach the cluster once credentials are downloaded
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn ClusterConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Website readiness prober
    #[must_use]
    pub fn with_prober(mut self, prober: ReadinessProber) -> Self {
        self.prober = prober;
        self
    }

    /// Directory receiving `deployments/<name>-output.json`
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Directory for downloaded kubeconfigs, `~/.kube` by default
    #[must_use]
    pub fn with_kube_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.kube_dir = Some(dir.into());
        self
    }

    /// Namespace for cluster resources
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Interval between status polls while the deployment runs
    #[must_use]
    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Retry schedules for credential download and cluster calls
    #[must_use]
    pub fn with_retries(mut self, remote: RetryConfig, cluster: RetryConfig) -> Self {
        self.remote_retry = remote;
        self.cluster_retry = cluster;
        self
    }

    /// Deploy the solution described by `answers`.
    ///
    /// A failure is rendered once through the progress reporter before it is
    /// returned.
    pub async fn run(&self, answers: &DeploymentAnswers) -> Result<DeploymentReport> {
        match self.execute(answers).await {
            Ok(report) => Ok(report),
            Err(e) => {
                if let Error::AuthExpired { reason } = &e {
                    warn!(reason = %reason, "Credential rejected");
                }
                self.progress.finish(FinalStatus::Failure(e.to_string()));
                Err(e)
            }
        }
    }

    async fn execute(&self, answers: &DeploymentAnswers) -> Result<DeploymentReport> {
        let DeploymentTarget {
            solution_type,
            sku,
            environment,
        } = self.target;
        answers.validate(sku)?;
        self.check_location(&answers.location).await?;

        let static_map = match solution_type {
            SolutionType::RemoteMonitoring => {
                use_static_map(environment, sku, self.free_map_apis().await?)
            }
            SolutionType::Test => false,
        };
        let mut solution = self.loader.load(solution_type, sku, static_map)?;
        if sku == Sku::Basic {
            insert_parameters(&mut solution.parameters, environment_parameters(environment));
        }

        let deployment_name = answers.deployment_name();
        info!(
            deployment = %deployment_name,
            solution_type = %solution_type,
            sku = %sku,
            environment = %environment,
            static_map,
            "Starting deployment"
        );

        let portal = environment.portal_url().to_string();
        let domain = answers.domain.clone().unwrap_or_default();
        let submitter = DeploymentSubmitter::new(self.platform.clone(), self.progress.clone())
            .with_status_interval(self.status_interval)
            .with_group_link(Box::new(move |group: &ResourceGroup| {
                group
                    .id
                    .as_deref()
                    .map(|id| resource_group_url(&portal, &domain, id))
            }));

        let result = submitter
            .submit(SubmitRequest {
                resource_group: answers.solution_name.clone(),
                deployment_name: deployment_name.clone(),
                location: answers.location.clone(),
                tags: solution_tags(solution_type.as_str()),
                overrides: answers.parameter_overrides()?,
                solution,
                required_outputs: self.required_outputs(static_map),
            })
            .await?;

        let mut report = DeploymentReport {
            deployment_name: deployment_name.clone(),
            resource_group_url: result.resource_group.id.as_deref().map(|id| {
                resource_group_url(
                    environment.portal_url(),
                    answers.domain.as_deref().unwrap_or_default(),
                    id,
                )
            }),
            ..Default::default()
        };

        match sku {
            Sku::Local => {
                report.environment =
                    local_environment(&result.outputs, environment.storage_endpoint_suffix())?;
                self.progress.finish(FinalStatus::Success(format!(
                    "Copy the following environment variables to /scripts/local/.env file:\n{}",
                    report.environment.join("\n")
                )));
                return Ok(report);
            }
            Sku::Standard => {
                report.kubeconfig = Some(
                    self.setup_cluster(&result.outputs, answers, !static_map)
                        .await?,
                );
            }
            Sku::Basic => {}
        }

        let website = result.outputs.require_str(WEBSITE_OUTPUT)?;
        self.progress.start(&format!(
            "Waiting for {} to be ready, this could take up to 5 minutes",
            website
        ));
        report.website_ready = self.prober.wait_until_ready(&website).await;

        let mut message = format!(
            "Solution: {} is deployed at {}",
            answers.solution_name, website
        );
        if !report.website_ready {
            message.push_str(&format!(
                "\nWebsite not yet available, please refer to troubleshooting guide here:\n{}",
                TROUBLESHOOTING_GUIDE_URL
            ));
        }
        self.progress.finish(FinalStatus::Success(message));

        let summary = DeploymentSummary::new(
            answers.app_url.clone(),
            report.resource_group_url.clone().unwrap_or_default(),
            website.clone(),
        );
        let path = write_summary(&self.output_dir, &deployment_name, &summary)?;
        self.progress.finish(FinalStatus::Success(format!(
            "Output saved to file: {}",
            path.display()
        )));

        report.website_url = Some(website);
        report.summary_path = Some(path);
        Ok(report)
    }

    async fn check_location(&self, location: &str) -> Result<()> {
        let normalize = |s: &str| s.replace(' ', "").to_lowercase();
        let locations = self.platform.list_locations().await?;
        if locations.is_empty() {
            debug!("Platform returned no locations; skipping location check");
            return Ok(());
        }
        let wanted = normalize(location);
        if locations.iter().any(|l| normalize(l) == wanted) {
            return Ok(());
        }
        Err(Error::validation(format!(
            "location '{}' is not available, choose one of: {}",
            location,
            locations.join(", ")
        )))
    }

    async fn free_map_apis(&self) -> Result<usize> {
        let DeploymentTarget { sku, environment, .. } = self.target;
        if sku == Sku::Local || !environment.supports_map_apis() {
            return Ok(0);
        }
        self.platform.count_free_map_apis().await
    }

    fn required_outputs(&self, static_map: bool) -> Vec<String> {
        let names: Vec<&str> = match self.target.sku {
            Sku::Local => LOCAL_OUTPUTS.to_vec(),
            Sku::Basic => vec![WEBSITE_OUTPUT],
            Sku::Standard => {
                let mut names = CLUSTER_OUTPUTS.to_vec();
                names.push(WEBSITE_OUTPUT);
                if !static_map && self.target.solution_type == SolutionType::RemoteMonitoring {
                    names.push(MAP_KEY_OUTPUT);
                }
                names
            }
        };
        names.into_iter().map(str::to_string).collect()
    }

    async fn setup_cluster(
        &self,
        outputs: &DeploymentOutputs,
        answers: &DeploymentAnswers,
        expect_map_key: bool,
    ) -> Result<PathBuf> {
        let master = outputs.require_str("masterFQDN")?;
        let public_key = answers.ssh_public_key.as_deref().ok_or_else(|| {
            Error::validation("an SSH public key is required to set up the cluster")
        })?;
        let target = RemoteTarget::with_key_pair(
            master.clone(),
            outputs.require_str("adminUsername")?,
            public_key,
        );
        let kube_dir = match &self.kube_dir {
            Some(dir) => dir.clone(),
            None => kube_config_dir()?,
        };
        let local = local_kubeconfig_path(&kube_dir, &outputs.require_str("containerServiceName")?);

        self.progress.start(&format!(
            "Downloading credentials to setup Kubernetes from: {}",
            master
        ));
        let kubeconfig = RemoteConfigRetriever::new(self.shell.clone())
            .with_retry(self.remote_retry.clone())
            .retrieve(&target, REMOTE_KUBECONFIG, &local)
            .await?;
        self.progress.finish(FinalStatus::Success(format!(
            "Credentials downloaded to config: {}",
            kubeconfig.display()
        )));

        let config = ClusterConfig::from_outputs(
            outputs,
            answers.cluster_identity(),
            self.target.environment,
            expect_map_key,
        )?;
        let api = self.connector.connect(&kubeconfig).await?;
        let manager = ClusterResourceManager::new(
            api,
            self.namespace.clone(),
            self.loader.manifest_sources(self.target.solution_type),
            config,
            self.progress.clone(),
        )
        .with_retry(self.cluster_retry.clone());

        manager.setup_all().await?;
        self.progress
            .finish(FinalStatus::Success("Kubernetes setup complete".to_string()));
        Ok(kubeconfig)
    }
}
