//! Kubernetes setup for cluster-based deployments
//!
//! - [`manifest`]: typed manifests and the pure transforms applied to them
//! - [`api`]: the [`ClusterApi`] seam and its kube-rs implementation
//! - [`manager`]: ordered, staged create and delete of the solution's resources

pub mod api;
pub mod manager;
pub mod manifest;

use std::fmt;

use pcs_common::Result;

use crate::environment::CloudEnvironment;
use crate::platform::DeploymentOutputs;
use crate::solution::Runtime;

pub use api::{ClusterApi, ClusterApiError, ClusterConnector, KubeClusterApi, KubeConnector};
pub use manager::ClusterResourceManager;
pub use manifest::ClusterManifest;

/// Certificate and key served by the cluster ingress
#[derive(Clone, PartialEq, Eq, Default)]
pub struct TlsMaterial {
    /// PEM certificate
    pub cert: String,
    /// PEM private key
    pub key: String,
    /// Certificate thumbprint
    pub fingerprint: String,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert", &format!("<{} bytes>", self.cert.len()))
            .field("key", &"<redacted>")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Everything the microservices need to reach the provisioned services
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ClusterConfig {
    /// AAD tenant
    pub aad_tenant_id: String,
    /// AAD authority URL
    pub aad_login_url: String,
    /// AAD application id
    pub application_id: String,
    /// Storage account name
    pub storage_account_name: String,
    /// Storage account key
    pub storage_account_key: String,
    /// Storage endpoint suffix
    pub storage_endpoint_suffix: String,
    /// Map API query key, absent with the static-map template
    pub map_api_key: Option<String>,
    /// Public DNS name of the cluster ingress
    pub dns: String,
    /// Document DB connection string
    pub document_db_connection_string: String,
    /// Event hub endpoint
    pub event_hub_endpoint: String,
    /// Event hub name
    pub event_hub_name: String,
    /// Event hub partition count
    pub event_hub_partitions: String,
    /// IoT hub connection string
    pub iot_hub_connection_string: String,
    /// Public load balancer address
    pub load_balancer_ip: String,
    /// Microservice runtime
    pub runtime: Runtime,
    /// Ingress certificate
    pub tls: TlsMaterial,
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("aad_tenant_id", &self.aad_tenant_id)
            .field("application_id", &self.application_id)
            .field("storage_account_name", &self.storage_account_name)
            .field("dns", &self.dns)
            .field("event_hub_name", &self.event_hub_name)
            .field("load_balancer_ip", &self.load_balancer_ip)
            .field("runtime", &self.runtime)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// Identity inputs that do not come from deployment outputs
#[derive(Debug, Clone, Default)]
pub struct ClusterIdentity {
    /// AAD tenant
    pub aad_tenant_id: String,
    /// AAD application id
    pub application_id: String,
    /// Microservice runtime
    pub runtime: Runtime,
    /// Ingress certificate
    pub tls: TlsMaterial,
}

/// Outputs a cluster deployment must return
pub const CLUSTER_OUTPUTS: [&str; 12] = [
    "storageAccountKey",
    "storageAccountName",
    "agentFQDN",
    "documentDBConnectionString",
    "eventHubEndpoint",
    "eventHubName",
    "eventHubPartitions",
    "iotHubConnectionString",
    "loadBalancerIp",
    "masterFQDN",
    "adminUsername",
    "containerServiceName",
];

/// Map key output, present unless the static-map template was used
pub const MAP_KEY_OUTPUT: &str = "mapApiQueryKey";

impl ClusterConfig {
    /// Assemble from deployment outputs.
    ///
    /// `expect_map_key` makes the map key output mandatory.
    pub fn from_outputs(
        outputs: &DeploymentOutputs,
        identity: ClusterIdentity,
        environment: CloudEnvironment,
        expect_map_key: bool,
    ) -> Result<Self> {
        let map_api_key = if expect_map_key {
            Some(outputs.require_str(MAP_KEY_OUTPUT)?)
        } else {
            None
        };
        Ok(Self {
            aad_tenant_id: identity.aad_tenant_id,
            aad_login_url: environment.active_directory_url().to_string(),
            application_id: identity.application_id,
            storage_account_name: outputs.require_str("storageAccountName")?,
            storage_account_key: outputs.require_str("storageAccountKey")?,
            storage_endpoint_suffix: environment.storage_endpoint_suffix().to_string(),
            map_api_key,
            dns: outputs.require_str("agentFQDN")?,
            document_db_connection_string: outputs.require_str("documentDBConnectionString")?,
            event_hub_endpoint: outputs.require_str("eventHubEndpoint")?,
            event_hub_name: outputs.require_str("eventHubName")?,
            event_hub_partitions: outputs.require_str("eventHubPartitions")?,
            iot_hub_connection_string: outputs.require_str("iotHubConnectionString")?,
            load_balancer_ip: outputs.require_str("loadBalancerIp")?,
            runtime: identity.runtime,
            tls: identity.tls,
        })
    }
}
