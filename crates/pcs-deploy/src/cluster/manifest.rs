//! Typed cluster manifests and the transforms applied before submission
//!
//! Templates ship as YAML. Each document is decoded into the matching
//! k8s-openapi type; everything after that is a pure function from a
//! manifest and the deployment's values to a new manifest.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, ReplicationController, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use pcs_common::{Error, Result};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{ClusterConfig, TlsMaterial};

/// Name of the secret holding the ingress certificate
pub const TLS_SECRET_NAME: &str = "tls-certificate";

/// Placeholder in container images replaced with the runtime
pub const RUNTIME_PLACEHOLDER: &str = "{runtime}";

/// Alphabet for the microservices' shared application secret
pub const SHARED_SECRET_ALPHABET: &[u8] =
    b"0123456789-ABCDEVISFGHJKLMNOPQRTUWXYZ_abcdevisfghjklmnopqrtuwxyz";

/// Length of the shared application secret
pub const SHARED_SECRET_LENGTH: usize = 40;

/// A cluster resource the solution creates
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterManifest {
    /// Target namespace
    Namespace(Namespace),
    /// Secret
    Secret(Secret),
    /// ConfigMap
    ConfigMap(ConfigMap),
    /// Service
    Service(Service),
    /// ReplicationController
    ReplicationController(ReplicationController),
    /// Deployment
    Deployment(Deployment),
    /// Ingress
    Ingress(Ingress),
}

impl ClusterManifest {
    /// Resource kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Namespace(_) => "Namespace",
            Self::Secret(_) => "Secret",
            Self::ConfigMap(_) => "ConfigMap",
            Self::Service(_) => "Service",
            Self::ReplicationController(_) => "ReplicationController",
            Self::Deployment(_) => "Deployment",
            Self::Ingress(_) => "Ingress",
        }
    }

    /// Object metadata
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Namespace(r) => &r.metadata,
            Self::Secret(r) => &r.metadata,
            Self::ConfigMap(r) => &r.metadata,
            Self::Service(r) => &r.metadata,
            Self::ReplicationController(r) => &r.metadata,
            Self::Deployment(r) => &r.metadata,
            Self::Ingress(r) => &r.metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Namespace(r) => &mut r.metadata,
            Self::Secret(r) => &mut r.metadata,
            Self::ConfigMap(r) => &mut r.metadata,
            Self::Service(r) => &mut r.metadata,
            Self::ReplicationController(r) => &mut r.metadata,
            Self::Deployment(r) => &mut r.metadata,
            Self::Ingress(r) => &mut r.metadata,
        }
    }

    /// Object name, empty when unset
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// `Kind/name`, for logs and errors
    pub fn describe(&self) -> String {
        format!("{}/{}", self.kind(), self.name())
    }

    /// Same manifest placed in `namespace`. Namespaces themselves are
    /// cluster-scoped and left untouched.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        if !matches!(self, Self::Namespace(_)) {
            self.metadata_mut().namespace = Some(namespace.to_string());
        }
        self
    }
}

/// A decoded template document
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateDocument {
    /// A kind pcs knows how to submit
    Known(ClusterManifest),
    /// Any other kind; skipped by the caller
    Unrecognized {
        /// Declared kind
        kind: String,
        /// Declared name, if any
        name: Option<String>,
    },
}

fn decode<T: DeserializeOwned>(value: serde_yaml::Value, kind: &str) -> Result<T> {
    serde_yaml::from_value(value)
        .map_err(|e| Error::configuration(format!("invalid {} manifest: {}", kind, e)))
}

impl TemplateDocument {
    fn from_value(value: serde_yaml::Value) -> Result<Self> {
        let kind = value
            .get("kind")
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let manifest = match kind.as_str() {
            "Namespace" => ClusterManifest::Namespace(decode(value, &kind)?),
            "Secret" => ClusterManifest::Secret(decode(value, &kind)?),
            "ConfigMap" => ClusterManifest::ConfigMap(decode(value, &kind)?),
            "Service" => ClusterManifest::Service(decode(value, &kind)?),
            "ReplicationController" => ClusterManifest::ReplicationController(decode(value, &kind)?),
            "Deployment" => ClusterManifest::Deployment(decode(value, &kind)?),
            "Ingress" => ClusterManifest::Ingress(decode(value, &kind)?),
            _ => {
                let name = value
                    .get("metadata")
                    .and_then(|m| m.get("name"))
                    .and_then(serde_yaml::Value::as_str)
                    .map(str::to_string);
                return Ok(Self::Unrecognized { kind, name });
            }
        };
        Ok(Self::Known(manifest))
    }
}

/// Decode every document of a multi-document YAML template
pub fn parse_documents(yaml: &str) -> Result<Vec<TemplateDocument>> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        documents.push(TemplateDocument::from_value(value)?);
    }
    Ok(documents)
}

/// Deployment-specific values applied to workload manifests
#[derive(Debug, Clone, Copy)]
pub struct WorkloadContext<'a> {
    /// Target namespace
    pub namespace: &'a str,
    /// Address pinned on LoadBalancer services
    pub load_balancer_ip: &'a str,
    /// Runtime substituted into images
    pub runtime: &'a str,
    /// Public DNS name for the ingress
    pub dns: &'a str,
}

/// Pin the address of a `LoadBalancer` service; other services are unchanged
pub fn pin_load_balancer_ip(mut service: Service, ip: &str) -> Service {
    if let Some(spec) = service.spec.as_mut() {
        if spec.type_.as_deref() == Some("LoadBalancer") {
            spec.load_balancer_ip = Some(ip.to_string());
        }
    }
    service
}

/// Replace the runtime placeholder in container images
pub fn substitute_runtime(mut deployment: Deployment, runtime: &str) -> Deployment {
    let containers = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .map(|pod| pod.containers.iter_mut());
    for container in containers.into_iter().flatten() {
        if let Some(image) = container.image.as_mut() {
            if image.contains(RUNTIME_PLACEHOLDER) {
                *image = image.replace(RUNTIME_PLACEHOLDER, runtime);
            }
        }
    }
    deployment
}

/// Point the first rule and first TLS entry at `dns`
pub fn set_ingress_host(mut ingress: Ingress, dns: &str) -> Ingress {
    if let Some(spec) = ingress.spec.as_mut() {
        if let Some(rule) = spec.rules.as_mut().and_then(|rules| rules.first_mut()) {
            rule.host = Some(dns.to_string());
        }
        if let Some(tls) = spec.tls.as_mut().and_then(|tls| tls.first_mut()) {
            let hosts = tls.hosts.get_or_insert_with(Vec::new);
            match hosts.first_mut() {
                Some(host) => *host = dns.to_string(),
                None => hosts.push(dns.to_string()),
            }
        }
    }
    ingress
}

/// Apply namespace and deployment values to a workload manifest
pub fn render_workload(manifest: ClusterManifest, ctx: &WorkloadContext<'_>) -> ClusterManifest {
    match manifest.with_namespace(ctx.namespace) {
        ClusterManifest::Service(svc) => {
            ClusterManifest::Service(pin_load_balancer_ip(svc, ctx.load_balancer_ip))
        }
        ClusterManifest::Deployment(deployment) => {
            ClusterManifest::Deployment(substitute_runtime(deployment, ctx.runtime))
        }
        ClusterManifest::Ingress(ingress) => {
            ClusterManifest::Ingress(set_ingress_host(ingress, ctx.dns))
        }
        other => other,
    }
}

/// The namespace itself
pub fn namespace_manifest(name: &str) -> ClusterManifest {
    ClusterManifest::Namespace(Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    })
}

/// Opaque secret carrying the ingress certificate and key
pub fn tls_secret(namespace: &str, tls: &TlsMaterial) -> ClusterManifest {
    ClusterManifest::Secret(Secret {
        metadata: ObjectMeta {
            name: Some(TLS_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([
            ("tls.crt".to_string(), ByteString(tls.cert.as_bytes().to_vec())),
            ("tls.key".to_string(), ByteString(tls.key.as_bytes().to_vec())),
        ])),
        ..Default::default()
    })
}

/// Fill the microservices' ConfigMap template
pub fn render_config_map(
    template: ConfigMap,
    namespace: &str,
    config: &ClusterConfig,
    shared_secret: &str,
) -> ClusterManifest {
    let mut config_map = template;
    config_map.metadata.namespace = Some(namespace.to_string());
    let data = config_map.data.get_or_insert_with(BTreeMap::new);

    let entries = [
        ("security.auth.audience", config.application_id.clone()),
        (
            "security.auth.issuer",
            format!("https://sts.windows.net/{}/", config.aad_tenant_id),
        ),
        ("security.application.secret", shared_secret.to_string()),
        ("bing.map.key", config.map_api_key.clone().unwrap_or_default()),
        ("iothub.connstring", config.iot_hub_connection_string.clone()),
        ("docdb.connstring", config.document_db_connection_string.clone()),
        ("iothubreact.hub.name", config.event_hub_name.clone()),
        ("iothubreact.hub.endpoint", config.event_hub_endpoint.clone()),
        ("iothubreact.hub.partitions", config.event_hub_partitions.clone()),
        ("iothubreact.access.connstring", config.iot_hub_connection_string.clone()),
        ("iothubreact.azureblob.account", config.storage_account_name.clone()),
        ("iothubreact.azureblob.key", config.storage_account_key.clone()),
        (
            "iothubreact.azureblob.endpointsuffix",
            config.storage_endpoint_suffix.clone(),
        ),
    ];
    for (key, value) in entries {
        data.insert(key.to_string(), value);
    }

    if let Some(web_ui) = data.get_mut("webui-config.js") {
        *web_ui = web_ui
            .replace("{TenantId}", &config.aad_tenant_id)
            .replace("{ApplicationId}", &config.application_id)
            .replace("{AADLoginInstance}", &config.aad_login_url);
    }

    ClusterManifest::ConfigMap(config_map)
}

/// Random secret shared by the microservices. Not a cryptographic key.
pub fn generate_shared_secret<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..SHARED_SECRET_LENGTH)
        .map(|_| SHARED_SECRET_ALPHABET[rng.gen_range(0..SHARED_SECRET_ALPHABET.len())] as char)
        .collect()
}
