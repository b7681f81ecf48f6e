//! Solution templates and parameter schemas
//!
//! A solution is an infrastructure template plus a parameter schema read from
//! the solutions directory. The loader picks the template variant for the
//! SKU and cloud; callers then merge their answers into the schema.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use pcs_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::environment::CloudEnvironment;

/// Map API resources on the free `internal1` plan allowed per subscription
pub const MAX_FREE_MAP_APIS: usize = 2;

/// Suffix of the template variant that ships without a map API resource
const STATIC_MAP_SUFFIX: &str = "-static-map";

/// Kind of solution being deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolutionType {
    /// Remote monitoring solution with per-SKU templates
    RemoteMonitoring,
    /// Minimal solution used for smoke tests
    Test,
}

impl SolutionType {
    /// Name used on disk and in the resource group tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoteMonitoring => "remotemonitoring",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for SolutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SolutionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "remotemonitoring" => Ok(Self::RemoteMonitoring),
            "test" => Ok(Self::Test),
            other => Err(format!(
                "invalid solution type '{}', must be remotemonitoring or test",
                other
            )),
        }
    }
}

/// Deployment flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sku {
    /// Single VM running every microservice
    Basic,
    /// Kubernetes cluster
    Standard,
    /// Cloud services only, microservices run on the developer's machine
    Local,
}

impl Sku {
    /// Name used for template file names
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for Sku {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sku {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "standard" => Ok(Self::Standard),
            "local" => Ok(Self::Local),
            other => Err(format!(
                "invalid sku '{}', must be basic, standard or local",
                other
            )),
        }
    }
}

/// Microservice runtime substituted into container images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    /// .NET microservices
    #[default]
    Dotnet,
    /// Java microservices
    Java,
}

impl Runtime {
    /// Image tag fragment
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dotnet => "dotnet",
            Self::Java => "java",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runtime {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dotnet" => Ok(Self::Dotnet),
            "java" => Ok(Self::Java),
            other => Err(format!(
                "invalid runtime '{}', must be dotnet or java",
                other
            )),
        }
    }
}

/// A loaded template with its parameter schema
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    /// Infrastructure template, opaque apart from its `resources` array
    pub template: Value,
    /// Parameter schema: `name -> {value}`
    pub parameters: Map<String, Value>,
}

impl Solution {
    /// Number of top-level resources the template declares
    pub fn resource_count(&self) -> usize {
        self.template
            .get("resources")
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }

    /// Whether the schema declares `name`
    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    /// Current value of a parameter, if set
    pub fn parameter_value(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name).and_then(|p| p.get("value"))
    }
}

/// Paths of the cluster manifests shipped with a solution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSources {
    /// ConfigMap template for the microservices
    pub config_map: PathBuf,
    /// Multi-document YAML with services, controllers, deployments and ingress
    pub workloads: PathBuf,
}

/// Reads templates and manifests from a solutions directory
#[derive(Debug, Clone)]
pub struct SolutionLoader {
    root: PathBuf,
}

impl SolutionLoader {
    /// Loader rooted at `root` (one sub-directory per solution type)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Solutions directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Template and parameter file paths for a solution and variant
    pub fn template_paths(
        &self,
        solution_type: SolutionType,
        sku: Sku,
        static_map: bool,
    ) -> (PathBuf, PathBuf) {
        let dir = self.root.join(solution_type.as_str());
        match solution_type {
            SolutionType::RemoteMonitoring => {
                let dir = dir.join("armtemplates");
                let variant = if static_map {
                    format!("{}{}", sku.as_str(), STATIC_MAP_SUFFIX)
                } else {
                    sku.as_str().to_string()
                };
                (
                    dir.join(format!("{}.json", variant)),
                    dir.join(format!("{}-parameters.json", sku.as_str())),
                )
            }
            SolutionType::Test => {
                let dir = dir.join("armtemplate");
                (dir.join("template.json"), dir.join("parameters.json"))
            }
        }
    }

    /// Load the template and parameter schema.
    ///
    /// Files are read on every call. A missing or malformed file is a
    /// configuration error naming the path.
    pub fn load(&self, solution_type: SolutionType, sku: Sku, static_map: bool) -> Result<Solution> {
        let (template_path, parameters_path) = self.template_paths(solution_type, sku, static_map);
        debug!(
            template = %template_path.display(),
            parameters = %parameters_path.display(),
            "Loading solution"
        );

        let template = read_json(&template_path)?;
        let parameters = match read_json(&parameters_path)? {
            Value::Object(map) => unwrap_parameters_file(map),
            _ => {
                return Err(Error::configuration_at(
                    parameters_path,
                    "parameters file must be a JSON object",
                ))
            }
        };

        Ok(Solution {
            template,
            parameters,
        })
    }

    /// Cluster manifests for `solution_type`
    pub fn manifest_sources(&self, solution_type: SolutionType) -> ManifestSources {
        let scripts = self.root.join(solution_type.as_str()).join("scripts");
        ManifestSources {
            config_map: scripts.join("individual").join("deployment-configmap.yaml"),
            workloads: scripts.join("all-in-one.yaml"),
        }
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::configuration_at(path, format!("cannot read file: {}", e)))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::configuration_at(path, format!("invalid JSON: {}", e)))
}

/// Accept both a bare `name -> {value}` map and a deployment parameters file
/// (`{"$schema": ..., "parameters": {...}}`)
fn unwrap_parameters_file(mut map: Map<String, Value>) -> Map<String, Value> {
    if map.contains_key("$schema") {
        if let Some(Value::Object(inner)) = map.remove("parameters") {
            return inner;
        }
    }
    map
}

/// Whether the static-map template variant should be used.
///
/// The China cloud has no map API resources. Elsewhere a subscription already
/// holding [`MAX_FREE_MAP_APIS`] free-plan map APIs cannot get another one.
/// The local SKU never provisions one.
pub fn use_static_map(environment: CloudEnvironment, sku: Sku, free_map_apis: usize) -> bool {
    if !environment.supports_map_apis() {
        return true;
    }
    sku != Sku::Local && free_map_apis >= MAX_FREE_MAP_APIS
}

/// Parameters pinned to the target cloud for single-VM deployments
pub fn environment_parameters(environment: CloudEnvironment) -> BTreeMap<String, Value> {
    BTreeMap::from([
        (
            "storageEndpointSuffix".to_string(),
            json!(environment.storage_endpoint_suffix()),
        ),
        (
            "vmFQDNSuffix".to_string(),
            json!(environment.vm_fqdn_suffix()),
        ),
        (
            "aadInstance".to_string(),
            json!(environment.active_directory_url()),
        ),
    ])
}

/// Insert `values` as `{value}` parameters, declaring them if needed
pub fn insert_parameters(parameters: &mut Map<String, Value>, values: BTreeMap<String, Value>) {
    for (name, value) in values {
        parameters.insert(name, json!({ "value": value }));
    }
}

/// Overwrite schema values with caller overrides.
///
/// Only names the schema declares are written; the rest are skipped and
/// returned so the caller can report them.
pub fn merge_parameters(
    parameters: &mut Map<String, Value>,
    overrides: &BTreeMap<String, Value>,
) -> Vec<String> {
    let mut ignored = Vec::new();
    for (name, value) in overrides {
        match parameters.get_mut(name) {
            Some(Value::Object(slot)) => {
                slot.insert("value".to_string(), value.clone());
            }
            Some(slot) => {
                *slot = json!({ "value": value });
            }
            None => ignored.push(name.clone()),
        }
    }
    if !ignored.is_empty() {
        warn!(parameters = ?ignored, "Ignoring overrides for parameters the template does not declare");
    }
    ignored
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn solutions_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let rm = dir.path().join("remotemonitoring/armtemplates");
        write(
            &rm.join("standard.json"),
            r#"{"resources": [{"type": "a"}, {"type": "b"}, {"type": "c"}]}"#,
        );
        write(
            &rm.join("standard-static-map.json"),
            r#"{"resources": [{"type": "a"}, {"type": "b"}]}"#,
        );
        write(
            &rm.join("standard-parameters.json"),
            r#"{"solutionName": {"value": ""}, "adminUsername": {"value": ""}}"#,
        );
        write(
            &dir.path().join("test/armtemplate/template.json"),
            r#"{"resources": []}"#,
        );
        write(
            &dir.path().join("test/armtemplate/parameters.json"),
            r#"{"$schema": "https://schema", "parameters": {"solutionName": {"value": "x"}}}"#,
        );
        dir
    }

    #[test]
    fn loads_remote_monitoring_variant() {
        let dir = solutions_dir();
        let loader = SolutionLoader::new(dir.path());

        let dynamic = loader
            .load(SolutionType::RemoteMonitoring, Sku::Standard, false)
            .unwrap();
        assert_eq!(dynamic.resource_count(), 3);
        assert!(dynamic.has_parameter("adminUsername"));

        let static_map = loader
            .load(SolutionType::RemoteMonitoring, Sku::Standard, true)
            .unwrap();
        assert_eq!(static_map.resource_count(), 2);
    }

    #[test]
    fn loads_generic_solution_and_unwraps_parameters_file() {
        let dir = solutions_dir();
        let loader = SolutionLoader::new(dir.path());
        let solution = loader.load(SolutionType::Test, Sku::Basic, false).unwrap();
        assert_eq!(solution.resource_count(), 0);
        assert_eq!(solution.parameter_value("solutionName"), Some(&json!("x")));
    }

    #[test]
    fn missing_template_is_configuration_error() {
        let dir = solutions_dir();
        let loader = SolutionLoader::new(dir.path());
        let err = loader
            .load(SolutionType::RemoteMonitoring, Sku::Basic, false)
            .unwrap_err();
        match err {
            Error::Configuration { path, .. } => {
                assert!(path.unwrap().ends_with("basic.json"));
            }
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn malformed_template_is_configuration_error() {
        let dir = solutions_dir();
        write(
            &dir.path().join("remotemonitoring/armtemplates/standard.json"),
            "{ not json",
        );
        let loader = SolutionLoader::new(dir.path());
        assert!(matches!(
            loader.load(SolutionType::RemoteMonitoring, Sku::Standard, false),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn merge_ignores_unknown_names() {
        let mut params = Map::new();
        params.insert("solutionName".into(), json!({"value": ""}));
        params.insert("adminUsername".into(), json!({"type": "string"}));

        let overrides = BTreeMap::from([
            ("solutionName".to_string(), json!("contoso")),
            ("adminUsername".to_string(), json!("azureuser")),
            ("notInTemplate".to_string(), json!("ignored")),
        ]);
        let ignored = merge_parameters(&mut params, &overrides);

        assert_eq!(ignored, vec!["notInTemplate".to_string()]);
        assert_eq!(params["solutionName"], json!({"value": "contoso"}));
        assert_eq!(
            params["adminUsername"],
            json!({"type": "string", "value": "azureuser"})
        );
        assert!(!params.contains_key("notInTemplate"));
    }

    #[test]
    fn china_always_uses_static_map() {
        assert!(use_static_map(CloudEnvironment::AzureChinaCloud, Sku::Standard, 0));
        assert!(use_static_map(CloudEnvironment::AzureChinaCloud, Sku::Local, 0));
    }

    #[test]
    fn static_map_when_free_plan_is_full() {
        let env = CloudEnvironment::AzureCloud;
        assert!(!use_static_map(env, Sku::Standard, 1));
        assert!(use_static_map(env, Sku::Standard, 2));
        assert!(use_static_map(env, Sku::Basic, 5));
        assert!(!use_static_map(env, Sku::Local, 5));
    }

    #[test]
    fn environment_parameters_follow_cloud() {
        let params = environment_parameters(CloudEnvironment::AzureGermanCloud);
        assert_eq!(params["vmFQDNSuffix"], json!("cloudapp.azure.de"));
        assert_eq!(params["storageEndpointSuffix"], json!("core.cloudapi.de"));

        let mut schema = Map::new();
        insert_parameters(&mut schema, params);
        assert_eq!(
            schema["aadInstance"],
            json!({"value": "https://login.microsoftonline.de/"})
        );
    }

    #[test]
    fn manifest_sources_layout() {
        let loader = SolutionLoader::new("/solutions");
        let sources = loader.manifest_sources(SolutionType::RemoteMonitoring);
        assert_eq!(
            sources.config_map,
            PathBuf::from("/solutions/remotemonitoring/scripts/individual/deployment-configmap.yaml")
        );
        assert_eq!(
            sources.workloads,
            PathBuf::from("/solutions/remotemonitoring/scripts/all-in-one.yaml")
        );
    }

    #[test]
    fn enums_parse_case_insensitively() {
        assert_eq!("Standard".parse::<Sku>(), Ok(Sku::Standard));
        assert_eq!("JAVA".parse::<Runtime>(), Ok(Runtime::Java));
        assert_eq!(
            "RemoteMonitoring".parse::<SolutionType>(),
            Ok(SolutionType::RemoteMonitoring)
        );
        assert!("premium".parse::<Sku>().is_err());
    }
}
