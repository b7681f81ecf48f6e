//! What a finished deployment leaves behind for the user
//!
//! Cloud deployments persist a small summary next to the working directory;
//! local deployments print the environment the microservices need instead.

use std::path::{Path, PathBuf};

use pcs_common::{Result, TROUBLESHOOTING_GUIDE_URL};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::platform::DeploymentOutputs;

/// Directory, relative to the base directory, holding summaries
pub const SUMMARY_DIR: &str = "deployments";

/// Persisted summary of a cloud deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSummary {
    /// AAD application registration URL, when one was supplied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
    /// Portal link to the resource group
    pub resource_group_url: String,
    /// Where to look when the site does not come up
    pub troubleshooting_guide_url: String,
    /// Public site URL
    pub website_url: String,
}

impl DeploymentSummary {
    /// Summary with the standard troubleshooting link
    pub fn new(app_url: Option<String>, resource_group_url: String, website_url: String) -> Self {
        Self {
            app_url,
            resource_group_url,
            troubleshooting_guide_url: TROUBLESHOOTING_GUIDE_URL.to_string(),
            website_url,
        }
    }
}

/// `<portal>/<domain>#resource<group id>`
pub fn resource_group_url(portal_url: &str, domain: &str, group_id: &str) -> String {
    format!("{}/{}#resource{}", portal_url.trim_end_matches('/'), domain, group_id)
}

/// `<base>/deployments/<deployment>-output.json`
pub fn summary_path(base_dir: &Path, deployment_name: &str) -> PathBuf {
    base_dir
        .join(SUMMARY_DIR)
        .join(format!("{}-output.json", deployment_name))
}

/// Write the summary as pretty JSON, creating the directory if needed
pub fn write_summary(
    base_dir: &Path,
    deployment_name: &str,
    summary: &DeploymentSummary,
) -> Result<PathBuf> {
    let path = summary_path(base_dir, deployment_name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(summary)?)?;
    info!(path = %path.display(), "Deployment summary written");
    Ok(path)
}

/// Outputs a local deployment must return
pub const LOCAL_OUTPUTS: [&str; 7] = [
    "iotHubConnectionString",
    "documentDBConnectionString",
    "eventHubEndpoint",
    "eventHubPartitions",
    "eventHubName",
    "storageAccountName",
    "storageAccountKey",
];

/// `NAME=value` lines for running the microservices locally
pub fn local_environment(outputs: &DeploymentOutputs, storage_suffix: &str) -> Result<Vec<String>> {
    let iot_hub = outputs.require_str("iotHubConnectionString")?;
    let document_db = outputs.require_str("documentDBConnectionString")?;
    Ok(vec![
        format!("PCS_IOTHUBREACT_ACCESS_CONNSTRING={}", iot_hub),
        format!("PCS_IOTHUB_CONNSTRING={}", iot_hub),
        format!("PCS_STORAGEADAPTER_DOCUMENTDB_CONNSTRING={}", document_db),
        format!("PCS_TELEMETRY_DOCUMENTDB_CONNSTRING={}", document_db),
        format!("PCS_TELEMETRYAGENT_DOCUMENTDB_CONNSTRING={}", document_db),
        format!(
            "PCS_IOTHUBREACT_HUB_ENDPOINT=Endpoint={}",
            outputs.require_str("eventHubEndpoint")?
        ),
        format!(
            "PCS_IOTHUBREACT_HUB_PARTITIONS={}",
            outputs.require_str("eventHubPartitions")?
        ),
        format!("PCS_IOTHUBREACT_HUB_NAME={}", outputs.require_str("eventHubName")?),
        format!(
            "PCS_IOTHUBREACT_AZUREBLOB_ACCOUNT={}",
            outputs.require_str("storageAccountName")?
        ),
        format!(
            "PCS_IOTHUBREACT_AZUREBLOB_KEY={}",
            outputs.require_str("storageAccountKey")?
        ),
        format!("PCS_IOTHUBREACT_AZUREBLOB_ENDPOINT_SUFFIX={}", storage_suffix),
        "PCS_AUTH_REQUIRED=false".to_string(),
        "PCS_BINGMAP_KEY=static".to_string(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn summary_uses_camel_case_fields() {
        let summary = DeploymentSummary::new(
            None,
            "https://portal.azure.com/contoso.onmicrosoft.com#resource/subscriptions/s/resourceGroups/rg".into(),
            "https://rg.azurewebsites.net".into(),
        );
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["troubleshootingGuideUrl"], TROUBLESHOOTING_GUIDE_URL);
        assert_eq!(value["websiteUrl"], "https://rg.azurewebsites.net");
        assert!(value.get("appUrl").is_none());
    }

    #[test]
    fn writes_summary_under_deployments() {
        let dir = tempfile::tempdir().unwrap();
        let summary = DeploymentSummary::new(
            Some("https://app".into()),
            "https://portal/rg".into(),
            "https://site".into(),
        );
        let path = write_summary(dir.path(), "deployment-contoso", &summary).unwrap();
        assert_eq!(path, dir.path().join("deployments/deployment-contoso-output.json"));

        let read: DeploymentSummary =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read, summary);
    }

    #[test]
    fn resource_group_link() {
        assert_eq!(
            resource_group_url(
                "https://portal.azure.com",
                "contoso.onmicrosoft.com",
                "/subscriptions/s/resourceGroups/rg"
            ),
            "https://portal.azure.com/contoso.onmicrosoft.com#resource/subscriptions/s/resourceGroups/rg"
        );
    }

    #[test]
    fn local_environment_lists_every_variable() {
        let outputs: DeploymentOutputs = LOCAL_OUTPUTS
            .iter()
            .map(|name| (name.to_string(), json!(format!("<{}>", name))))
            .collect();
        let env = local_environment(&outputs, "core.windows.net").unwrap();
        assert_eq!(env.len(), 13);
        assert_eq!(env[5], "PCS_IOTHUBREACT_HUB_ENDPOINT=Endpoint=<eventHubEndpoint>");
        assert_eq!(env[10], "PCS_IOTHUBREACT_AZUREBLOB_ENDPOINT_SUFFIX=core.windows.net");
        assert!(env.iter().all(|line| line.starts_with("PCS_")));
    }

    #[test]
    fn local_environment_requires_outputs() {
        assert!(local_environment(&DeploymentOutputs::default(), "x").is_err());
    }
}
