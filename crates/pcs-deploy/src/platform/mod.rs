//! Infrastructure platform API
//!
//! [`Platform`] is the seam between the deployment pipeline and the cloud.
//! [`arm::ArmClient`] implements it over the resource manager REST API; tests
//! substitute the generated mock.

pub mod arm;

use std::collections::BTreeMap;

use async_trait::async_trait;
use pcs_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use arm::ArmClient;

/// How the platform reconciles a deployment with existing resources.
///
/// Only incremental deployments are submitted, so re-running a deployment
/// never removes resources added outside the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeploymentMode {
    /// Add or update resources, never delete unrelated ones
    #[default]
    Incremental,
}

/// A template with merged parameters, ready to submit
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRequest {
    /// Reconciliation mode
    pub mode: DeploymentMode,
    /// Infrastructure template
    pub template: Value,
    /// Parameters as `name -> {value}`
    pub parameters: Map<String, Value>,
}

impl DeploymentRequest {
    /// Incremental deployment of `template` with `parameters`
    pub fn incremental(template: Value, parameters: Map<String, Value>) -> Self {
        Self {
            mode: DeploymentMode::Incremental,
            template,
            parameters,
        }
    }
}

/// Resource group as sent to and returned by the platform
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceGroup {
    /// Fully qualified id, assigned by the platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Group name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Region
    pub location: String,
    /// Tags
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Provisioning state of a deployment or one of its operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningState {
    /// Still in progress
    Running,
    /// Completed successfully
    Succeeded,
    /// Failed; the status message carries the reason
    Failed,
    /// Cancelled by a user or superseded
    Canceled,
    /// Any other state the platform reports (Accepted, Creating, ...)
    Other(String),
}

impl ProvisioningState {
    /// Wire spelling
    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
            Self::Other(s) => s,
        }
    }

    /// Whether no further transitions will happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl From<&str> for ProvisioningState {
    fn from(s: &str) -> Self {
        match s {
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            "Canceled" | "Cancelled" => Self::Canceled,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step the platform runs while applying a deployment
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentOperation {
    /// Id of the resource the operation acts on
    pub target_resource_id: Option<String>,
    /// Resource type, e.g. `Microsoft.Web/sites`
    pub resource_type: Option<String>,
    /// Resource name
    pub resource_name: Option<String>,
    /// Set for sub-actions on an existing resource
    pub action_name: Option<String>,
    /// Current state
    pub provisioning_state: ProvisioningState,
    /// Platform message, typically an error document on failure
    pub status_message: Option<Value>,
}

/// Outputs of a finished deployment, `name -> value`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentOutputs(BTreeMap<String, Value>);

impl DeploymentOutputs {
    /// Build from the platform's `name -> {type, value}` document
    pub fn from_platform(outputs: Option<&Value>) -> Self {
        let values = outputs
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .map(|(name, output)| {
                        let value = output.get("value").cloned().unwrap_or(Value::Null);
                        (name.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self(values)
    }

    /// Raw value of an output
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    /// Output rendered as a string; numbers and booleans are formatted
    pub fn get_str(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            other => Some(other.to_string()),
        }
    }

    /// Mandatory output; missing is a provisioning error
    pub fn require_str(&self, name: &str) -> Result<String> {
        self.get_str(name).ok_or_else(|| {
            Error::provisioning(
                name,
                format!("deployment output '{}' was not returned", name),
            )
        })
    }

    /// Fail on the first name that is missing
    pub fn require_all<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        for name in names {
            self.require_str(name.as_ref())?;
        }
        Ok(())
    }
}

impl FromIterator<(String, Value)> for DeploymentOutputs {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Operations the deployment pipeline needs from the cloud platform
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Platform: Send + Sync {
    /// Regions where the solution's resource types are available
    async fn list_locations(&self) -> Result<Vec<String>>;

    /// Number of map API resources already on the free plan
    async fn count_free_map_apis(&self) -> Result<usize>;

    /// Create the resource group, or update its location and tags
    async fn create_or_update_resource_group(
        &self,
        name: &str,
        group: &ResourceGroup,
    ) -> Result<ResourceGroup>;

    /// Validate a deployment without provisioning anything.
    ///
    /// Returns the platform's error document when the request is rejected.
    async fn validate_deployment(
        &self,
        group: &str,
        name: &str,
        request: &DeploymentRequest,
    ) -> Result<Option<Value>>;

    /// Submit a deployment and wait until it reaches a terminal state
    async fn create_or_update_deployment(
        &self,
        group: &str,
        name: &str,
        request: &DeploymentRequest,
    ) -> Result<DeploymentOutputs>;

    /// Every operation of a deployment, across all result pages
    async fn list_deployment_operations(
        &self,
        group: &str,
        name: &str,
    ) -> Result<Vec<DeploymentOperation>>;
}
