//! Deployment submission
//!
//! Merges parameters, prepares the resource group, validates the request
//! remotely and then submits it, running the status aggregator while the
//! platform works through the template.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pcs_common::progress::{FinalStatus, ProgressReporter};
use pcs_common::{Error, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::platform::{DeploymentOutputs, DeploymentRequest, Platform, ResourceGroup};
use crate::solution::{merge_parameters, Solution};
use crate::status::{StatusAggregator, DEFAULT_STATUS_INTERVAL};

/// Everything needed to submit one deployment
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Resource group name
    pub resource_group: String,
    /// Deployment name inside the group
    pub deployment_name: String,
    /// Region for the resource group
    pub location: String,
    /// Resource group tags
    pub tags: BTreeMap<String, String>,
    /// Parameter values keyed by name
    pub overrides: BTreeMap<String, Value>,
    /// Template and parameter schema
    pub solution: Solution,
    /// Outputs that must be present after success
    pub required_outputs: Vec<String>,
}

/// Result of a successful submission
#[derive(Debug, Clone)]
pub struct SubmitResult {
    /// Deployment outputs
    pub outputs: DeploymentOutputs,
    /// Resource group as returned by the platform
    pub resource_group: ResourceGroup,
}

/// Called with the created group before validation starts, to report its link
pub type GroupLink = Box<dyn Fn(&ResourceGroup) -> Option<String> + Send + Sync>;

/// Submits deployments to a [`Platform`]
pub struct DeploymentSubmitter {
    platform: Arc<dyn Platform>,
    progress: Arc<dyn ProgressReporter>,
    status_interval: Duration,
    group_link: Option<GroupLink>,
}

impl DeploymentSubmitter {
    /// Create a submitter
    pub fn new(platform: Arc<dyn Platform>, progress: Arc<dyn ProgressReporter>) -> Self {
        Self {
            platform,
            progress,
            status_interval: DEFAULT_STATUS_INTERVAL,
            group_link: None,
        }
    }

    /// Interval between status polls during the wait phase
    #[must_use]
    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// How to render a link to the resource group once it exists
    #[must_use]
    pub fn with_group_link(mut self, link: GroupLink) -> Self {
        self.group_link = Some(link);
        self
    }

    /// Submit a deployment and wait for it to finish.
    ///
    /// Nothing is provisioned when validation fails. After a failed
    /// deployment the created resources stay in place.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResult> {
        let SubmitRequest {
            resource_group,
            deployment_name,
            location,
            tags,
            overrides,
            solution,
            required_outputs,
        } = request;

        let mut parameters = solution.parameters.clone();
        merge_parameters(&mut parameters, &overrides);
        let resource_count = solution.resource_count();
        let deployment = DeploymentRequest::incremental(solution.template, parameters);

        self.progress.start("Creating resource group");
        let group = self
            .platform
            .create_or_update_resource_group(
                &resource_group,
                &ResourceGroup {
                    location,
                    tags,
                    ..Default::default()
                },
            )
            .await?;
        let created = match self.group_link.as_ref().and_then(|link| link(&group)) {
            Some(url) => {
                info!(url = %url, "Resources are being deployed");
                format!("Created resource group: {}", url)
            }
            None => format!("Created resource group: {}", resource_group),
        };
        self.progress.finish(FinalStatus::Success(created));

        self.progress
            .start("Running validation before deploying resources");
        if let Some(error) = self
            .platform
            .validate_deployment(&resource_group, &deployment_name, &deployment)
            .await?
        {
            let pretty = serde_json::to_string_pretty(&error)?;
            return Err(Error::validation(format!(
                "Deployment validation failed:\n{}",
                pretty
            )));
        }

        let aggregator = StatusAggregator::start(
            self.platform.clone(),
            self.progress.clone(),
            resource_group.clone(),
            deployment_name.clone(),
            resource_count,
            self.status_interval,
        );
        let result = self
            .platform
            .create_or_update_deployment(&resource_group, &deployment_name, &deployment)
            .await;

        let outputs = match result {
            Ok(outputs) => {
                let report = aggregator.stop().await;
                if let Some(summary) = report.failure_summary() {
                    return Err(Error::provisioning(deployment_name, summary));
                }
                self.progress.finish(report.final_status(None));
                outputs
            }
            Err(e) => {
                let report = aggregator.stop().await;
                warn!(error = %e, deployment = %deployment_name, "Deployment failed");
                // Per-resource failures say more than the call's own error
                return Err(match report.failure_summary() {
                    Some(summary) => Error::provisioning(deployment_name, summary),
                    None => e,
                });
            }
        };

        outputs.require_all(&required_outputs)?;
        info!(deployment = %deployment_name, "Deployment succeeded");

        Ok(SubmitResult {
            outputs,
            resource_group: group,
        })
    }
}
