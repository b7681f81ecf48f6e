//! Resource manager REST client
//!
//! Speaks the subset of the resource manager API the deployment pipeline
//! uses. Every request carries a bearer token fetched from the credential
//! provider right before sending, so a token refreshed by `pcs login` in
//! another shell is picked up on the next call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pcs_common::credentials::CredentialProvider;
use pcs_common::retry::{retry_with_backoff, RetryConfig, RetryError};
use pcs_common::{Error, Result, MAX_RETRY};
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{
    DeploymentMode, DeploymentOperation, DeploymentOutputs, DeploymentRequest, Platform,
    ProvisioningState, ResourceGroup,
};

/// Resource manager API version for every call
pub const API_VERSION: &str = "2021-04-01";

/// Resource type whose regions bound where a solution can be deployed
const LOCATION_PROVIDER: &str = "Microsoft.Devices";
const LOCATION_RESOURCE_TYPE: &str = "iothubs";

const MAP_API_FILTER: &str = "resourceType eq 'Microsoft.BingMaps/mapApis'";
const FREE_MAP_PLAN: &str = "internal1";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Resource manager client scoped to one subscription
#[derive(Clone)]
pub struct ArmClient {
    base_url: String,
    subscription_id: String,
    http: HttpClient,
    credentials: Arc<dyn CredentialProvider>,
    poll_interval: Duration,
}

impl ArmClient {
    /// Create a client for `subscription_id` against `base_url`
    /// (a cloud's resource manager endpoint)
    pub fn new(
        base_url: impl Into<String>,
        subscription_id: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let base_url = base_url.into();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::configuration(format!(
                "resource manager URL must start with http:// or https://, got: {}",
                base_url
            )));
        }

        let http = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            subscription_id: subscription_id.into(),
            http,
            credentials,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Interval between deployment status polls
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn url(&self, path: &str) -> String {
        let path = path.strip_prefix('/').unwrap_or(path);
        format!(
            "{}/subscriptions/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.subscription_id,
            path
        )
    }

    fn deployment_path(group: &str, name: &str) -> String {
        format!(
            "resourcegroups/{}/providers/Microsoft.Resources/deployments/{}",
            group, name
        )
    }

    async fn send(&self, context: &str, builder: RequestBuilder) -> Result<Response> {
        let token = self.credentials.access_token().await?;
        builder
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::transport(context, e.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, context: &str, url: &str, paged: bool) -> Result<T> {
        let mut builder = self.http.get(url);
        if !paged {
            builder = builder.query(&[("api-version", API_VERSION)]);
        }
        let response = self.send(context, builder).await?;
        read_json(context, response).await
    }

    async fn get_deployment(&self, group: &str, name: &str) -> Result<DeploymentResource> {
        let url = self.url(&Self::deployment_path(group, name));
        self.get_json("get deployment", &url, false).await
    }

    /// Poll once, retrying transient transport failures on the poll interval
    async fn poll_deployment(&self, group: &str, name: &str) -> Result<DeploymentResource> {
        retry_with_backoff(
            &RetryConfig::fixed(self.poll_interval, MAX_RETRY),
            "get deployment",
            Error::is_transient,
            || self.get_deployment(group, name),
        )
        .await
        .map_err(|e| match e {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { attempts, last } => {
                Error::timeout(format!("poll deployment {}", name), attempts, last.to_string())
            }
        })
    }
}

impl std::fmt::Debug for ArmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArmClient")
            .field("base_url", &self.base_url)
            .field("subscription_id", &self.subscription_id)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// Map a non-success response to the error taxonomy
fn status_error(context: &str, status: StatusCode, body: &str) -> Error {
    let message = format!("{}: {}", status, body);
    if status == StatusCode::UNAUTHORIZED {
        return Error::auth_expired(format!("{} rejected the token: {}", context, message));
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Error::transport(context, message);
    }
    Error::provisioning(context, message)
}

async fn read_json<T: DeserializeOwned>(context: &str, response: Response) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::transport(context, e.to_string()))?;
    if !status.is_success() {
        return Err(status_error(context, status, &body));
    }
    serde_json::from_str(&body).map_err(|e| {
        Error::provisioning(context, format!("unexpected response body: {}", e))
    })
}

// Wire types

#[derive(Serialize)]
struct DeploymentBody<'a> {
    properties: DeploymentBodyProperties<'a>,
}

#[derive(Serialize)]
struct DeploymentBodyProperties<'a> {
    mode: DeploymentMode,
    template: &'a Value,
    parameters: &'a Map<String, Value>,
}

impl<'a> From<&'a DeploymentRequest> for DeploymentBody<'a> {
    fn from(request: &'a DeploymentRequest) -> Self {
        Self {
            properties: DeploymentBodyProperties {
                mode: request.mode,
                template: &request.template,
                parameters: &request.parameters,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeploymentResource {
    #[serde(default)]
    properties: DeploymentResourceProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentResourceProperties {
    provisioning_state: Option<String>,
    outputs: Option<Value>,
    error: Option<Value>,
}

impl DeploymentResource {
    fn state(&self) -> ProvisioningState {
        self.properties
            .provisioning_state
            .as_deref()
            .map(ProvisioningState::from)
            .unwrap_or_else(|| ProvisioningState::Other("Unknown".into()))
    }
}

#[derive(Debug, Deserialize)]
struct ValidationResponse {
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationPage {
    #[serde(default)]
    value: Vec<OperationResource>,
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationResource {
    #[serde(default)]
    properties: OperationProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationProperties {
    provisioning_state: Option<String>,
    status_message: Option<Value>,
    target_resource: Option<TargetResource>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetResource {
    id: Option<String>,
    resource_type: Option<String>,
    resource_name: Option<String>,
    action_name: Option<String>,
}

impl From<OperationResource> for DeploymentOperation {
    fn from(op: OperationResource) -> Self {
        let props = op.properties;
        let target = props.target_resource.unwrap_or_default();
        DeploymentOperation {
            target_resource_id: target.id,
            resource_type: target.resource_type,
            resource_name: target.resource_name,
            action_name: target.action_name,
            provisioning_state: props
                .provisioning_state
                .as_deref()
                .map(ProvisioningState::from)
                .unwrap_or_else(|| ProvisioningState::Other("Unknown".into())),
            status_message: props.status_message,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderResource {
    #[serde(default)]
    resource_types: Vec<ProviderResourceType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderResourceType {
    resource_type: Option<String>,
    #[serde(default)]
    locations: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourcePage {
    #[serde(default)]
    value: Vec<GenericResource>,
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenericResource {
    plan: Option<ResourcePlan>,
}

#[derive(Debug, Deserialize)]
struct ResourcePlan {
    name: Option<String>,
}

#[async_trait]
impl Platform for ArmClient {
    async fn list_locations(&self) -> Result<Vec<String>> {
        let url = self.url(&format!("providers/{}", LOCATION_PROVIDER));
        let provider: ProviderResource = self.get_json("list locations", &url, false).await?;
        Ok(provider
            .resource_types
            .into_iter()
            .find(|rt| {
                rt.resource_type
                    .as_deref()
                    .is_some_and(|t| t.eq_ignore_ascii_case(LOCATION_RESOURCE_TYPE))
            })
            .map(|rt| rt.locations)
            .unwrap_or_default())
    }

    async fn count_free_map_apis(&self) -> Result<usize> {
        let context = "list map APIs";
        let builder = self
            .http
            .get(self.url("resources"))
            .query(&[("$filter", MAP_API_FILTER), ("api-version", API_VERSION)]);
        let mut page: ResourcePage = read_json(context, self.send(context, builder).await?).await?;
        let mut count = 0;
        loop {
            count += page
                .value
                .iter()
                .filter(|r| {
                    r.plan
                        .as_ref()
                        .and_then(|p| p.name.as_deref())
                        .is_some_and(|n| n.eq_ignore_ascii_case(FREE_MAP_PLAN))
                })
                .count();
            match page.next_link.take() {
                Some(next) => page = self.get_json(context, &next, true).await?,
                None => break,
            }
        }
        debug!(count, "Counted free-plan map APIs");
        Ok(count)
    }

    async fn create_or_update_resource_group(
        &self,
        name: &str,
        group: &ResourceGroup,
    ) -> Result<ResourceGroup> {
        let context = "create resource group";
        let builder = self
            .http
            .put(self.url(&format!("resourcegroups/{}", name)))
            .query(&[("api-version", API_VERSION)])
            .json(group);
        let response = self.send(context, builder).await?;
        read_json(context, response).await
    }

    async fn validate_deployment(
        &self,
        group: &str,
        name: &str,
        request: &DeploymentRequest,
    ) -> Result<Option<Value>> {
        let context = "validate deployment";
        let url = self.url(&format!("{}/validate", Self::deployment_path(group, name)));
        let builder = self
            .http
            .post(url)
            .query(&[("api-version", API_VERSION)])
            .json(&DeploymentBody::from(request));
        let response = self.send(context, builder).await?;

        // Rejected templates come back as 400 with an error document
        if response.status() == StatusCode::BAD_REQUEST {
            let body = response
                .text()
                .await
                .map_err(|e| Error::transport(context, e.to_string()))?;
            return match serde_json::from_str::<ValidationResponse>(&body) {
                Ok(ValidationResponse { error: Some(error) }) => Ok(Some(error)),
                _ => Err(status_error(context, StatusCode::BAD_REQUEST, &body)),
            };
        }

        let validation: ValidationResponse = read_json(context, response).await?;
        Ok(validation.error)
    }

    async fn create_or_update_deployment(
        &self,
        group: &str,
        name: &str,
        request: &DeploymentRequest,
    ) -> Result<DeploymentOutputs> {
        let context = "create deployment";
        let builder = self
            .http
            .put(self.url(&Self::deployment_path(group, name)))
            .query(&[("api-version", API_VERSION)])
            .json(&DeploymentBody::from(request));
        let response = self.send(context, builder).await?;
        let mut deployment: DeploymentResource = read_json(context, response).await?;
        info!(deployment = %name, resource_group = %group, "Deployment submitted");

        loop {
            let state = deployment.state();
            match state {
                ProvisioningState::Succeeded => {
                    return Ok(DeploymentOutputs::from_platform(
                        deployment.properties.outputs.as_ref(),
                    ));
                }
                ProvisioningState::Failed | ProvisioningState::Canceled => {
                    let message = match deployment.properties.error.as_ref() {
                        Some(error) => serde_json::to_string_pretty(error)?,
                        None => format!("deployment ended in state {}", state),
                    };
                    return Err(Error::provisioning(name, message));
                }
                _ => {
                    debug!(deployment = %name, state = %state, "Deployment still in progress");
                    tokio::time::sleep(self.poll_interval).await;
                    deployment = self.poll_deployment(group, name).await?;
                }
            }
        }
    }

    async fn list_deployment_operations(
        &self,
        group: &str,
        name: &str,
    ) -> Result<Vec<DeploymentOperation>> {
        let context = "list deployment operations";
        let url = self.url(&format!("{}/operations", Self::deployment_path(group, name)));
        let mut page: OperationPage = self.get_json(context, &url, false).await?;
        let mut operations = Vec::new();
        loop {
            operations.extend(page.value.drain(..).map(DeploymentOperation::from));
            match page.next_link.take() {
                Some(next) => page = self.get_json(context, &next, true).await?,
                None => break,
            }
        }
        Ok(operations)
    }
}

/// Tags applied to every resource group pcs creates
pub fn solution_tags(solution_type: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("IotSolutionType".to_string(), solution_type.to_string())])
}
