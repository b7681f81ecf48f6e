//! Integration tests for the resource manager client.
//!
//! wiremock stands in for the resource manager endpoint so request shapes,
//! paging and status mapping are checked over real HTTP.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pcs_common::credentials::CachedToken;
use pcs_common::Error;
use pcs_deploy::platform::{
    ArmClient, DeploymentRequest, Platform, ProvisioningState, ResourceGroup,
};
use serde_json::{json, Map};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SUBSCRIPTION: &str = "sub-1";
const DEPLOYMENT_PATH: &str =
    "/subscriptions/sub-1/resourcegroups/contoso/providers/Microsoft.Resources/deployments/deployment-contoso";

fn client(server: &MockServer) -> ArmClient {
    ArmClient::new(
        server.uri(),
        SUBSCRIPTION,
        Arc::new(CachedToken::new("token-1", None)),
    )
    .unwrap()
    .with_poll_interval(Duration::ZERO)
}

fn request() -> DeploymentRequest {
    let mut parameters = Map::new();
    parameters.insert("solutionName".into(), json!({"value": "contoso"}));
    DeploymentRequest::incremental(json!({"resources": []}), parameters)
}

#[tokio::test]
async fn test_create_resource_group() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/subscriptions/sub-1/resourcegroups/contoso"))
        .and(query_param("api-version", "2021-04-01"))
        .and(header("authorization", "Bearer token-1"))
        .and(body_partial_json(json!({
            "location": "eastus",
            "tags": {"IotSolutionType": "remotemonitoring"}
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "/subscriptions/sub-1/resourceGroups/contoso",
            "name": "contoso",
            "location": "eastus",
            "tags": {"IotSolutionType": "remotemonitoring"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let group = ResourceGroup {
        id: None,
        name: None,
        location: "eastus".into(),
        tags: BTreeMap::from([("IotSolutionType".into(), "remotemonitoring".into())]),
    };
    let created = client(&server)
        .create_or_update_resource_group("contoso", &group)
        .await
        .unwrap();

    assert_eq!(
        created.id.as_deref(),
        Some("/subscriptions/sub-1/resourceGroups/contoso")
    );
    assert_eq!(created.location, "eastus");
}

#[tokio::test]
async fn test_validation_error_is_returned_as_document() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{}/validate", DEPLOYMENT_PATH)))
        .and(body_partial_json(json!({"properties": {"mode": "Incremental"}})))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "code": "InvalidTemplate",
                "message": "Deployment template validation failed"
            }
        })))
        .mount(&server)
        .await;

    let error = client(&server)
        .validate_deployment("contoso", "deployment-contoso", &request())
        .await
        .unwrap()
        .expect("validation error document");

    assert_eq!(error["code"], "InvalidTemplate");
}

#[tokio::test]
async fn test_valid_template_has_no_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{}/validate", DEPLOYMENT_PATH)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"properties": {"provisioningState": "Succeeded"}})),
        )
        .mount(&server)
        .await;

    let result = client(&server)
        .validate_deployment("contoso", "deployment-contoso", &request())
        .await
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn test_deployment_polls_until_succeeded() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(DEPLOYMENT_PATH))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({"properties": {"provisioningState": "Accepted"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    // Two in-progress polls, then the final state
    Mock::given(method("GET"))
        .and(path(DEPLOYMENT_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"properties": {"provisioningState": "Running"}})),
        )
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(DEPLOYMENT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "properties": {
                "provisioningState": "Succeeded",
                "outputs": {
                    "azureWebsite": {"type": "String", "value": "https://contoso.azurewebsites.net"},
                    "eventHubPartitions": {"type": "Int", "value": 4}
                }
            }
        })))
        .mount(&server)
        .await;

    let outputs = client(&server)
        .create_or_update_deployment("contoso", "deployment-contoso", &request())
        .await
        .unwrap();

    assert_eq!(
        outputs.get_str("azureWebsite").as_deref(),
        Some("https://contoso.azurewebsites.net")
    );
    assert_eq!(outputs.get_str("eventHubPartitions").as_deref(), Some("4"));
}

#[tokio::test]
async fn test_failed_deployment_carries_error_document() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(DEPLOYMENT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "properties": {
                "provisioningState": "Failed",
                "error": {"code": "Conflict", "message": "quota exceeded"}
            }
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .create_or_update_deployment("contoso", "deployment-contoso", &request())
        .await
        .unwrap_err();

    match err {
        Error::Provisioning { resource, message } => {
            assert_eq!(resource, "deployment-contoso");
            assert!(message.contains("quota exceeded"));
        }
        other => panic!("expected provisioning error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_operations_follow_next_link() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("{}/operations", DEPLOYMENT_PATH)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{
                "properties": {
                    "provisioningState": "Succeeded",
                    "targetResource": {
                        "id": "/subscriptions/sub-1/resourceGroups/contoso/providers/Microsoft.Devices/IotHubs/hub",
                        "resourceType": "Microsoft.Devices/IotHubs",
                        "resourceName": "hub"
                    }
                }
            }],
            "nextLink": format!("{}/operations-page-2", server.uri())
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/operations-page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{
                "properties": {
                    "provisioningState": "Running",
                    "targetResource": {
                        "resourceType": "Microsoft.Web/sites",
                        "resourceName": "contoso"
                    }
                }
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let operations = client(&server)
        .list_deployment_operations("contoso", "deployment-contoso")
        .await
        .unwrap();

    assert_eq!(operations.len(), 2);
    assert_eq!(operations[0].resource_name.as_deref(), Some("hub"));
    assert_eq!(operations[0].provisioning_state, ProvisioningState::Succeeded);
    assert_eq!(operations[1].resource_type.as_deref(), Some("Microsoft.Web/sites"));
    assert_eq!(operations[1].provisioning_state, ProvisioningState::Running);
}

#[tokio::test]
async fn test_unauthorized_maps_to_auth_expired() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("{}/operations", DEPLOYMENT_PATH)))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .mount(&server)
        .await;

    let err = client(&server)
        .list_deployment_operations("contoso", "deployment-contoso")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthExpired { .. }));
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/subscriptions/sub-1/providers/Microsoft.Devices"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let err = client(&server).list_locations().await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_locations_come_from_iot_hub_provider() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/subscriptions/sub-1/providers/Microsoft.Devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "namespace": "Microsoft.Devices",
            "resourceTypes": [
                {"resourceType": "checkNameAvailability", "locations": []},
                {"resourceType": "IotHubs", "locations": ["East US", "West Europe"]}
            ]
        })))
        .mount(&server)
        .await;

    let locations = client(&server).list_locations().await.unwrap();
    assert_eq!(locations, vec!["East US", "West Europe"]);
}

#[tokio::test]
async fn test_counts_free_map_apis_across_pages() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/subscriptions/sub-1/resources"))
        .and(query_param(
            "$filter",
            "resourceType eq 'Microsoft.BingMaps/mapApis'",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                {"plan": {"name": "internal1"}},
                {"plan": {"name": "enterprise"}},
                {}
            ],
            "nextLink": format!("{}/resources-page-2", server.uri())
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/resources-page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"plan": {"name": "Internal1"}}]
        })))
        .mount(&server)
        .await;

    assert_eq!(client(&server).count_free_map_apis().await.unwrap(), 2);
}

#[tokio::test]
async fn test_empty_token_fails_before_sending() {
    let server = MockServer::start().await;
    let client = ArmClient::new(server.uri(), SUBSCRIPTION, Arc::new(CachedToken::new("", None)))
        .unwrap();

    let err = client.list_locations().await.unwrap_err();
    assert!(matches!(err, Error::AuthExpired { .. }));
    assert!(server.received_requests().await.unwrap().is_empty());
}
