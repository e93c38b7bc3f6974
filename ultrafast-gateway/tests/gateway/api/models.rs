// Model listing API tests
use crate::tests::helpers;
use axum::http::StatusCode;
use serde_json::Value;

#[tokio::test]
async fn test_list_models_endpoint_enumerates_router_registry() {
    let server = helpers::create_test_server().await;

    let response = server
        .get("/v1/models")
        .add_header("Authorization", "ApiKey sk-ultrafast-gateway-key")
        .await;

    helpers::assert_success_response(&response);

    let body: Value = response.json();
    assert_eq!(body["object"], "list");
    // The test config's provider has no `model_mapping`, so no instances are
    // registered with the Model Router yet.
    assert_eq!(body["data"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_provider_catalog_endpoint_lists_static_models() {
    let server = helpers::create_test_server().await;

    let response = server
        .get("/admin/provider-catalog")
        .add_header("Authorization", "ApiKey sk-ultrafast-gateway-key")
        .await;

    helpers::assert_success_response(&response);

    let body: Value = response.json();
    assert_eq!(body["object"], "list");
    assert!(body["data"].is_array());
}

#[tokio::test]
async fn test_messages_endpoint_without_registered_instance_is_unavailable() {
    let server = helpers::create_test_server().await;

    let request = serde_json::json!({
        "model": "claude-3-opus",
        "max_tokens": 100,
        "messages": [{"role": "user", "content": "Hello!"}]
    });

    let response = server
        .post("/v1/messages")
        .add_header("Authorization", "ApiKey sk-ultrafast-gateway-key")
        .add_header("Content-Type", "application/json")
        .json(&request)
        .await;

    // No instance is registered for "claude-3-opus" in the test config, so
    // the Forwarder reports the model as unavailable rather than panicking
    // or silently succeeding.
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);

    let body: Value = response.json();
    assert!(body["error"].is_object());
    assert_eq!(body["error"]["type"], "no_instance_available");
}
