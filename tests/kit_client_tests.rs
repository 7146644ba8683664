//! Kit client tests against a local mock of the v4 API
//!
//! The mock binds to `127.0.0.1:0` and records every request it receives.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};

use freemkit::config::KitConfig;
use freemkit::error::ClientError;
use freemkit::kit::{KitClient, SubscriptionClient};

/// Form id the mock refuses
const REJECTED_FORM: u64 = 500;

#[derive(Debug, Clone, PartialEq)]
struct Recorded {
    path: String,
    authorization: Option<String>,
    body: Value,
}

#[derive(Clone, Default)]
struct MockKit {
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockKit {
    fn record(&self, path: String, headers: &HeaderMap, body: Value) {
        self.requests.lock().push(Recorded {
            path,
            authorization: headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body,
        });
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }
}

async fn create_subscriber(
    State(mock): State<MockKit>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    mock.record("/v4/subscribers".into(), &headers, body);
    (
        StatusCode::CREATED,
        Json(json!({"subscriber": {"id": 99, "state": "active"}})),
    )
}

async fn add_to_form(
    State(mock): State<MockKit>,
    Path((form_id, subscriber_id)): Path<(u64, u64)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, String) {
    mock.record(
        format!("/v4/forms/{form_id}/subscribers/{subscriber_id}"),
        &headers,
        body,
    );
    if form_id == REJECTED_FORM {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"errors":["Form not found"]}"#.to_string(),
        );
    }
    (StatusCode::OK, r#"{"subscriber":{"id":99}}"#.to_string())
}

async fn tag_subscriber(
    State(mock): State<MockKit>,
    Path((tag_id, subscriber_id)): Path<(u64, u64)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    mock.record(
        format!("/v4/tags/{tag_id}/subscribers/{subscriber_id}"),
        &headers,
        body,
    );
    StatusCode::NO_CONTENT
}

/// Start the mock and return it with a client pointed at it
async fn start_mock(token: Option<&str>) -> (MockKit, KitClient) {
    let mock = MockKit::default();
    let app = Router::new()
        .route("/v4/subscribers", post(create_subscriber))
        .route("/v4/forms/:form_id/subscribers/:subscriber_id", post(add_to_form))
        .route("/v4/tags/:tag_id/subscribers/:subscriber_id", post(tag_subscriber))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = KitClient::new(&KitConfig {
        api_base: format!("http://{addr}/v4"),
        access_token: token.map(str::to_string),
        timeout_secs: 5,
    })
    .unwrap();
    (mock, client)
}

#[tokio::test]
async fn test_create_subscriber_sends_bearer_token_and_fields() {
    let (mock, client) = start_mock(Some("kit-token")).await;
    let mut fields = BTreeMap::new();
    fields.insert("last_name".to_string(), "Doe".to_string());

    let id = client
        .create_or_get_subscriber("jane@example.com", "Jane", &fields)
        .await
        .unwrap();

    assert_eq!(id, 99);
    let requests = mock.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/v4/subscribers");
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer kit-token"));
    assert_eq!(
        requests[0].body,
        json!({
            "email_address": "jane@example.com",
            "first_name": "Jane",
            "state": "active",
            "fields": {"last_name": "Doe"}
        })
    );
}

#[tokio::test]
async fn test_form_and_tag_paths() {
    let (mock, client) = start_mock(Some("kit-token")).await;

    client.attach_to_list("111", 99).await.unwrap();
    client.apply_tag(" 7 ", 99).await.unwrap();

    let paths: Vec<String> = mock.requests().into_iter().map(|r| r.path).collect();
    assert_eq!(
        paths,
        vec![
            "/v4/forms/111/subscribers/99".to_string(),
            "/v4/tags/7/subscribers/99".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_api_error_carries_status_and_body() {
    let (_mock, client) = start_mock(Some("kit-token")).await;

    let err = client
        .attach_to_list(&REJECTED_FORM.to_string(), 99)
        .await
        .unwrap_err();

    match err {
        ClientError::Api { status, message } => {
            assert_eq!(status, 422);
            assert!(message.contains("Form not found"));
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_ids_never_reach_the_api() {
    let (mock, client) = start_mock(Some("kit-token")).await;

    assert!(matches!(
        client.attach_to_list("abc", 99).await,
        Err(ClientError::InvalidId(_))
    ));
    assert!(matches!(
        client.apply_tag("0", 99).await,
        Err(ClientError::InvalidId(_))
    ));
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn test_without_token_nothing_is_sent() {
    let (mock, client) = start_mock(None).await;

    assert!(matches!(
        client
            .create_or_get_subscriber("jane@example.com", "Jane", &BTreeMap::new())
            .await,
        Err(ClientError::NotConnected)
    ));
    assert!(mock.requests().is_empty());
}
