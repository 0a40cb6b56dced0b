use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use futures_util::StreamExt;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::Serialize;
use serde_json::{Value, json};
use sos_domain::idempotency::InMemoryIdempotencyStore;
use sos_domain::realtime::SosUpdateHub;
use sos_infra::alerts::LoggingContactAlertSender;
use sos_infra::backends::Backends;
use sos_infra::config::AppConfig;
use tower::ServiceExt;

use crate::routes;
use crate::state::AppState;

const SECRET: &str = "test-secret";

#[derive(Serialize)]
struct Claims {
    sub: String,
    role: String,
    username: String,
    exp: usize,
}

fn test_config() -> AppConfig {
    AppConfig {
        app_env: "test".to_string(),
        port: 0,
        log_level: "info".to_string(),
        data_backend: "memory".to_string(),
        surreal_endpoint: "ws://127.0.0.1:8000".to_string(),
        surreal_ns: "sos".to_string(),
        surreal_db: "dispatch_test".to_string(),
        surreal_user: "root".to_string(),
        surreal_pass: "root".to_string(),
        redis_url: "redis://127.0.0.1:6379".to_string(),
        realtime_transport: "local".to_string(),
        realtime_channel_prefix: "sos:updates:test".to_string(),
        realtime_buffer: 64,
        jwt_secret: SECRET.to_string(),
        alert_gateway_url: String::new(),
        alert_gateway_token: String::new(),
        alert_timeout_ms: 1_000,
        fanout_max_concurrency: 4,
        location_max_age_ms: 120_000,
        escalation_interval_ms: 60_000,
        escalation_max_rounds: 10,
        worker_poll_interval_ms: 1_000,
    }
}

fn token(role: &str, sub: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_secs();
    let claims = Claims {
        sub: sub.to_string(),
        role: role.to_string(),
        username: format!("{sub}-name"),
        exp: (now + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("token")
}

fn test_app() -> axum::Router {
    let backends = Backends::in_memory(Arc::new(LoggingContactAlertSender));
    let state = AppState::from_parts(
        test_config(),
        backends,
        SosUpdateHub::new(64),
        Arc::new(InMemoryIdempotencyStore::new("test")),
    );
    routes::router(state)
}

fn post(uri: &str, bearer: &str, request_id: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {bearer}"));
    if let Some(request_id) = request_id {
        builder = builder.header("x-request-id", request_id);
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

fn get(uri: &str, bearer: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("authorization", format!("Bearer {bearer}"))
        .body(Body::empty())
        .expect("request")
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, body)
}

fn here() -> Value {
    json!({ "location": { "latitude": -6.2, "longitude": 106.8 }, "notes": "chest pain" })
}

async fn trigger(app: &axum::Router, subject: &str) -> String {
    let (status, body) = send(app, post("/v1/sos", &token("user", subject), None, here())).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["sos_id"].as_str().expect("sos_id").to_string()
}

#[tokio::test]
async fn health_reports_memory_backend() {
    let app = test_app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    assert!(response.headers().contains_key("x-correlation-id"));
    let body: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
            .unwrap();
    assert_eq!(body["backend"], "memory");
}

#[tokio::test]
async fn sos_routes_require_a_valid_token() {
    let app = test_app();
    let (status, body) = send(&app, post("/v1/sos", "not-a-jwt", None, here())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn trigger_is_idempotent_per_request_id() {
    let app = test_app();
    let bearer = token("user", "subject-1");

    let (status, first) = send(&app, post("/v1/sos", &bearer, Some("req-1"), here())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["status"], "initiated");
    assert_eq!(first["subject_id"], "subject-1");
    assert_eq!(first["version"], 1);

    let (status, replay) = send(&app, post("/v1/sos", &bearer, Some("req-1"), here())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(replay["sos_id"], first["sos_id"]);

    let (status, body) = send(&app, post("/v1/sos", &bearer, Some("req-2"), here())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "duplicate_active_request");
}

#[tokio::test]
async fn failed_location_blocks_creation_and_allows_retry() {
    let app = test_app();
    let bearer = token("user", "subject-2");

    let denied = json!({ "location_error": "permission_denied" });
    let (status, body) = send(&app, post("/v1/sos", &bearer, Some("req-1"), denied)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "location_unavailable");

    let (status, _) = send(&app, get("/v1/sos/active", &bearer)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, post("/v1/sos", &bearer, Some("req-1"), here())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "initiated");
}

#[tokio::test]
async fn out_of_range_coordinates_are_rejected() {
    let app = test_app();
    let body = json!({ "location": { "latitude": 123.0, "longitude": 0.0 } });
    let (status, body) = send(&app, post("/v1/sos", &token("user", "s"), None, body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn second_responder_sees_already_claimed() {
    let app = test_app();
    let sos_id = trigger(&app, "subject-3").await;
    let uri = format!("/v1/sos/{sos_id}/accept");

    let (status, body) = send(&app, post(&uri, &token("responder", "r1"), None, json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["claimed_by"], "r1");

    let (status, body) = send(&app, post(&uri, &token("responder", "r2"), None, json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "already_claimed");
}

#[tokio::test]
async fn users_cannot_accept() {
    let app = test_app();
    let sos_id = trigger(&app, "subject-4").await;
    let uri = format!("/v1/sos/{sos_id}/accept");
    let (status, body) = send(&app, post(&uri, &token("user", "u2"), None, json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "not_authorized");
}

#[tokio::test]
async fn responder_walks_the_chain_and_cannot_skip() {
    let app = test_app();
    let subject = token("user", "subject-5");
    let responder = token("responder", "r1");
    let sos_id = trigger(&app, "subject-5").await;

    send(&app, post(&format!("/v1/sos/{sos_id}/accept"), &responder, None, json!({}))).await;

    let advance = format!("/v1/sos/{sos_id}/advance");
    let (status, body) = send(&app, post(&advance, &responder, None, json!({ "status": "arrived" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "invalid_transition");

    let (status, body) = send(
        &app,
        post(
            &advance,
            &responder,
            None,
            json!({
                "status": "en_route",
                "responder_location": { "latitude": -6.21, "longitude": 106.81 },
                "estimated_arrival_ms": 240000
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "en_route");
    assert_eq!(body["estimated_arrival_ms"], 240000);

    let (status, body) = send(
        &app,
        post(
            &format!("/v1/sos/{sos_id}/location"),
            &responder,
            None,
            json!({ "location": { "latitude": -6.205, "longitude": 106.805 } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "en_route");

    for next in ["arrived", "completed"] {
        let (status, body) = send(&app, post(&advance, &responder, None, json!({ "status": next }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], next);
    }

    let (status, body) = send(&app, get(&format!("/v1/sos/{sos_id}"), &subject)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["version"], 6);

    let (status, _) = send(&app, get("/v1/sos/active", &subject)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn subject_cancels_only_before_claim() {
    let app = test_app();
    let subject = token("user", "subject-6");

    let sos_id = trigger(&app, "subject-6").await;
    let (status, body) = send(&app, post(&format!("/v1/sos/{sos_id}/cancel"), &token("user", "other"), None, json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN, "{body}");

    let (status, body) = send(&app, post(&format!("/v1/sos/{sos_id}/cancel"), &subject, None, json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    let claimed = trigger(&app, "subject-6").await;
    send(&app, post(&format!("/v1/sos/{claimed}/accept"), &token("responder", "r1"), None, json!({}))).await;
    let (status, body) = send(&app, post(&format!("/v1/sos/{claimed}/cancel"), &subject, None, json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "already_claimed");
}

#[tokio::test]
async fn outsiders_cannot_read_a_claimed_request() {
    let app = test_app();
    let sos_id = trigger(&app, "subject-7").await;

    let (status, _) = send(&app, get(&format!("/v1/sos/{sos_id}"), &token("responder", "r2"))).await;
    assert_eq!(status, StatusCode::OK);

    send(&app, post(&format!("/v1/sos/{sos_id}/accept"), &token("responder", "r1"), None, json!({}))).await;
    let (status, _) = send(&app, get(&format!("/v1/sos/{sos_id}"), &token("responder", "r2"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(&app, get("/v1/sos/missing", &token("user", "subject-7"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn available_responders_are_notified_after_trigger() {
    let app = test_app();
    let (status, body) = send(
        &app,
        post(
            "/v1/responders/availability",
            &token("responder", "r1"),
            None,
            json!({ "available": true, "display_name": "Ambulance 1" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available"], true);

    let (status, _) = send(
        &app,
        post("/v1/responders/availability", &token("user", "u1"), None, json!({ "available": true })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let sos_id = trigger(&app, "subject-8").await;
    let subject = token("user", "subject-8");
    let uri = format!("/v1/sos/{sos_id}/notifications");

    // Fan-out runs in the background after the create response.
    let mut notified = Value::Null;
    for _ in 0..50 {
        let (status, body) = send(&app, get(&uri, &subject)).await;
        assert_eq!(status, StatusCode::OK);
        if body.as_array().is_some_and(|items| !items.is_empty()) {
            notified = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(notified[0]["responder_id"], "r1");
    assert_eq!(notified[0]["sos_id"], sos_id.as_str());
}

#[tokio::test]
async fn sse_stream_starts_with_snapshot_and_closes_on_terminal() {
    let app = test_app();
    let subject = token("user", "subject-9");
    let sos_id = trigger(&app, "subject-9").await;

    let response = app
        .clone()
        .oneshot(get(&format!("/v1/sos/{sos_id}/stream"), &subject))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let (status, _) = send(&app, post(&format!("/v1/sos/{sos_id}/cancel"), &subject, None, json!({}))).await;
    assert_eq!(status, StatusCode::OK);

    let mut stream = response.into_body().into_data_stream();
    let mut text = String::new();
    let collected = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = stream.next().await {
            text.push_str(&String::from_utf8_lossy(&chunk.expect("chunk")));
        }
    })
    .await;
    assert!(collected.is_ok(), "stream did not close: {text}");

    let initiated = text.find("\"initiated\"").expect("initial snapshot");
    let cancelled = text.find("\"cancelled\"").expect("terminal snapshot");
    assert!(initiated < cancelled);
    assert!(text.contains("event: closed"));
    assert!(text.contains("data: terminal"));
}

#[tokio::test]
async fn stream_is_refused_to_non_participants() {
    let app = test_app();
    let sos_id = trigger(&app, "subject-10").await;
    let (status, _) = send(&app, get(&format!("/v1/sos/{sos_id}/stream"), &token("user", "stranger"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
