use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use sos_domain::fanout::{ContactAlert, EmergencyContact};
use sos_domain::geo::LocationSample;
use sos_domain::identity::ActorIdentity;
use sos_domain::ports::contacts::{ContactAlertSender, DeliveryError};
use sos_infra::alerts::HttpContactAlertSender;
use url::Url;

#[derive(Clone)]
struct Gateway {
    hits: Arc<AtomicUsize>,
    // Status returned for each hit in order; the last one repeats.
    script: Arc<Vec<StatusCode>>,
}

async fn handle(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> StatusCode {
    let hit = gateway.hits.fetch_add(1, Ordering::SeqCst);
    if headers.get("x-gateway-token").and_then(|v| v.to_str().ok()) != Some("secret") {
        return StatusCode::UNAUTHORIZED;
    }
    if body["to"] != "+62811000" || body["sos_id"] != "sos-1" {
        return StatusCode::BAD_REQUEST;
    }
    let index = hit.min(gateway.script.len() - 1);
    gateway.script[index]
}

async fn spawn_gateway(script: Vec<StatusCode>) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route("/send", post(handle)).with_state(Gateway {
        hits: hits.clone(),
        script: Arc::new(script),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/send"), hits)
}

fn alert() -> ContactAlert {
    ContactAlert::build(
        &EmergencyContact {
            contact_id: "c1".into(),
            subject_id: "subject-1".into(),
            name: "Ibu".into(),
            phone: "+62811000".into(),
            notify_on_sos: true,
        },
        &ActorIdentity {
            user_id: "subject-1".into(),
            username: "rani".into(),
        },
        "sos-1",
        &LocationSample {
            latitude: -6.2,
            longitude: 106.8,
            sampled_at_ms: 0,
        },
    )
}

fn sender(endpoint: String, token: &str) -> HttpContactAlertSender {
    HttpContactAlertSender::new(Url::parse(&endpoint).unwrap(), Some(token.to_string()), Duration::from_secs(2))
}

#[tokio::test]
async fn delivers_to_gateway() {
    let (endpoint, hits) = spawn_gateway(vec![StatusCode::ACCEPTED]).await;
    sender(endpoint, "secret").send(&alert()).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retries_once_after_server_error() {
    let (endpoint, hits) =
        spawn_gateway(vec![StatusCode::SERVICE_UNAVAILABLE, StatusCode::OK]).await;
    sender(endpoint, "secret").send(&alert()).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn gives_up_after_repeated_throttling() {
    let (endpoint, hits) = spawn_gateway(vec![StatusCode::TOO_MANY_REQUESTS]).await;
    let err = sender(endpoint, "secret").send(&alert()).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Unavailable(_)));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let (endpoint, hits) = spawn_gateway(vec![StatusCode::OK]).await;
    let err = sender(endpoint, "wrong").send(&alert()).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Rejected(_)));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
