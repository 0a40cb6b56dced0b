use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::middleware::NoOpMiddleware;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use tower_governor::GovernorLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::Span;
use uuid::Uuid;

use sos_domain::auth::Role;
use sos_domain::identity::ActorIdentity;

use crate::error::ApiError;
use crate::observability;
use crate::state::AppState;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
const SESSION_COOKIE: &str = "sos_session";
const REST_TIMEOUT: Duration = Duration::from_secs(30);
const UNMATCHED_ROUTE: &str = "unmatched";

/// Ties together every request made for one SOS flow (trigger, retries,
/// stream reconnects). Defaults to the request id.
#[derive(Clone, Debug)]
pub struct CorrelationId(pub String);

/// Caller resolved from the bearer token or session cookie. Anonymous when
/// the token is missing or does not verify.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub role: Role,
    pub is_authenticated: bool,
}

impl Default for AuthContext {
    fn default() -> Self {
        Self {
            user_id: None,
            username: None,
            role: Role::Anonymous,
            is_authenticated: false,
        }
    }
}

impl AuthContext {
    pub fn actor(&self) -> Result<ActorIdentity, ApiError> {
        let user_id = self
            .user_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or(ApiError::Unauthorized)?;
        let username = match &self.username {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => user_id.clone(),
        };
        Ok(ActorIdentity { user_id, username })
    }
}

#[derive(Debug, Deserialize)]
struct SessionClaims {
    sub: String,
    role: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

pub fn set_request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::x_request_id(MakeRequestUuid)
}

pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::x_request_id()
}

/// Plain REST routes only; live streams stay open until the request reaches
/// a terminal state.
pub fn timeout_layer() -> TimeoutLayer {
    TimeoutLayer::new(REST_TIMEOUT)
}

pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, SosRequestSpan> {
    TraceLayer::new_for_http().make_span_with(SosRequestSpan)
}

#[derive(Clone, Default)]
pub struct SosRequestSpan;

impl<B> MakeSpan<B> for SosRequestSpan {
    fn make_span(&mut self, req: &Request<B>) -> Span {
        let headers = req.headers();
        tracing::info_span!(
            "http_request",
            method = %req.method(),
            path = %req.uri().path(),
            request_id = header_str(headers, REQUEST_ID_HEADER).unwrap_or("-"),
            correlation_id = header_str(headers, CORRELATION_ID_HEADER).unwrap_or("-"),
        )
    }
}

pub type RateLimitLayer = GovernorLayer<SmartIpKeyExtractor, NoOpMiddleware>;

/// Keyed on the forwarded client address so a shared load balancer does not
/// throttle every caller at once.
pub fn rate_limit_layer() -> Option<RateLimitLayer> {
    let config = GovernorConfigBuilder::default()
        .key_extractor(SmartIpKeyExtractor)
        .per_second(50)
        .burst_size(100)
        .finish();
    if config.is_none() {
        tracing::error!("rate limit config invalid; serving without a limiter");
    }
    config.map(|config| GovernorLayer {
        config: Arc::new(config),
    })
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let context = auth_token(req.headers())
        .map(|token| verify_session(token, &state.config.jwt_secret))
        .unwrap_or_default();
    req.extensions_mut().insert(context);
    next.run(req).await
}

fn verify_session(token: &str, secret: &str) -> AuthContext {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let key = DecodingKey::from_secret(secret.as_bytes());

    let claims = match decode::<SessionClaims>(token, &key, &validation) {
        Ok(data) => data.claims,
        Err(err) => {
            tracing::warn!(error = %err, "rejected session token");
            return AuthContext::default();
        }
    };
    let Some(role) = claims.role.as_deref().and_then(Role::parse) else {
        tracing::warn!(sub = %claims.sub, "session token has no usable role");
        return AuthContext::default();
    };

    AuthContext {
        user_id: Some(claims.sub),
        username: claims.username,
        is_authenticated: role.is_authenticated(),
        role,
    }
}

pub async fn require_auth_middleware(req: Request<Body>, next: Next) -> Response {
    match req.extensions().get::<AuthContext>() {
        Some(context) if context.is_authenticated => next.run(req).await,
        _ => ApiError::Unauthorized.into_response(),
    }
}

/// Runs inside the request-id layer so a missing correlation id can fall
/// back to the request id.
pub async fn correlation_id_middleware(mut req: Request<Body>, next: Next) -> Response {
    let correlation_id = match req.headers().get(CORRELATION_ID_HEADER) {
        Some(value) => match value.to_str().map(str::trim) {
            Ok(value) if !value.is_empty() => value.to_string(),
            _ => return ApiError::Validation("invalid correlation id".into()).into_response(),
        },
        None => header_str(req.headers(), REQUEST_ID_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::now_v7().to_string()),
    };

    let header_value = HeaderValue::from_str(&correlation_id).ok();
    if let Some(value) = &header_value {
        req.headers_mut().insert(CORRELATION_ID_HEADER, value.clone());
    }
    req.extensions_mut().insert(CorrelationId(correlation_id));

    let mut response = next.run(req).await;
    if let Some(value) = header_value {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

/// Labels by matched route template so request ids in paths do not explode
/// metric cardinality.
pub async fn metrics_layer(req: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| UNMATCHED_ROUTE.to_string(), |path| path.as_str().to_string());
    let response = next.run(req).await;
    observability::register_http_request(
        method.as_str(),
        &route,
        response.status(),
        started.elapsed(),
    );
    response
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

// Browsers cannot attach headers to EventSource or WebSocket handshakes, so
// the session cookie is accepted as well.
pub(crate) fn auth_token(headers: &HeaderMap) -> Option<&str> {
    let bearer = header_str(headers, header::AUTHORIZATION.as_str()).and_then(|value| {
        value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
    });
    bearer.or_else(|| {
        header_str(headers, header::COOKIE.as_str())?
            .split(';')
            .find_map(|part| {
                let (name, token) = part.trim().split_once('=')?;
                (name.trim() == SESSION_COOKIE).then(|| token.trim())
            })
    })
}
