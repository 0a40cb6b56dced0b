use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Path, State};
use axum::{
    Json, Router,
    extract::ws::close_code,
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sos_domain::{
    auth::Role,
    dispatch::SosService,
    error::DomainError,
    fanout::{DispatchSummary, ResponderNotification, ResponderUnit},
    geo::{GeoPoint, GeolocationFailure, LocationSample},
    idempotency::Reservation,
    identity::ActorIdentity,
    ports::BoxFuture,
    ports::geolocation::GeolocationSource,
    ports::idempotency::{IdempotencyKey, SosOperation, StoredResponse},
    realtime::{SosSubscription, SosUpdateEvent, SubscriptionItem},
    sos::{ResponderUpdate, SosRequest, SosStatus},
};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_stream::wrappers::UnboundedReceiverStream;
use validator::Validate;

use crate::middleware::{AuthContext, CorrelationId, REQUEST_ID_HEADER};
use crate::{
    error::ApiError, middleware as app_middleware, observability, state::AppState, validation,
};

const HEARTBEAT: Duration = Duration::from_secs(15);

pub fn router(state: AppState) -> Router {
    let rest = Router::new()
        .route("/v1/sos", post(trigger_sos))
        .route("/v1/sos/active", get(get_active_sos))
        .route("/v1/sos/:sos_id", get(get_sos))
        .route("/v1/sos/:sos_id/accept", post(accept_sos))
        .route("/v1/sos/:sos_id/advance", post(advance_sos))
        .route("/v1/sos/:sos_id/location", post(update_responder_location))
        .route("/v1/sos/:sos_id/cancel", post(cancel_sos))
        .route("/v1/sos/:sos_id/notifications", get(list_notifications))
        .route("/v1/responders/availability", post(set_availability))
        .layer(app_middleware::timeout_layer());

    let streams = Router::new()
        .route("/v1/sos/:sos_id/stream", get(stream_sos_sse))
        .route("/v1/sos/:sos_id/ws", get(stream_sos_ws));

    let protected = rest
        .merge(streams)
        .route_layer(middleware::from_fn(app_middleware::require_auth_middleware));

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(protected)
        .route_layer(middleware::from_fn(app_middleware::metrics_layer))
        .layer(app_middleware::trace_layer())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth_middleware,
        ))
        .layer(middleware::from_fn(
            app_middleware::correlation_id_middleware,
        ))
        .layer(app_middleware::propagate_request_id_layer())
        .layer(app_middleware::set_request_id_layer());

    if !state.config.app_env.eq_ignore_ascii_case("test") {
        if let Some(limiter) = app_middleware::rate_limit_layer() {
            app = app.layer(limiter);
        }
    }

    app.with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    backend: &'static str,
}

async fn health(State(state): State<AppState>) -> Response {
    let probe = &state.backends.probe;
    let (code, status) = match probe.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(err) => {
            tracing::warn!(backend = probe.backend(), error = %err, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "degraded")
        }
    };
    let body = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
        backend: probe.backend(),
    };
    (code, Json(body)).into_response()
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => ApiError::Unavailable.into_response(),
    }
}

#[derive(Debug, Deserialize, Validate)]
struct PointBody {
    #[validate(range(min = -90.0, max = 90.0))]
    latitude: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    longitude: f64,
}

impl PointBody {
    fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Deserialize, Validate)]
struct LocationBody {
    #[validate(range(min = -90.0, max = 90.0))]
    latitude: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    longitude: f64,
    sampled_at_ms: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
struct TriggerSosRequest {
    #[validate(nested)]
    location: Option<LocationBody>,
    /// Device-reported sampling failure, e.g. `permission_denied`.
    location_error: Option<String>,
    #[serde(default)]
    #[validate(length(max = 1000))]
    notes: String,
}

impl TriggerSosRequest {
    fn reported_fix(&self, now_ms: i64) -> ReportedFix {
        let fix = match (&self.location, self.location_error.as_deref()) {
            (Some(location), None) => Ok(LocationSample {
                latitude: location.latitude,
                longitude: location.longitude,
                sampled_at_ms: location.sampled_at_ms.unwrap_or(now_ms),
            }),
            (_, Some(reason)) => Err(GeolocationFailure::parse(reason)
                .unwrap_or(GeolocationFailure::PositionUnavailable)),
            (None, None) => Err(GeolocationFailure::PositionUnavailable),
        };
        ReportedFix(fix)
    }
}

/// The device samples its own position; the API replays that result as the
/// geolocation source for the trigger.
struct ReportedFix(Result<LocationSample, GeolocationFailure>);

impl GeolocationSource for ReportedFix {
    fn sample(&self) -> BoxFuture<'_, Result<LocationSample, GeolocationFailure>> {
        let fix = self.0.clone();
        Box::pin(async move { fix })
    }
}

async fn trigger_sos(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<CorrelationId>,
    Json(payload): Json<TriggerSosRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = auth.actor()?;
    let key = IdempotencyKey::new(
        SosOperation::Create,
        actor.user_id.clone(),
        actor.user_id.clone(),
        request_id_from_headers(&headers)?,
    );
    let fix = payload.reported_fix(state.sos.now_ms());

    let (response, created) = run_idempotent(&state, &key, StatusCode::CREATED, async {
        state
            .sos
            .trigger(&actor, &fix, payload.notes.clone(), correlation.0.clone())
            .await
            .map_err(operation_failed(SosOperation::Create))
    })
    .await?;

    if let Some(request) = created {
        observability::register_transition(SosOperation::Create, request.status);
        spawn_dispatch(state.clone(), request, actor);
    }
    Ok(response)
}

/// Fan-out runs after the create response is sent; its outcome reaches the
/// subject as a `dispatch` event on the request topic.
fn spawn_dispatch(state: AppState, request: SosRequest, subject: ActorIdentity) {
    tokio::spawn(async move {
        let now_ms = state.sos.now_ms();
        let (responders, contacts) = state.notifier.dispatch(&request, &subject, now_ms).await;
        let summary = DispatchSummary::from_reports(responders, contacts, 0);
        observability::register_fanout(&summary);
        state.sos.publish_dispatch(&request, summary).await;
    });
}

async fn get_active_sos(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<SosRequest>, ApiError> {
    let actor = auth.actor()?;
    state
        .sos
        .current_for_subject(&actor.user_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn get_sos(
    State(state): State<AppState>,
    Path(sos_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<SosRequest>, ApiError> {
    let actor = auth.actor()?;
    let request = state.sos.get(&actor, &auth.role, &sos_id).await?;
    Ok(Json(request))
}

async fn accept_sos(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(sos_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    let actor = auth.actor()?;
    let key = IdempotencyKey::new(
        SosOperation::Accept,
        sos_id.clone(),
        actor.user_id.clone(),
        request_id_from_headers(&headers)?,
    );
    let (response, accepted) = run_idempotent(&state, &key, StatusCode::OK, async {
        state
            .sos
            .accept(&actor, &auth.role, &sos_id)
            .await
            .map_err(operation_failed(SosOperation::Accept))
    })
    .await?;

    if let Some(request) = accepted {
        observability::register_transition(SosOperation::Accept, request.status);
    }
    Ok(response)
}

#[derive(Debug, Deserialize, Validate)]
struct AdvanceSosRequest {
    status: SosStatus,
    #[validate(nested)]
    responder_location: Option<PointBody>,
    #[validate(range(min = 0))]
    estimated_arrival_ms: Option<i64>,
}

async fn advance_sos(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(sos_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<AdvanceSosRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = auth.actor()?;
    let key = IdempotencyKey::new(
        SosOperation::Advance,
        sos_id.clone(),
        actor.user_id.clone(),
        request_id_from_headers(&headers)?,
    );
    let update = ResponderUpdate {
        location: payload.responder_location.as_ref().map(PointBody::point),
        estimated_arrival_ms: payload.estimated_arrival_ms,
    };

    let (response, advanced) = run_idempotent(&state, &key, StatusCode::OK, async {
        state
            .sos
            .advance(&actor, &auth.role, &sos_id, payload.status, update.clone())
            .await
            .map_err(operation_failed(SosOperation::Advance))
    })
    .await?;

    if let Some(request) = advanced {
        observability::register_transition(SosOperation::Advance, request.status);
    }
    Ok(response)
}

#[derive(Debug, Deserialize, Validate)]
struct ResponderLocationRequest {
    #[validate(nested)]
    location: Option<PointBody>,
    #[validate(range(min = 0))]
    estimated_arrival_ms: Option<i64>,
}

async fn update_responder_location(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(sos_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<ResponderLocationRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = auth.actor()?;
    let key = IdempotencyKey::new(
        SosOperation::UpdateLocation,
        sos_id.clone(),
        actor.user_id.clone(),
        request_id_from_headers(&headers)?,
    );
    let update = ResponderUpdate {
        location: payload.location.as_ref().map(PointBody::point),
        estimated_arrival_ms: payload.estimated_arrival_ms,
    };

    let (response, _) = run_idempotent(&state, &key, StatusCode::OK, async {
        state
            .sos
            .update_location(&actor, &auth.role, &sos_id, update.clone())
            .await
            .map_err(operation_failed(SosOperation::UpdateLocation))
    })
    .await?;
    Ok(response)
}

async fn cancel_sos(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(sos_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    let actor = auth.actor()?;
    let key = IdempotencyKey::new(
        SosOperation::Cancel,
        sos_id.clone(),
        actor.user_id.clone(),
        request_id_from_headers(&headers)?,
    );
    let (response, cancelled) = run_idempotent(&state, &key, StatusCode::OK, async {
        state
            .sos
            .cancel(&actor, &sos_id)
            .await
            .map_err(operation_failed(SosOperation::Cancel))
    })
    .await?;

    if let Some(request) = cancelled {
        observability::register_transition(SosOperation::Cancel, request.status);
    }
    Ok(response)
}

async fn list_notifications(
    State(state): State<AppState>,
    Path(sos_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<ResponderNotification>>, ApiError> {
    let actor = auth.actor()?;
    state.sos.get(&actor, &auth.role, &sos_id).await?;
    let notifications = state.notifier.list_notifications(&sos_id).await?;
    Ok(Json(notifications))
}

#[derive(Debug, Deserialize, Validate)]
struct AvailabilityRequest {
    available: bool,
    #[validate(length(min = 1, max = 120))]
    display_name: Option<String>,
}

#[derive(Serialize)]
struct AvailabilityResponse {
    responder_id: String,
    available: bool,
}

async fn set_availability(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<AvailabilityRequest>,
) -> Result<Json<AvailabilityResponse>, ApiError> {
    validation::validate(&payload)?;
    let actor = auth.actor()?;
    if !auth.role.can_respond() {
        return Err(ApiError::Forbidden(
            "only responders can change availability".into(),
        ));
    }
    let Some(directory) = &state.backends.memory_directory else {
        return Err(ApiError::Conflict {
            code: "directory_managed_externally",
            message: "responder availability is managed by the configured directory".into(),
        });
    };

    let unit = ResponderUnit {
        responder_id: actor.user_id.clone(),
        display_name: payload.display_name.unwrap_or(actor.username),
    };
    directory.set_available(unit, payload.available).await;
    tracing::info!(responder_id = %actor.user_id, available = payload.available, "responder availability changed");
    Ok(Json(AvailabilityResponse {
        responder_id: actor.user_id,
        available: payload.available,
    }))
}

async fn stream_sos_sse(
    State(state): State<AppState>,
    Path(sos_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    let actor = auth.actor()?;
    let mut subscription = state.sos.subscribe(&actor, &auth.role, &sos_id).await?;
    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let sos = state.sos.clone();
    let role = auth.role.clone();

    tokio::spawn(async move {
        let _guard = observability::StreamGuard::open("sse");
        let mut heartbeat = interval(HEARTBEAT);
        loop {
            tokio::select! {
                item = subscription.next() => {
                    let event = match item {
                        Some(SubscriptionItem::Update(event)) => Some(event),
                        Some(SubscriptionItem::Resync) => {
                            let _ = tx.send(Ok(Event::default().event("resync").data("missed_updates")));
                            match refresh(&sos, &actor, &role, &mut subscription).await {
                                Ok(event) => event,
                                Err(_) => {
                                    let _ = tx.send(Ok(Event::default().event("closed").data("permission_lost")));
                                    break;
                                }
                            }
                        }
                        None => {
                            let reason = close_reason(&subscription);
                            let _ = tx.send(Ok(Event::default().event("closed").data(reason)));
                            break;
                        }
                    };
                    if let Some(event) = event {
                        if tx.send(Ok(sse_event(&event))).is_err() {
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if tx.send(Ok(Event::default().event("ping").data("keep-alive"))).is_err() {
                        break;
                    }
                }
            }
        }
    });

    Ok(Sse::new(UnboundedReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(HEARTBEAT))
        .into_response())
}

async fn stream_sos_ws(
    State(state): State<AppState>,
    Path(sos_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let actor = auth.actor()?;
    let subscription = state.sos.subscribe(&actor, &auth.role, &sos_id).await?;
    let sos = state.sos.clone();
    let role = auth.role.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        handle_sos_websocket(socket, sos, actor, role, subscription).await;
    }))
}

async fn handle_sos_websocket(
    socket: WebSocket,
    sos: SosService,
    actor: ActorIdentity,
    role: Role,
    mut subscription: SosSubscription,
) {
    let _guard = observability::StreamGuard::open("ws");
    let (mut sender, mut incoming) = socket.split();
    let mut heartbeat = interval(HEARTBEAT);
    loop {
        tokio::select! {
            item = subscription.next() => {
                let event = match item {
                    Some(SubscriptionItem::Update(event)) => Some(event),
                    Some(SubscriptionItem::Resync) => {
                        let hint = json!({ "event_type": "resync" }).to_string();
                        if sender.send(Message::Text(hint)).await.is_err() {
                            return;
                        }
                        match refresh(&sos, &actor, &role, &mut subscription).await {
                            Ok(event) => event,
                            Err(_) => {
                                let _ = sender
                                    .send(Message::Close(Some(CloseFrame {
                                        code: close_code::POLICY,
                                        reason: "permission lost".into(),
                                    })))
                                    .await;
                                return;
                            }
                        }
                    }
                    None => {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: close_reason(&subscription).into(),
                            })))
                            .await;
                        return;
                    }
                };
                if let Some(event) = event {
                    let Ok(payload) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(payload)).await.is_err() {
                        return;
                    }
                }
            }
            incoming = incoming.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => {}
                }
            }
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn close_reason(subscription: &SosSubscription) -> &'static str {
    if subscription.stood_down() {
        "claimed_elsewhere"
    } else {
        "terminal"
    }
}

/// Re-reads the record after the subscriber fell behind. Returns the fresh
/// snapshot only if it is newer than what the subscriber already saw.
async fn refresh(
    sos: &SosService,
    actor: &ActorIdentity,
    role: &Role,
    subscription: &mut SosSubscription,
) -> Result<Option<SosUpdateEvent>, DomainError> {
    let sos_id = subscription.sos_id().to_string();
    let current = sos.get(actor, role, &sos_id).await?;
    Ok(subscription.reconcile(current))
}

fn sse_event(event: &SosUpdateEvent) -> Event {
    let name = match event {
        SosUpdateEvent::Snapshot { .. } => "snapshot",
        SosUpdateEvent::Dispatch { .. } => "dispatch",
    };
    Event::default()
        .event(name)
        .id(event.version().to_string())
        .json_data(event)
        .unwrap_or_else(|_| Event::default().event("error").data("encode_failed"))
}

/// Runs a write once per client request id. `operation` is not polled
/// when the request id was already seen. Only successes are stored;
/// a failure releases the marker so a retry is evaluated against current
/// state. The second element is `Some` only when this call did the write.
async fn run_idempotent(
    state: &AppState,
    key: &IdempotencyKey,
    success: StatusCode,
    operation: impl Future<Output = Result<SosRequest, ApiError>>,
) -> Result<(Response, Option<SosRequest>), ApiError> {
    let reservation = state.idempotency.reserve(key).await.map_err(|err| {
        tracing::error!(error = %err, "idempotency reserve failed");
        ApiError::Unavailable
    })?;

    match reservation {
        Reservation::Replay(stored) => Ok((replay(stored), None)),
        Reservation::Pending => Err(ApiError::in_progress()),
        Reservation::Fresh => match operation.await {
            Ok(request) => {
                let body = serde_json::to_value(&request).map_err(|_| ApiError::Internal)?;
                let stored = StoredResponse {
                    status_code: success.as_u16(),
                    body,
                };
                // The write already happened; a lost record only costs
                // replay for this request id.
                if let Err(err) = state.idempotency.record(key, &stored).await {
                    tracing::warn!(error = %err, "idempotency record failed");
                }
                Ok((replay(stored), Some(request)))
            }
            Err(err) => {
                if let Err(release_err) = state.idempotency.release(key).await {
                    tracing::warn!(error = %release_err, "idempotency release failed");
                }
                Err(err)
            }
        },
    }
}

fn operation_failed(operation: SosOperation) -> impl Fn(DomainError) -> ApiError {
    move |err| {
        observability::register_operation_failure(operation, err.kind());
        if err.is_stale_view() {
            tracing::info!(operation = operation.as_str(), error = %err, "write refused on stale view");
        }
        ApiError::from(err)
    }
}

fn request_id_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(std::string::ToString::to_string)
        .ok_or_else(|| ApiError::Validation("missing request id".into()))
}

fn replay(stored: StoredResponse) -> Response {
    let status = StatusCode::from_u16(stored.status_code).unwrap_or(StatusCode::OK);
    (status, Json(stored.body)).into_response()
}
