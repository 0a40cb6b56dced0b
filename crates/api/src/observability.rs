use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use metrics::{Label, counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sos_domain::fanout::DispatchSummary;
use sos_domain::ports::idempotency::SosOperation;
use sos_domain::sos::SosStatus;

const HTTP_REQUESTS_TOTAL: &str = "sos_api_http_requests_total";
const HTTP_REQUEST_DURATION_SECONDS: &str = "sos_api_http_request_duration_seconds";
const HTTP_SERVER_ERRORS_TOTAL: &str = "sos_api_http_server_errors_total";
const SOS_TRANSITIONS_TOTAL: &str = "sos_api_transitions_total";
const SOS_OPERATION_FAILURES_TOTAL: &str = "sos_api_operation_failures_total";
const SOS_CLAIM_CONFLICTS_TOTAL: &str = "sos_api_claim_conflicts_total";
const FANOUT_RESPONDERS_NOTIFIED_TOTAL: &str = "sos_api_fanout_responders_notified_total";
const FANOUT_CONTACTS_TOTAL: &str = "sos_api_fanout_contacts_total";
const STREAM_SUBSCRIBERS: &str = "sos_api_stream_subscribers";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

pub fn register_http_request(method: &str, route: &str, status: StatusCode, elapsed: Duration) {
    let labels = vec![
        Label::new("method", method.to_string()),
        Label::new("route", route.to_string()),
        Label::new("status", status.as_u16().to_string()),
    ];
    if status.is_server_error() {
        counter!(HTTP_SERVER_ERRORS_TOTAL, labels.clone()).increment(1);
    }
    histogram!(HTTP_REQUEST_DURATION_SECONDS, labels.clone()).record(elapsed.as_secs_f64());
    counter!(HTTP_REQUESTS_TOTAL, labels).increment(1);
}

pub fn register_transition(operation: SosOperation, status: SosStatus) {
    counter!(
        SOS_TRANSITIONS_TOTAL,
        "operation" => operation.as_str(),
        "status" => status.as_str()
    )
    .increment(1);
}

pub fn register_operation_failure(operation: SosOperation, kind: &'static str) {
    counter!(
        SOS_OPERATION_FAILURES_TOTAL,
        "operation" => operation.as_str(),
        "kind" => kind
    )
    .increment(1);

    if matches!(operation, SosOperation::Accept) && kind == "already_claimed" {
        counter!(SOS_CLAIM_CONFLICTS_TOTAL).increment(1);
    }
}

pub fn register_fanout(summary: &DispatchSummary) {
    counter!(FANOUT_RESPONDERS_NOTIFIED_TOTAL).increment(summary.responders_notified as u64);
    counter!(FANOUT_CONTACTS_TOTAL, "outcome" => "delivered")
        .increment(summary.contacts_notified as u64);
    counter!(FANOUT_CONTACTS_TOTAL, "outcome" => "failed").increment(
        summary
            .contacts_total
            .saturating_sub(summary.contacts_notified) as u64,
    );
}

/// Tracks one open live stream for as long as the guard is held.
pub struct StreamGuard {
    transport: &'static str,
}

impl StreamGuard {
    pub fn open(transport: &'static str) -> Self {
        gauge!(STREAM_SUBSCRIBERS, "transport" => transport).increment(1.0);
        Self { transport }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        gauge!(STREAM_SUBSCRIBERS, "transport" => self.transport).decrement(1.0);
    }
}
