use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sos_domain::escalation::SweepReport;

const SWEEPS_TOTAL: &str = "sos_worker_sweeps_total";
const SWEEP_DURATION_MS: &str = "sos_worker_sweep_duration_ms";
const WAITING_REQUESTS: &str = "sos_worker_waiting_requests";
const REBROADCASTS_TOTAL: &str = "sos_worker_rebroadcasts_total";
const RESPONDERS_NOTIFIED_TOTAL: &str = "sos_worker_responders_notified_total";
const UNCLAIMED_PAST_WINDOW_TOTAL: &str = "sos_worker_unclaimed_past_window_total";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn register_sweep(report: &SweepReport, elapsed: Duration) {
    counter!(SWEEPS_TOTAL, "result" => "success").increment(1);
    histogram!(SWEEP_DURATION_MS).record(elapsed.as_secs_f64() * 1_000.0);
    gauge!(WAITING_REQUESTS).set(report.scanned as f64);
    counter!(REBROADCASTS_TOTAL).increment(report.rebroadcast as u64);
    counter!(RESPONDERS_NOTIFIED_TOTAL).increment(report.newly_notified as u64);
    counter!(UNCLAIMED_PAST_WINDOW_TOTAL).increment(report.exhausted as u64);
}

pub fn register_sweep_failure(elapsed: Duration) {
    counter!(SWEEPS_TOTAL, "result" => "error").increment(1);
    histogram!(SWEEP_DURATION_MS).record(elapsed.as_secs_f64() * 1_000.0);
}
