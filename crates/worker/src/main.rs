mod observability;

use std::time::Instant;

use sos_domain::dispatch::SosService;
use sos_domain::escalation::EscalationSweeper;
use sos_infra::backends::{self, Backends};
use sos_infra::realtime::configured_hub;
use sos_infra::{config::AppConfig, logging::init_tracing};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

const SWEEP_BATCH: usize = 200;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;
    observability::init_metrics()?;

    let backends = Backends::from_config(&config).await?;
    if !config.uses_surreal() {
        warn!("memory backend: the sweeper only sees requests created in this process");
    }
    // Only publishes; API instances pick the events up through their bridge.
    let hub = configured_hub(&config, &Uuid::now_v7().to_string()).await?;
    let service = SosService::new(
        backends.store.clone(),
        hub,
        backends::location_policy(&config),
    );
    let sweeper = EscalationSweeper::new(
        service.clone(),
        backends.notifier(backends::fanout_config(&config)),
        backends::escalation_policy(&config),
        SWEEP_BATCH,
    );

    let mut ticker = tokio::time::interval(config.worker_poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        poll_interval_ms = config.worker_poll_interval_ms,
        interval_ms = sweeper.policy().interval_ms,
        max_rounds = sweeper.policy().max_rounds,
        "escalation worker starting"
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => run_sweep(&sweeper, &service).await,
            _ = &mut shutdown => break,
        }
    }
    info!("worker shutdown");

    Ok(())
}

async fn run_sweep(sweeper: &EscalationSweeper, service: &SosService) {
    let started = Instant::now();
    match sweeper.sweep(service.now_ms()).await {
        Ok(report) => {
            observability::register_sweep(&report, started.elapsed());
            if report.scanned > 0 {
                info!(
                    scanned = report.scanned,
                    rebroadcast = report.rebroadcast,
                    newly_notified = report.newly_notified,
                    exhausted = report.exhausted,
                    "escalation sweep finished"
                );
            }
        }
        Err(err) => {
            observability::register_sweep_failure(started.elapsed());
            tracing::error!(error = %err, "escalation sweep failed");
        }
    }
}
