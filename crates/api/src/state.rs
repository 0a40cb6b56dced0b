use std::sync::Arc;

use sos_domain::dispatch::SosService;
use sos_domain::fanout::FanoutNotifier;
use sos_domain::idempotency::{IdempotencyConfig, IdempotencyService, InMemoryIdempotencyStore};
use sos_domain::ports::idempotency::IdempotencyStore;
use sos_domain::realtime::SosUpdateHub;
use sos_infra::backends::{self, Backends};
use sos_infra::config::AppConfig;
use sos_infra::idempotency::RedisIdempotencyStore;
use sos_infra::realtime::{configured_hub, spawn_redis_bridge};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub sos: SosService,
    pub notifier: FanoutNotifier,
    pub idempotency: IdempotencyService,
    pub backends: Backends,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let backends = Backends::from_config(&config).await?;
        let hub = build_hub(&config).await?;

        // The in-memory store only deduplicates within one process, which
        // matches the memory backend.
        let idempotency_store: Arc<dyn IdempotencyStore> = if config.uses_surreal() {
            Arc::new(RedisIdempotencyStore::connect(&config.redis_url).await?)
        } else {
            Arc::new(InMemoryIdempotencyStore::new("sos:idemp"))
        };

        Ok(Self::from_parts(config, backends, hub, idempotency_store))
    }

    pub fn from_parts(
        config: AppConfig,
        backends: Backends,
        hub: SosUpdateHub,
        idempotency_store: Arc<dyn IdempotencyStore>,
    ) -> Self {
        let sos = SosService::new(
            backends.store.clone(),
            hub,
            backends::location_policy(&config),
        );
        let notifier = backends.notifier(backends::fanout_config(&config));
        let idempotency = IdempotencyService::new(idempotency_store, IdempotencyConfig::default());
        Self {
            config,
            sos,
            notifier,
            idempotency,
            backends,
        }
    }
}

async fn build_hub(config: &AppConfig) -> anyhow::Result<SosUpdateHub> {
    let origin = Uuid::now_v7().to_string();
    let hub = configured_hub(config, &origin).await?;
    if config.uses_redis_realtime() {
        // Detached: the bridge lives as long as the process.
        let _bridge = spawn_redis_bridge(
            config.redis_url.clone(),
            config.realtime_channel_prefix.clone(),
            origin.clone(),
            hub.clone(),
        );
        tracing::info!(%origin, prefix = %config.realtime_channel_prefix, "redis realtime bridge enabled");
    }
    Ok(hub)
}
