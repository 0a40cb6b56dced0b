use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub port: u16,
    pub log_level: String,
    pub data_backend: String,
    pub surreal_endpoint: String,
    pub surreal_ns: String,
    pub surreal_db: String,
    pub surreal_user: String,
    pub surreal_pass: String,
    pub redis_url: String,
    pub realtime_transport: String,
    pub realtime_channel_prefix: String,
    pub realtime_buffer: usize,
    pub jwt_secret: String,
    pub alert_gateway_url: String,
    pub alert_gateway_token: String,
    pub alert_timeout_ms: u64,
    pub fanout_max_concurrency: usize,
    pub location_max_age_ms: i64,
    pub escalation_interval_ms: i64,
    pub escalation_max_rounds: u32,
    pub worker_poll_interval_ms: u64,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("port", 3000)?
            .set_default("log_level", "info")?
            .set_default("data_backend", "memory")?
            .set_default("surreal_endpoint", "ws://127.0.0.1:8000")?
            .set_default("surreal_ns", "sos")?
            .set_default("surreal_db", "dispatch")?
            .set_default("surreal_user", "root")?
            .set_default("surreal_pass", "root")?
            .set_default("redis_url", "redis://127.0.0.1:6379")?
            .set_default("realtime_transport", "local")?
            .set_default("realtime_channel_prefix", "sos:updates")?
            .set_default("realtime_buffer", 64)?
            .set_default("jwt_secret", "dev-secret")?
            .set_default("alert_gateway_url", "")?
            .set_default("alert_gateway_token", "")?
            .set_default("alert_timeout_ms", 5000)?
            .set_default("fanout_max_concurrency", 8)?
            .set_default("location_max_age_ms", 120_000)?
            .set_default("escalation_interval_ms", 60_000)?
            .set_default("escalation_max_rounds", 10)?
            .set_default("worker_poll_interval_ms", 15_000)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn uses_surreal(&self) -> bool {
        self.data_backend.eq_ignore_ascii_case("surreal")
    }

    pub fn uses_redis_realtime(&self) -> bool {
        self.realtime_transport.eq_ignore_ascii_case("redis")
    }

    pub fn alert_timeout(&self) -> Duration {
        Duration::from_millis(self.alert_timeout_ms.max(1))
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms.max(100))
    }
}
