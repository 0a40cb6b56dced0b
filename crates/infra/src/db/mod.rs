use std::sync::Arc;
use std::time::Duration;

use sos_domain::ports::BoxFuture;
use sos_domain::ports::db::{ProbeError, StorageProbe};
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::{Client, Ws};
use surrealdb::opt::auth::Root;
use tokio::time::timeout;

use crate::config::AppConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SurrealSettings {
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl From<&AppConfig> for SurrealSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            endpoint: config.surreal_endpoint.clone(),
            namespace: config.surreal_ns.clone(),
            database: config.surreal_db.clone(),
            username: config.surreal_user.clone(),
            password: config.surreal_pass.clone(),
        }
    }
}

/// Opens one authenticated session shared by every Surreal repository.
pub async fn connect(settings: &SurrealSettings) -> anyhow::Result<Surreal<Client>> {
    let address = ws_address(&settings.endpoint);
    let db = timeout(CONNECT_TIMEOUT, Surreal::new::<Ws>(address))
        .await
        .map_err(|_| anyhow::anyhow!("timed out connecting to surreal at {address}"))??;
    db.signin(Root {
        username: &settings.username,
        password: &settings.password,
    })
    .await?;
    db.use_ns(&settings.namespace)
        .use_db(&settings.database)
        .await?;
    Ok(db)
}

// The ws engine takes host:port and adds its own scheme.
fn ws_address(endpoint: &str) -> &str {
    let endpoint = endpoint.trim().trim_end_matches('/');
    endpoint
        .strip_prefix("ws://")
        .or_else(|| endpoint.strip_prefix("wss://"))
        .unwrap_or(endpoint)
}

/// Pings the session the repositories share, so a dropped socket shows up
/// as degraded health rather than as failing writes.
#[derive(Clone)]
pub struct SurrealProbe {
    client: Arc<Surreal<Client>>,
}

impl SurrealProbe {
    pub fn new(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }
}

impl StorageProbe for SurrealProbe {
    fn backend(&self) -> &'static str {
        "surrealdb"
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), ProbeError>> {
        Box::pin(async move {
            timeout(PING_TIMEOUT, self.client.health())
                .await
                .map_err(|_| ProbeError::Timeout)?
                .map_err(|err| ProbeError::Unreachable(err.to_string()))
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryProbe;

impl StorageProbe for MemoryProbe {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), ProbeError>> {
        Box::pin(async { Ok(()) })
    }
}
