use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use sos_domain::ports::BoxFuture;
use sos_domain::ports::idempotency::{
    ClaimOutcome, IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyStore,
    StoredResponse,
};

const DEFAULT_NAMESPACE: &str = "sos:idemp";
/// `SET NX` can lose to a key that expires before the follow-up `GET`.
const CLAIM_ATTEMPTS: usize = 2;

/// Request-id markers in Redis, shared by every API instance.
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    manager: ConnectionManager,
    namespace: String,
}

impl RedisIdempotencyStore {
    pub async fn connect(redis_url: &str) -> Result<Self, IdempotencyError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| IdempotencyError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| IdempotencyError::Unavailable(err.to_string()))?;
        Ok(Self {
            manager,
            namespace: DEFAULT_NAMESPACE.to_string(),
        })
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    async fn set_nx(
        &self,
        storage_key: &str,
        payload: &str,
        ttl: Duration,
    ) -> Result<bool, IdempotencyError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(storage_key)
            .arg(payload)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(reply.is_some())
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn store_error(err: redis::RedisError) -> IdempotencyError {
    if err.is_io_error() || err.is_connection_dropped() {
        IdempotencyError::Unavailable(err.to_string())
    } else {
        IdempotencyError::Store(err.to_string())
    }
}

fn to_json(record: &IdempotencyRecord) -> Result<String, IdempotencyError> {
    serde_json::to_string(record).map_err(|err| IdempotencyError::Corrupt(err.to_string()))
}

impl IdempotencyStore for RedisIdempotencyStore {
    fn claim(
        &self,
        key: &IdempotencyKey,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<ClaimOutcome, IdempotencyError>> {
        let storage_key = key.storage_key(&self.namespace);
        Box::pin(async move {
            let pending = to_json(&IdempotencyRecord::Pending)?;
            for _ in 0..CLAIM_ATTEMPTS {
                if self.set_nx(&storage_key, &pending, ttl).await? {
                    return Ok(ClaimOutcome::Claimed);
                }
                let mut conn = self.manager.clone();
                let held: Option<String> = conn.get(&storage_key).await.map_err(store_error)?;
                if let Some(held) = held {
                    let record = serde_json::from_str(&held)
                        .map_err(|err| IdempotencyError::Corrupt(err.to_string()))?;
                    return Ok(ClaimOutcome::Held(record));
                }
            }
            tracing::warn!(key = %storage_key, "idempotency claim kept racing expiry");
            Err(IdempotencyError::Store(format!("could not claim {storage_key}")))
        })
    }

    fn finish(
        &self,
        key: &IdempotencyKey,
        response: &StoredResponse,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        let storage_key = key.storage_key(&self.namespace);
        let record = IdempotencyRecord::Completed(response.clone());
        Box::pin(async move {
            let payload = to_json(&record)?;
            let mut conn = self.manager.clone();
            conn.pset_ex::<_, _, ()>(&storage_key, payload, millis(ttl))
                .await
                .map_err(store_error)
        })
    }

    fn release(&self, key: &IdempotencyKey) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        let storage_key = key.storage_key(&self.namespace);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            conn.del::<_, ()>(&storage_key).await.map_err(store_error)
        })
    }
}
