use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::ports::BoxFuture;
use crate::ports::idempotency::{
    ClaimOutcome, IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyStore,
    StoredResponse,
};

#[derive(Clone, Debug)]
pub struct IdempotencyConfig {
    /// How long a crashed attempt blocks retries of the same request id.
    pub pending_ttl: Duration,
    pub replay_ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            pending_ttl: Duration::from_secs(30),
            replay_ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Reservation {
    /// The caller owns the request id and must `record` or `release` it.
    Fresh,
    Pending,
    Replay(StoredResponse),
}

/// Replays successful writes for retried client requests. Failed attempts
/// `release` their marker so a retry is judged against current state.
#[derive(Clone)]
pub struct IdempotencyService {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
}

impl IdempotencyService {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub async fn reserve(&self, key: &IdempotencyKey) -> Result<Reservation, IdempotencyError> {
        let outcome = self.store.claim(key, self.config.pending_ttl).await?;
        Ok(match outcome {
            ClaimOutcome::Claimed => Reservation::Fresh,
            ClaimOutcome::Held(IdempotencyRecord::Pending) => Reservation::Pending,
            ClaimOutcome::Held(IdempotencyRecord::Completed(response)) => {
                Reservation::Replay(response)
            }
        })
    }

    pub async fn record(
        &self,
        key: &IdempotencyKey,
        response: &StoredResponse,
    ) -> Result<(), IdempotencyError> {
        self.store
            .finish(key, response, self.config.replay_ttl)
            .await
    }

    pub async fn release(&self, key: &IdempotencyKey) -> Result<(), IdempotencyError> {
        self.store.release(key).await
    }
}

/// Single-process store. Expired entries are swept on every claim so the map
/// stays proportional to the live window.
#[derive(Clone, Debug)]
pub struct InMemoryIdempotencyStore {
    namespace: String,
    entries: Arc<Mutex<HashMap<String, (IdempotencyRecord, Instant)>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: Arc::default(),
        }
    }

    fn write(&self, key: &IdempotencyKey, record: IdempotencyRecord, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.storage_key(&self.namespace), (record, expires_at));
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn claim(
        &self,
        key: &IdempotencyKey,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<ClaimOutcome, IdempotencyError>> {
        let storage_key = key.storage_key(&self.namespace);
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.retain(|_, (_, expires_at)| *expires_at > now);
            if let Some((record, _)) = entries.get(&storage_key) {
                return Ok(ClaimOutcome::Held(record.clone()));
            }
            entries.insert(storage_key, (IdempotencyRecord::Pending, now + ttl));
            Ok(ClaimOutcome::Claimed)
        })
    }

    fn finish(
        &self,
        key: &IdempotencyKey,
        response: &StoredResponse,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        self.write(key, IdempotencyRecord::Completed(response.clone()), ttl);
        Box::pin(async { Ok(()) })
    }

    fn release(&self, key: &IdempotencyKey) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key.storage_key(&self.namespace));
        Box::pin(async { Ok(()) })
    }
}
