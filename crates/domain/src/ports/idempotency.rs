use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::BoxFuture;

/// Write operations that accept a client request id.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SosOperation {
    Create,
    Accept,
    Advance,
    UpdateLocation,
    Cancel,
}

impl SosOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Accept => "accept",
            Self::Advance => "advance",
            Self::UpdateLocation => "update_location",
            Self::Cancel => "cancel",
        }
    }
}

/// `scope_id` is the sos id, or the subject id for `Create`. `actor_id` keeps
/// two callers that happen to reuse a request id apart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdempotencyKey {
    pub operation: SosOperation,
    pub scope_id: String,
    pub actor_id: String,
    pub request_id: String,
}

impl IdempotencyKey {
    pub fn new(
        operation: SosOperation,
        scope_id: impl Into<String>,
        actor_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            scope_id: scope_id.into(),
            actor_id: actor_id.into(),
            request_id: request_id.into(),
        }
    }

    pub fn storage_key(&self, namespace: &str) -> String {
        [
            namespace,
            self.operation.as_str(),
            &self.scope_id,
            &self.actor_id,
            &self.request_id,
        ]
        .join(":")
    }
}

/// The HTTP answer handed back verbatim when a request id is replayed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", content = "response", rename_all = "snake_case")]
pub enum IdempotencyRecord {
    Pending,
    Completed(StoredResponse),
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),
    #[error("idempotency record unreadable: {0}")]
    Corrupt(String),
    #[error("idempotency store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// A pending marker now holds the key for this caller.
    Claimed,
    /// Someone got there first; carries what they left behind.
    Held(IdempotencyRecord),
}

pub trait IdempotencyStore: Send + Sync {
    /// Atomically places a pending marker unless a live record exists.
    fn claim(
        &self,
        key: &IdempotencyKey,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<ClaimOutcome, IdempotencyError>>;
    fn finish(
        &self,
        key: &IdempotencyKey,
        response: &StoredResponse,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), IdempotencyError>>;
    fn release(&self, key: &IdempotencyKey) -> BoxFuture<'_, Result<(), IdempotencyError>>;
}
