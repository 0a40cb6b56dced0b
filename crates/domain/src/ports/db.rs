use thiserror::Error;

use super::BoxFuture;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("storage unreachable: {0}")]
    Unreachable(String),
    #[error("storage did not answer in time")]
    Timeout,
}

/// Readiness check for whichever storage backend is configured.
pub trait StorageProbe: Send + Sync {
    fn backend(&self) -> &'static str;
    fn ping(&self) -> BoxFuture<'_, Result<(), ProbeError>>;
}
