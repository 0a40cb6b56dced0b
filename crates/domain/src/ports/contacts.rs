use thiserror::Error;

use crate::DomainResult;
use crate::fanout::{ContactAlert, EmergencyContact};
use crate::ports::BoxFuture;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("alert gateway unavailable: {0}")]
    Unavailable(String),
    #[error("alert rejected: {0}")]
    Rejected(String),
    #[error("alert delivery timed out")]
    Timeout,
}

pub trait EmergencyContactDirectory: Send + Sync {
    fn list_for_subject(
        &self,
        subject_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<EmergencyContact>>>;
}

/// Out-of-band SMS/push transport.
pub trait ContactAlertSender: Send + Sync {
    fn send(&self, alert: &ContactAlert) -> BoxFuture<'_, Result<(), DeliveryError>>;
}
