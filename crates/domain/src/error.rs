use thiserror::Error;

use crate::sos::SosStatus;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("location unavailable: {0}")]
    LocationUnavailable(String),
    #[error("subject already has an active sos request")]
    DuplicateActiveRequest,
    #[error("sos request already claimed by another responder")]
    AlreadyClaimed,
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: SosStatus, to: SosStatus },
    #[error("operation not allowed while request is {0}")]
    InvalidState(SosStatus),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl DomainError {
    /// Errors that mean the caller acted on a stale view and must refresh
    /// before presenting state again.
    pub fn is_stale_view(&self) -> bool {
        matches!(
            self,
            Self::AlreadyClaimed | Self::InvalidTransition { .. } | Self::InvalidState(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::LocationUnavailable(_) => "location_unavailable",
            Self::DuplicateActiveRequest => "duplicate_active_request",
            Self::AlreadyClaimed => "already_claimed",
            Self::NotAuthorized(_) => "not_authorized",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidState(_) => "invalid_state",
            Self::Unavailable(_) => "unavailable",
        }
    }
}
