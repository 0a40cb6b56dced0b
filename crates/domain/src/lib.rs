pub mod auth;
pub mod dispatch;
pub mod error;
pub mod escalation;
pub mod fanout;
pub mod geo;
pub mod idempotency;
pub mod identity;
pub mod ports;
pub mod realtime;
pub mod sos;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
