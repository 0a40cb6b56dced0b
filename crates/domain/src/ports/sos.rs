use crate::DomainResult;
use crate::ports::BoxFuture;
use crate::sos::{SosRequest, SosStatus};

/// Result of a conditional write.
#[derive(Clone, Debug, PartialEq)]
pub enum CasOutcome {
    Applied(SosRequest),
    /// The stored version no longer matched; carries the record as it is now.
    Stale(Option<SosRequest>),
}

/// Durable SOS request storage. Every mutation goes through
/// `compare_and_swap`; there is no blind overwrite.
#[allow(clippy::needless_pass_by_value)]
pub trait SosRequestStore: Send + Sync {
    /// Inserts the request unless the subject already holds one in a blocking
    /// status. The check and the insert are one atomic step; a violation is
    /// `DomainError::DuplicateActiveRequest`.
    fn create_if_no_active(&self, request: &SosRequest) -> BoxFuture<'_, DomainResult<SosRequest>>;

    fn get(&self, sos_id: &str) -> BoxFuture<'_, DomainResult<Option<SosRequest>>>;

    /// Replaces the record iff its stored version equals `expected_version`.
    fn compare_and_swap(
        &self,
        expected_version: u64,
        next: &SosRequest,
    ) -> BoxFuture<'_, DomainResult<CasOutcome>>;

    /// Newest first.
    fn list_by_subject(&self, subject_id: &str) -> BoxFuture<'_, DomainResult<Vec<SosRequest>>>;

    /// Requests created in `(created_after_ms, created_before_ms]`, oldest
    /// first, bounded by `limit`.
    fn list_by_status(
        &self,
        status: SosStatus,
        created_after_ms: i64,
        created_before_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, DomainResult<Vec<SosRequest>>>;
}
