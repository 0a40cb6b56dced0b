use crate::DomainResult;
use crate::fanout::{ResponderNotification, ResponderUnit};
use crate::ports::BoxFuture;

/// Partner availability registry.
pub trait ResponderDirectory: Send + Sync {
    fn list_available(&self) -> BoxFuture<'_, DomainResult<Vec<ResponderUnit>>>;
}

/// Write-once log of responders alerted for a request.
pub trait ResponderNotificationLog: Send + Sync {
    /// Stores the notifications whose `(sos_id, responder_id)` pair is not
    /// present yet and returns exactly those.
    fn record_new(
        &self,
        notifications: &[ResponderNotification],
    ) -> BoxFuture<'_, DomainResult<Vec<ResponderNotification>>>;

    fn list_by_request(
        &self,
        sos_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<ResponderNotification>>>;
}
