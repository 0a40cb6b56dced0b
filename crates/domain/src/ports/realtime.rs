use crate::ports::BoxFuture;
use crate::realtime::SosUpdateEvent;

/// Mirrors locally published updates to other instances. Delivery is best
/// effort; failures are the relay's to log.
pub trait SosUpdateRelay: Send + Sync {
    fn relay(&self, event: &SosUpdateEvent) -> BoxFuture<'_, ()>;
}
