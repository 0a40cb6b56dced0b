use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::fanout::DispatchSummary;
use crate::ports::realtime::SosUpdateRelay;
use crate::sos::SosRequest;

pub const DEFAULT_TOPIC_CAPACITY: usize = 64;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SosUpdateEvent {
    /// Full record after an accepted write.
    Snapshot { request: SosRequest },
    /// Outcome of a fan-out round for the request at `version`.
    Dispatch {
        sos_id: String,
        version: u64,
        summary: DispatchSummary,
    },
}

impl SosUpdateEvent {
    pub fn sos_id(&self) -> &str {
        match self {
            Self::Snapshot { request } => &request.sos_id,
            Self::Dispatch { sos_id, .. } => sos_id,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Self::Snapshot { request } => request.version,
            Self::Dispatch { version, .. } => *version,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Snapshot { request } if request.status.is_terminal())
    }
}

type Topics = Arc<Mutex<HashMap<String, broadcast::Sender<SosUpdateEvent>>>>;

/// Per-request publish/subscribe topics. A topic exists only while it has at
/// least one live lease.
#[derive(Clone)]
pub struct SosUpdateHub {
    topics: Topics,
    capacity: usize,
    relay: Option<Arc<dyn SosUpdateRelay>>,
}

impl Default for SosUpdateHub {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

impl SosUpdateHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
            relay: None,
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn SosUpdateRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn subscribe(&self, sos_id: &str) -> TopicLease {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let receiver = topics
            .entry(sos_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        TopicLease {
            sos_id: sos_id.to_string(),
            receiver: Some(receiver),
            topics: self.topics.clone(),
        }
    }

    /// Delivers to local subscribers, then to the relay if one is attached.
    pub async fn publish(&self, event: SosUpdateEvent) {
        self.publish_local(&event);
        if let Some(relay) = &self.relay {
            relay.relay(&event).await;
        }
    }

    /// Local delivery only. Used for events arriving from other instances.
    pub fn publish_local(&self, event: &SosUpdateEvent) -> usize {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        match topics.get(event.sos_id()) {
            Some(sender) => sender.send(event.clone()).unwrap_or(0),
            None => 0,
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn subscriber_count(&self, sos_id: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sos_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

/// Owned receiver for one topic. Dropping it releases the receiver and prunes
/// the topic once nobody else listens.
pub struct TopicLease {
    sos_id: String,
    receiver: Option<broadcast::Receiver<SosUpdateEvent>>,
    topics: Topics,
}

impl TopicLease {
    pub fn sos_id(&self) -> &str {
        &self.sos_id
    }

    async fn recv(&mut self) -> Result<SosUpdateEvent, RecvError> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => Err(RecvError::Closed),
        }
    }
}

impl Drop for TopicLease {
    fn drop(&mut self) {
        drop(self.receiver.take());
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if topics
            .get(&self.sos_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            topics.remove(&self.sos_id);
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionItem {
    Update(SosUpdateEvent),
    /// Updates were dropped; the consumer must re-fetch before trusting state.
    Resync,
}

/// Ordered view of one request's updates. Snapshots are yielded with strictly
/// increasing versions; the stream ends after a terminal snapshot.
pub struct SosSubscription {
    lease: TopicLease,
    seed: Option<SosRequest>,
    last_version: u64,
    finished: bool,
    /// Responder watching an unclaimed request they are not part of.
    bystander: Option<String>,
    stood_down: bool,
}

impl SosSubscription {
    pub fn new(lease: TopicLease, seed: SosRequest) -> Self {
        Self {
            lease,
            seed: Some(seed),
            last_version: 0,
            finished: false,
            bystander: None,
            stood_down: false,
        }
    }

    /// Ends the subscription once another responder claims the request. The
    /// claiming snapshot is still delivered, without the claimant's position.
    pub fn until_claimed_by_other(mut self, viewer_id: impl Into<String>) -> Self {
        self.bystander = Some(viewer_id.into());
        self
    }

    /// True when the subscription ended because someone else claimed it.
    pub fn stood_down(&self) -> bool {
        self.stood_down
    }

    pub fn sos_id(&self) -> &str {
        self.lease.sos_id()
    }

    pub fn last_version(&self) -> u64 {
        self.last_version
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub async fn next(&mut self) -> Option<SubscriptionItem> {
        if let Some(seed) = self.seed.take() {
            return self.accept(SosUpdateEvent::Snapshot { request: seed });
        }
        while !self.finished {
            match self.lease.recv().await {
                Ok(event) => {
                    if let Some(item) = self.accept(event) {
                        return Some(item);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(sos_id = %self.sos_id(), skipped, "subscriber lagged");
                    return Some(SubscriptionItem::Resync);
                }
                Err(RecvError::Closed) => self.finished = true,
            }
        }
        None
    }

    /// Feeds a freshly read record through the same ordering rule; returns
    /// the snapshot only if it is newer than anything already yielded.
    pub fn reconcile(&mut self, current: SosRequest) -> Option<SosUpdateEvent> {
        match self.accept(SosUpdateEvent::Snapshot { request: current }) {
            Some(SubscriptionItem::Update(event)) => Some(event),
            _ => None,
        }
    }

    fn accept(&mut self, event: SosUpdateEvent) -> Option<SubscriptionItem> {
        if self.finished || event.sos_id() != self.lease.sos_id() {
            return None;
        }
        let fresh = match &event {
            SosUpdateEvent::Snapshot { request } => request.version > self.last_version,
            SosUpdateEvent::Dispatch { version, .. } => *version >= self.last_version,
        };
        if !fresh {
            return None;
        }
        self.last_version = event.version();
        if event.is_terminal() {
            self.finished = true;
        }
        let event = self.stand_down_if_claimed_elsewhere(event);
        Some(SubscriptionItem::Update(event))
    }

    fn stand_down_if_claimed_elsewhere(&mut self, event: SosUpdateEvent) -> SosUpdateEvent {
        let Some(viewer) = self.bystander.as_deref() else {
            return event;
        };
        match event {
            SosUpdateEvent::Snapshot { mut request }
                if request.status.is_claimed() && !request.is_claimed_by(viewer) =>
            {
                request.responder_location = None;
                request.estimated_arrival_ms = None;
                self.finished = true;
                self.stood_down = true;
                SosUpdateEvent::Snapshot { request }
            }
            other => other,
        }
    }
}
