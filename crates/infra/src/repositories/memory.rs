use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use sos_domain::DomainResult;
use sos_domain::error::DomainError;
use sos_domain::fanout::{EmergencyContact, ResponderNotification, ResponderUnit};
use sos_domain::ports::BoxFuture;
use sos_domain::ports::contacts::EmergencyContactDirectory;
use sos_domain::ports::responders::{ResponderDirectory, ResponderNotificationLog};
use sos_domain::ports::sos::{CasOutcome, SosRequestStore};
use sos_domain::sos::{SosRequest, SosStatus};
use tokio::sync::RwLock;

/// Process-local request store. One write lock covers the active-request
/// check and the insert, and the version check and the swap.
#[derive(Clone, Default)]
pub struct InMemorySosRequestStore {
    by_id: Arc<RwLock<HashMap<String, SosRequest>>>,
}

impl InMemorySosRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SosRequestStore for InMemorySosRequestStore {
    fn create_if_no_active(&self, request: &SosRequest) -> BoxFuture<'_, DomainResult<SosRequest>> {
        let request = request.clone();
        let by_id = self.by_id.clone();
        Box::pin(async move {
            let mut guard = by_id.write().await;
            if guard.contains_key(&request.sos_id) {
                return Err(DomainError::Conflict);
            }
            let blocked = guard.values().any(|existing| {
                existing.subject_id == request.subject_id && existing.status.blocks_new_request()
            });
            if blocked {
                return Err(DomainError::DuplicateActiveRequest);
            }
            guard.insert(request.sos_id.clone(), request.clone());
            Ok(request)
        })
    }

    fn get(&self, sos_id: &str) -> BoxFuture<'_, DomainResult<Option<SosRequest>>> {
        let sos_id = sos_id.to_string();
        let by_id = self.by_id.clone();
        Box::pin(async move { Ok(by_id.read().await.get(&sos_id).cloned()) })
    }

    fn compare_and_swap(
        &self,
        expected_version: u64,
        next: &SosRequest,
    ) -> BoxFuture<'_, DomainResult<CasOutcome>> {
        let next = next.clone();
        let by_id = self.by_id.clone();
        Box::pin(async move {
            let mut guard = by_id.write().await;
            let Some(stored) = guard.get_mut(&next.sos_id) else {
                return Ok(CasOutcome::Stale(None));
            };
            if stored.version != expected_version {
                return Ok(CasOutcome::Stale(Some(stored.clone())));
            }
            *stored = next.clone();
            Ok(CasOutcome::Applied(next))
        })
    }

    fn list_by_subject(&self, subject_id: &str) -> BoxFuture<'_, DomainResult<Vec<SosRequest>>> {
        let subject_id = subject_id.to_string();
        let by_id = self.by_id.clone();
        Box::pin(async move {
            let mut requests: Vec<SosRequest> = by_id
                .read()
                .await
                .values()
                .filter(|request| request.subject_id == subject_id)
                .cloned()
                .collect();
            requests.sort_by(|a, b| {
                b.created_at_ms
                    .cmp(&a.created_at_ms)
                    .then_with(|| b.sos_id.cmp(&a.sos_id))
            });
            Ok(requests)
        })
    }

    fn list_by_status(
        &self,
        status: SosStatus,
        created_after_ms: i64,
        created_before_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, DomainResult<Vec<SosRequest>>> {
        let by_id = self.by_id.clone();
        Box::pin(async move {
            let mut requests: Vec<SosRequest> = by_id
                .read()
                .await
                .values()
                .filter(|request| {
                    request.status == status
                        && request.created_at_ms > created_after_ms
                        && request.created_at_ms <= created_before_ms
                })
                .cloned()
                .collect();
            requests.sort_by(|a, b| {
                a.created_at_ms
                    .cmp(&b.created_at_ms)
                    .then_with(|| a.sos_id.cmp(&b.sos_id))
            });
            requests.truncate(limit);
            Ok(requests)
        })
    }
}

/// Availability registry for development and tests. Responders toggle their
/// own presence.
#[derive(Clone, Default)]
pub struct InMemoryResponderDirectory {
    units: Arc<RwLock<BTreeMap<String, ResponderUnit>>>,
}

impl InMemoryResponderDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_available(&self, unit: ResponderUnit, available: bool) {
        let mut guard = self.units.write().await;
        if available {
            guard.insert(unit.responder_id.clone(), unit);
        } else {
            guard.remove(&unit.responder_id);
        }
    }
}

impl ResponderDirectory for InMemoryResponderDirectory {
    fn list_available(&self) -> BoxFuture<'_, DomainResult<Vec<ResponderUnit>>> {
        let units = self.units.clone();
        Box::pin(async move { Ok(units.read().await.values().cloned().collect()) })
    }
}

#[derive(Clone, Default)]
pub struct InMemoryResponderNotificationLog {
    entries: Arc<RwLock<Vec<ResponderNotification>>>,
    seen: Arc<RwLock<HashSet<(String, String)>>>,
}

impl InMemoryResponderNotificationLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResponderNotificationLog for InMemoryResponderNotificationLog {
    fn record_new(
        &self,
        notifications: &[ResponderNotification],
    ) -> BoxFuture<'_, DomainResult<Vec<ResponderNotification>>> {
        let notifications = notifications.to_vec();
        let entries = self.entries.clone();
        let seen = self.seen.clone();
        Box::pin(async move {
            let mut seen = seen.write().await;
            let fresh: Vec<ResponderNotification> = notifications
                .into_iter()
                .filter(|n| seen.insert((n.sos_id.clone(), n.responder_id.clone())))
                .collect();
            entries.write().await.extend(fresh.iter().cloned());
            Ok(fresh)
        })
    }

    fn list_by_request(
        &self,
        sos_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<ResponderNotification>>> {
        let sos_id = sos_id.to_string();
        let entries = self.entries.clone();
        Box::pin(async move {
            Ok(entries
                .read()
                .await
                .iter()
                .filter(|n| n.sos_id == sos_id)
                .cloned()
                .collect())
        })
    }
}

#[derive(Clone, Default)]
pub struct InMemoryEmergencyContactDirectory {
    by_subject: Arc<RwLock<HashMap<String, Vec<EmergencyContact>>>>,
}

impl InMemoryEmergencyContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, contact: EmergencyContact) {
        let mut guard = self.by_subject.write().await;
        let contacts = guard.entry(contact.subject_id.clone()).or_default();
        contacts.retain(|existing| existing.contact_id != contact.contact_id);
        contacts.push(contact);
    }
}

impl EmergencyContactDirectory for InMemoryEmergencyContactDirectory {
    fn list_for_subject(
        &self,
        subject_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<EmergencyContact>>> {
        let subject_id = subject_id.to_string();
        let by_subject = self.by_subject.clone();
        Box::pin(async move {
            Ok(by_subject
                .read()
                .await
                .get(&subject_id)
                .cloned()
                .unwrap_or_default())
        })
    }
}
