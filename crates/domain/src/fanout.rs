use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::geo::LocationSample;
use crate::identity::ActorIdentity;
use crate::ports::contacts::{ContactAlertSender, DeliveryError, EmergencyContactDirectory};
use crate::ports::responders::{ResponderDirectory, ResponderNotificationLog};
use crate::sos::SosRequest;

pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponderUnit {
    pub responder_id: String,
    pub display_name: String,
}

/// Write-once record that a responder was alerted for a request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponderNotification {
    pub sos_id: String,
    pub responder_id: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmergencyContact {
    pub contact_id: String,
    pub subject_id: String,
    pub name: String,
    pub phone: String,
    pub notify_on_sos: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContactAlert {
    pub sos_id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub contact_id: String,
    pub contact_name: String,
    pub phone: String,
    pub location: LocationSample,
    pub location_reference: String,
    pub message: String,
}

impl ContactAlert {
    pub fn build(
        contact: &EmergencyContact,
        subject: &ActorIdentity,
        sos_id: &str,
        location: &LocationSample,
    ) -> Self {
        let location_reference = location.maps_reference();
        let message = format!(
            "{} triggered an SOS alert. Last known location: {location_reference}",
            subject.username
        );
        Self {
            sos_id: sos_id.to_string(),
            subject_id: subject.user_id.clone(),
            subject_name: subject.username.clone(),
            contact_id: contact.contact_id.clone(),
            contact_name: contact.name.clone(),
            phone: contact.phone.clone(),
            location: *location,
            location_reference,
            message,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponderFanoutReport {
    /// Units the directory reported as available.
    pub available: usize,
    /// Units alerted by this call; already-alerted units are not counted again.
    pub notified: usize,
    pub directory_failed: bool,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactFanoutReport {
    /// Contacts on file for the subject, opted in or not.
    pub total: usize,
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchSummary {
    pub responders_notified: usize,
    pub contacts_notified: usize,
    pub contacts_total: usize,
    /// Zero for the dispatch at creation, then one per escalation round.
    pub round: u32,
}

impl DispatchSummary {
    pub fn from_reports(
        responders: ResponderFanoutReport,
        contacts: ContactFanoutReport,
        round: u32,
    ) -> Self {
        Self {
            responders_notified: responders.notified,
            contacts_notified: contacts.delivered,
            contacts_total: contacts.attempted,
            round,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FanoutConfig {
    pub max_concurrency: usize,
    pub send_timeout: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Best-effort broadcast of a new request. Nothing here fails the owning
/// operation: every collaborator error is logged and folded into a count.
#[derive(Clone)]
pub struct FanoutNotifier {
    directory: Arc<dyn ResponderDirectory>,
    notifications: Arc<dyn ResponderNotificationLog>,
    contacts: Arc<dyn EmergencyContactDirectory>,
    sender: Arc<dyn ContactAlertSender>,
    config: FanoutConfig,
}

impl FanoutNotifier {
    pub fn new(
        directory: Arc<dyn ResponderDirectory>,
        notifications: Arc<dyn ResponderNotificationLog>,
        contacts: Arc<dyn EmergencyContactDirectory>,
        sender: Arc<dyn ContactAlertSender>,
        config: FanoutConfig,
    ) -> Self {
        Self {
            directory,
            notifications,
            contacts,
            sender,
            config,
        }
    }

    pub async fn notify_responders(
        &self,
        sos_id: &str,
        location: &LocationSample,
        now_ms: i64,
    ) -> ResponderFanoutReport {
        let units = match self.directory.list_available().await {
            Ok(units) => units,
            Err(err) => {
                tracing::warn!(sos_id, error = %err, "responder directory read failed");
                return ResponderFanoutReport {
                    directory_failed: true,
                    ..ResponderFanoutReport::default()
                };
            }
        };
        let available = units.len();
        if units.is_empty() {
            tracing::info!(sos_id, "no responders available; request stays searching");
            return ResponderFanoutReport::default();
        }

        let batch: Vec<ResponderNotification> = units
            .into_iter()
            .map(|unit| ResponderNotification {
                sos_id: sos_id.to_string(),
                responder_id: unit.responder_id,
                created_at_ms: now_ms,
            })
            .collect();

        let notified = match self.notifications.record_new(&batch).await {
            Ok(recorded) => recorded.len(),
            Err(err) => {
                tracing::warn!(sos_id, error = %err, "recording responder notifications failed");
                0
            }
        };
        tracing::info!(
            sos_id,
            available,
            notified,
            latitude = location.latitude,
            longitude = location.longitude,
            "responders notified"
        );
        ResponderFanoutReport {
            available,
            notified,
            directory_failed: false,
        }
    }

    pub async fn notify_contacts(
        &self,
        subject: &ActorIdentity,
        sos_id: &str,
        location: &LocationSample,
    ) -> ContactFanoutReport {
        let contacts = match self.contacts.list_for_subject(&subject.user_id).await {
            Ok(contacts) => contacts,
            Err(err) => {
                tracing::warn!(
                    sos_id,
                    subject_id = %subject.user_id,
                    error = %err,
                    "emergency contact lookup failed"
                );
                return ContactFanoutReport::default();
            }
        };
        let total = contacts.len();
        let alerts: Vec<ContactAlert> = contacts
            .iter()
            .filter(|contact| contact.notify_on_sos)
            .map(|contact| ContactAlert::build(contact, subject, sos_id, location))
            .collect();
        let attempted = alerts.len();

        let sender = self.sender.clone();
        let send_timeout = self.config.send_timeout;
        let results: Vec<Result<(), DeliveryError>> = stream::iter(alerts)
            .map(|alert| {
                let sender = sender.clone();
                async move {
                    let outcome = match tokio::time::timeout(send_timeout, sender.send(&alert)).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(DeliveryError::Timeout),
                    };
                    if let Err(err) = &outcome {
                        tracing::warn!(
                            sos_id = %alert.sos_id,
                            contact_id = %alert.contact_id,
                            error = %err,
                            "contact alert failed"
                        );
                    }
                    outcome
                }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let delivered = results.iter().filter(|result| result.is_ok()).count();
        let report = ContactFanoutReport {
            total,
            attempted,
            delivered,
            failed: attempted - delivered,
        };
        tracing::info!(
            sos_id,
            total,
            attempted,
            delivered,
            failed = report.failed,
            "emergency contacts notified"
        );
        report
    }

    /// Runs both fan-outs for a freshly created request.
    pub async fn dispatch(
        &self,
        request: &SosRequest,
        subject: &ActorIdentity,
        now_ms: i64,
    ) -> (ResponderFanoutReport, ContactFanoutReport) {
        tokio::join!(
            self.notify_responders(&request.sos_id, &request.location, now_ms),
            self.notify_contacts(subject, &request.sos_id, &request.location),
        )
    }

    pub async fn list_notifications(
        &self,
        sos_id: &str,
    ) -> crate::DomainResult<Vec<ResponderNotification>> {
        self.notifications.list_by_request(sos_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DomainResult;
    use crate::error::DomainError;
    use crate::ports::BoxFuture;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct StaticDirectory(Option<Vec<ResponderUnit>>);

    impl ResponderDirectory for StaticDirectory {
        fn list_available(&self) -> BoxFuture<'_, DomainResult<Vec<ResponderUnit>>> {
            let units = self.0.clone();
            Box::pin(async move { units.ok_or(DomainError::Unavailable("directory down".into())) })
        }
    }

    #[derive(Default)]
    struct MemoryLog(Mutex<Vec<ResponderNotification>>);

    impl ResponderNotificationLog for MemoryLog {
        fn record_new(
            &self,
            notifications: &[ResponderNotification],
        ) -> BoxFuture<'_, DomainResult<Vec<ResponderNotification>>> {
            let notifications = notifications.to_vec();
            Box::pin(async move {
                let mut guard = self.0.lock().unwrap();
                let seen: HashSet<(String, String)> = guard
                    .iter()
                    .map(|n| (n.sos_id.clone(), n.responder_id.clone()))
                    .collect();
                let fresh: Vec<_> = notifications
                    .into_iter()
                    .filter(|n| !seen.contains(&(n.sos_id.clone(), n.responder_id.clone())))
                    .collect();
                guard.extend(fresh.iter().cloned());
                Ok(fresh)
            })
        }

        fn list_by_request(
            &self,
            sos_id: &str,
        ) -> BoxFuture<'_, DomainResult<Vec<ResponderNotification>>> {
            let sos_id = sos_id.to_string();
            Box::pin(async move {
                Ok(self
                    .0
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|n| n.sos_id == sos_id)
                    .cloned()
                    .collect())
            })
        }
    }

    struct StaticContacts(Vec<EmergencyContact>);

    impl EmergencyContactDirectory for StaticContacts {
        fn list_for_subject(
            &self,
            subject_id: &str,
        ) -> BoxFuture<'_, DomainResult<Vec<EmergencyContact>>> {
            let subject_id = subject_id.to_string();
            Box::pin(async move {
                Ok(self
                    .0
                    .iter()
                    .filter(|c| c.subject_id == subject_id)
                    .cloned()
                    .collect())
            })
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<ContactAlert>>,
        fail_for: Option<String>,
        hang_for: Option<String>,
    }

    impl ContactAlertSender for RecordingSender {
        fn send(&self, alert: &ContactAlert) -> BoxFuture<'_, Result<(), DeliveryError>> {
            let alert = alert.clone();
            Box::pin(async move {
                if self.hang_for.as_deref() == Some(alert.contact_id.as_str()) {
                    std::future::pending::<()>().await;
                }
                if self.fail_for.as_deref() == Some(alert.contact_id.as_str()) {
                    return Err(DeliveryError::Rejected("invalid number".into()));
                }
                self.sent.lock().unwrap().push(alert);
                Ok(())
            })
        }
    }

    fn contact(id: &str, notify: bool) -> EmergencyContact {
        EmergencyContact {
            contact_id: id.to_string(),
            subject_id: "subject-1".into(),
            name: format!("contact {id}"),
            phone: "+620000".into(),
            notify_on_sos: notify,
        }
    }

    fn unit(id: &str) -> ResponderUnit {
        ResponderUnit {
            responder_id: id.to_string(),
            display_name: id.to_uppercase(),
        }
    }

    fn subject() -> ActorIdentity {
        ActorIdentity {
            user_id: "subject-1".into(),
            username: "sari".into(),
        }
    }

    fn location() -> LocationSample {
        LocationSample {
            latitude: 12.97,
            longitude: 77.59,
            sampled_at_ms: 1_000,
        }
    }

    fn notifier(
        units: Option<Vec<ResponderUnit>>,
        contacts: Vec<EmergencyContact>,
        sender: Arc<RecordingSender>,
    ) -> FanoutNotifier {
        FanoutNotifier::new(
            Arc::new(StaticDirectory(units)),
            Arc::new(MemoryLog::default()),
            Arc::new(StaticContacts(contacts)),
            sender,
            FanoutConfig {
                max_concurrency: 2,
                send_timeout: Duration::from_millis(50),
            },
        )
    }

    #[tokio::test]
    async fn only_opted_in_contacts_are_alerted() {
        let sender = Arc::new(RecordingSender::default());
        let notifier = notifier(
            Some(vec![]),
            vec![contact("c1", true), contact("c2", false)],
            sender.clone(),
        );

        let report = notifier
            .notify_contacts(&subject(), "sos-1", &location())
            .await;

        assert_eq!(report.total, 2);
        assert_eq!(report.attempted, 1);
        assert_eq!(report.delivered, 1);
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].contact_id, "c1");
        assert!(sent[0].message.contains("sari"));
        assert!(sent[0].location_reference.contains("12.970000,77.590000"));
    }

    #[tokio::test]
    async fn contact_failures_are_counted_not_raised() {
        let sender = Arc::new(RecordingSender {
            fail_for: Some("c2".into()),
            hang_for: Some("c3".into()),
            ..RecordingSender::default()
        });
        let notifier = notifier(
            Some(vec![]),
            vec![contact("c1", true), contact("c2", true), contact("c3", true)],
            sender,
        );

        let report = notifier
            .notify_contacts(&subject(), "sos-1", &location())
            .await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 2);
    }

    #[tokio::test]
    async fn empty_directory_notifies_nobody() {
        let notifier = notifier(Some(vec![]), vec![], Arc::new(RecordingSender::default()));
        let report = notifier.notify_responders("sos-1", &location(), 10).await;
        assert_eq!(report, ResponderFanoutReport::default());
    }

    #[tokio::test]
    async fn directory_failure_degrades_to_zero() {
        let notifier = notifier(None, vec![], Arc::new(RecordingSender::default()));
        let report = notifier.notify_responders("sos-1", &location(), 10).await;
        assert_eq!(report.notified, 0);
        assert!(report.directory_failed);
    }

    #[tokio::test]
    async fn responders_are_notified_once_per_request() {
        let notifier = notifier(
            Some(vec![unit("r1"), unit("r2")]),
            vec![],
            Arc::new(RecordingSender::default()),
        );

        let first = notifier.notify_responders("sos-1", &location(), 10).await;
        let second = notifier.notify_responders("sos-1", &location(), 20).await;

        assert_eq!(first.notified, 2);
        assert_eq!(second.available, 2);
        assert_eq!(second.notified, 0);
        let log = notifier.list_notifications("sos-1").await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|n| n.created_at_ms == 10));
    }
}
