use std::sync::Arc;
use std::time::Duration;

use sos_domain::escalation::EscalationPolicy;
use sos_domain::fanout::{FanoutConfig, FanoutNotifier};
use sos_domain::geo::LocationPolicy;
use sos_domain::ports::contacts::{ContactAlertSender, EmergencyContactDirectory};
use sos_domain::ports::db::StorageProbe;
use sos_domain::ports::responders::{ResponderDirectory, ResponderNotificationLog};
use sos_domain::ports::sos::SosRequestStore;

use crate::alerts::{HttpContactAlertSender, LoggingContactAlertSender};
use crate::config::AppConfig;
use crate::db::{self, MemoryProbe, SurrealProbe, SurrealSettings};
use crate::repositories::{
    InMemoryEmergencyContactDirectory, InMemoryResponderDirectory,
    InMemoryResponderNotificationLog, InMemorySosRequestStore, SurrealEmergencyContactDirectory,
    SurrealResponderDirectory, SurrealResponderNotificationLog, SurrealSosRequestStore,
    apply_schema,
};

/// Storage and delivery adapters selected by `data_backend`.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn SosRequestStore>,
    pub directory: Arc<dyn ResponderDirectory>,
    pub notifications: Arc<dyn ResponderNotificationLog>,
    pub contacts: Arc<dyn EmergencyContactDirectory>,
    pub sender: Arc<dyn ContactAlertSender>,
    pub probe: Arc<dyn StorageProbe>,
    /// Set only for the memory backend, where responders register presence
    /// through the API.
    pub memory_directory: Option<InMemoryResponderDirectory>,
}

impl Backends {
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let sender = alert_sender(config);
        if config.uses_surreal() {
            let settings = SurrealSettings::from(config);
            let client = Arc::new(db::connect(&settings).await?);
            apply_schema(&client).await?;
            tracing::info!(endpoint = %settings.endpoint, "using surreal backend");
            return Ok(Self {
                store: Arc::new(SurrealSosRequestStore::with_client(client.clone())),
                directory: Arc::new(SurrealResponderDirectory::with_client(client.clone())),
                notifications: Arc::new(SurrealResponderNotificationLog::with_client(
                    client.clone(),
                )),
                contacts: Arc::new(SurrealEmergencyContactDirectory::with_client(
                    client.clone(),
                )),
                sender,
                probe: Arc::new(SurrealProbe::new(client)),
                memory_directory: None,
            });
        }

        tracing::info!("using in-memory backend");
        Ok(Self::in_memory(sender))
    }

    pub fn in_memory(sender: Arc<dyn ContactAlertSender>) -> Self {
        let directory = InMemoryResponderDirectory::new();
        Self {
            store: Arc::new(InMemorySosRequestStore::new()),
            directory: Arc::new(directory.clone()),
            notifications: Arc::new(InMemoryResponderNotificationLog::new()),
            contacts: Arc::new(InMemoryEmergencyContactDirectory::new()),
            sender,
            probe: Arc::new(MemoryProbe),
            memory_directory: Some(directory),
        }
    }

    pub fn notifier(&self, config: FanoutConfig) -> FanoutNotifier {
        FanoutNotifier::new(
            self.directory.clone(),
            self.notifications.clone(),
            self.contacts.clone(),
            self.sender.clone(),
            config,
        )
    }
}

fn alert_sender(config: &AppConfig) -> Arc<dyn ContactAlertSender> {
    match HttpContactAlertSender::from_config(config) {
        Some(sender) => Arc::new(sender),
        None => {
            tracing::warn!("no usable alert gateway; contact alerts are only logged");
            Arc::new(LoggingContactAlertSender)
        }
    }
}

pub fn fanout_config(config: &AppConfig) -> FanoutConfig {
    FanoutConfig {
        max_concurrency: config.fanout_max_concurrency.max(1),
        // The gateway client has its own timeout; leave headroom for one retry.
        send_timeout: config.alert_timeout() * 2 + Duration::from_millis(500),
    }
}

pub fn location_policy(config: &AppConfig) -> LocationPolicy {
    LocationPolicy {
        max_age_ms: config.location_max_age_ms,
        ..LocationPolicy::default()
    }
}

pub fn escalation_policy(config: &AppConfig) -> EscalationPolicy {
    EscalationPolicy {
        interval_ms: config.escalation_interval_ms,
        max_rounds: config.escalation_max_rounds,
    }
}
