use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use metrics::counter;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sos_domain::ports::BoxFuture;
use sos_domain::ports::realtime::SosUpdateRelay;
use sos_domain::realtime::{SosUpdateEvent, SosUpdateHub};
use tokio::task::JoinHandle;

use crate::config::AppConfig;

const BRIDGE_EVENTS_TOTAL: &str = "sos_realtime_bridge_events_total";
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Wire form on the Redis channel. `origin` lets an instance skip its own
/// publishes when they come back through the pattern subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelayEnvelope {
    origin: String,
    event: SosUpdateEvent,
}

fn channel_for(prefix: &str, sos_id: &str) -> String {
    format!("{prefix}:{sos_id}")
}

#[derive(Clone)]
pub struct RedisSosUpdateRelay {
    manager: ConnectionManager,
    prefix: String,
    origin: String,
}

impl RedisSosUpdateRelay {
    pub async fn connect(
        redis_url: &str,
        prefix: impl Into<String>,
        origin: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
            origin: origin.into(),
        })
    }
}

impl SosUpdateRelay for RedisSosUpdateRelay {
    fn relay(&self, event: &SosUpdateEvent) -> BoxFuture<'_, ()> {
        let channel = channel_for(&self.prefix, event.sos_id());
        let envelope = RelayEnvelope {
            origin: self.origin.clone(),
            event: event.clone(),
        };
        Box::pin(async move {
            let payload = match serde_json::to_string(&envelope) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::error!(error = %err, "realtime envelope encode failed");
                    return;
                }
            };
            let mut conn = self.manager.clone();
            let published: redis::RedisResult<u64> = conn.publish(&channel, payload).await;
            match published {
                Ok(_) => {
                    counter!(BRIDGE_EVENTS_TOTAL, "direction" => "out", "outcome" => "ok")
                        .increment(1);
                }
                Err(err) => {
                    counter!(BRIDGE_EVENTS_TOTAL, "direction" => "out", "outcome" => "error")
                        .increment(1);
                    tracing::warn!(channel, error = %err, "realtime relay publish failed");
                }
            }
        })
    }
}

/// Local hub sized from config. With the redis transport every publish is
/// also mirrored to the channel under `origin`.
pub async fn configured_hub(config: &AppConfig, origin: &str) -> anyhow::Result<SosUpdateHub> {
    let hub = SosUpdateHub::new(config.realtime_buffer);
    if !config.uses_redis_realtime() {
        return Ok(hub);
    }
    let relay = RedisSosUpdateRelay::connect(
        &config.redis_url,
        config.realtime_channel_prefix.clone(),
        origin,
    )
    .await?;
    Ok(hub.with_relay(Arc::new(relay)))
}

/// Re-injects updates published by other instances into the local hub.
/// Reconnects until the task is aborted.
pub fn spawn_redis_bridge(
    redis_url: String,
    prefix: String,
    origin: String,
    hub: SosUpdateHub,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(err) = run_bridge(&redis_url, &prefix, &origin, &hub).await {
                tracing::warn!(error = %err, "realtime bridge disconnected");
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    })
}

async fn run_bridge(
    redis_url: &str,
    prefix: &str,
    origin: &str,
    hub: &SosUpdateHub,
) -> anyhow::Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(format!("{prefix}:*")).await?;
    tracing::info!(prefix, "realtime bridge subscribed");

    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "realtime bridge payload unreadable");
                continue;
            }
        };
        match decode_remote(&payload, origin) {
            Some(event) => {
                let delivered = hub.publish_local(&event);
                counter!(BRIDGE_EVENTS_TOTAL, "direction" => "in", "outcome" => "ok").increment(1);
                tracing::debug!(sos_id = %event.sos_id(), delivered, "remote update delivered");
            }
            None => {
                counter!(BRIDGE_EVENTS_TOTAL, "direction" => "in", "outcome" => "skipped")
                    .increment(1);
            }
        }
    }
    Ok(())
}

/// `None` for own publishes and undecodable payloads.
fn decode_remote(payload: &str, origin: &str) -> Option<SosUpdateEvent> {
    match serde_json::from_str::<RelayEnvelope>(payload) {
        Ok(envelope) if envelope.origin == origin => None,
        Ok(envelope) => Some(envelope.event),
        Err(err) => {
            tracing::warn!(error = %err, "realtime bridge payload invalid");
            None
        }
    }
}
