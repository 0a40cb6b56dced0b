use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use sos_domain::fanout::ContactAlert;
use sos_domain::ports::BoxFuture;
use sos_domain::ports::contacts::{ContactAlertSender, DeliveryError};
use tokio::time::sleep;
use url::Url;

use crate::config::AppConfig;

const GATEWAY_TOKEN_HEADER: &str = "X-Gateway-Token";
const DELIVERY_ATTEMPTS: usize = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Serialize)]
struct GatewayPayload<'a> {
    to: &'a str,
    message: &'a str,
    sos_id: &'a str,
    subject_id: &'a str,
    location_reference: &'a str,
}

/// Posts alerts to an SMS/push gateway. Throttling and 5xx are retried once;
/// any other refusal is final.
#[derive(Clone)]
pub struct HttpContactAlertSender {
    http: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
}

impl HttpContactAlertSender {
    pub fn new(endpoint: Url, token: Option<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            endpoint,
            token: token.filter(|token| !token.trim().is_empty()),
        }
    }

    /// `None` when no gateway is configured or the URL does not parse.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let raw = config.alert_gateway_url.trim();
        if raw.is_empty() {
            return None;
        }
        let endpoint = match Url::parse(raw) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                tracing::error!(url = raw, error = %err, "alert_gateway_url is not a valid URL");
                return None;
            }
        };
        Some(Self::new(
            endpoint,
            Some(config.alert_gateway_token.clone()),
            config.alert_timeout(),
        ))
    }

    async fn deliver(&self, alert: &ContactAlert) -> Result<(), DeliveryError> {
        let payload = GatewayPayload {
            to: &alert.phone,
            message: &alert.message,
            sos_id: &alert.sos_id,
            subject_id: &alert.subject_id,
            location_reference: &alert.location_reference,
        };

        let mut last_error = DeliveryError::Unavailable("no delivery attempted".into());
        for attempt in 0..DELIVERY_ATTEMPTS {
            if attempt > 0 {
                sleep(RETRY_BACKOFF).await;
            }
            let mut request = self.http.post(self.endpoint.clone()).json(&payload);
            if let Some(token) = &self.token {
                request = request.header(GATEWAY_TOKEN_HEADER, token);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) if err.is_timeout() => {
                    last_error = DeliveryError::Timeout;
                    continue;
                }
                Err(err) => {
                    last_error = DeliveryError::Unavailable(err.to_string());
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                last_error = DeliveryError::Unavailable(format!("status {}: {body}", status.as_u16()));
                continue;
            }
            return Err(DeliveryError::Rejected(format!(
                "status {}: {body}",
                status.as_u16()
            )));
        }
        Err(last_error)
    }
}

impl ContactAlertSender for HttpContactAlertSender {
    fn send(&self, alert: &ContactAlert) -> BoxFuture<'_, Result<(), DeliveryError>> {
        let alert = alert.clone();
        Box::pin(async move { self.deliver(&alert).await })
    }
}

/// Development sender: records the alert in the log and reports success.
#[derive(Clone, Debug, Default)]
pub struct LoggingContactAlertSender;

impl ContactAlertSender for LoggingContactAlertSender {
    fn send(&self, alert: &ContactAlert) -> BoxFuture<'_, Result<(), DeliveryError>> {
        let alert = alert.clone();
        Box::pin(async move {
            tracing::info!(
                sos_id = %alert.sos_id,
                contact_id = %alert.contact_id,
                location = %alert.location_reference,
                "contact alert (no gateway configured)"
            );
            Ok(())
        })
    }
}
