use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, to_value};
use sos_domain::DomainResult;
use sos_domain::error::DomainError;
use sos_domain::fanout::{EmergencyContact, ResponderNotification, ResponderUnit};
use sos_domain::geo::{GeoPoint, LocationSample};
use sos_domain::ports::BoxFuture;
use sos_domain::ports::contacts::EmergencyContactDirectory;
use sos_domain::ports::responders::{ResponderDirectory, ResponderNotificationLog};
use sos_domain::ports::sos::{CasOutcome, SosRequestStore};
use sos_domain::sos::{SosRequest, SosStatus};
use sos_domain::util::{format_ms_rfc3339, parse_rfc3339_ms};
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::Client;

/// Tables backing the dispatch core. `sos_active_subject` holds one record
/// per subject with a blocking request; its record id makes the
/// single-active rule a uniqueness check, and the event releases it in the
/// same transaction as the status change.
pub const SOS_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS sos_request SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS sos_id ON sos_request TYPE string;
DEFINE FIELD IF NOT EXISTS subject_id ON sos_request TYPE string;
DEFINE FIELD IF NOT EXISTS location ON sos_request TYPE object;
DEFINE FIELD IF NOT EXISTS location.latitude ON sos_request TYPE float;
DEFINE FIELD IF NOT EXISTS location.longitude ON sos_request TYPE float;
DEFINE FIELD IF NOT EXISTS location.sampled_at ON sos_request TYPE string;
DEFINE FIELD IF NOT EXISTS status ON sos_request TYPE string
    ASSERT $value IN ['initiated', 'accepted', 'en_route', 'arrived', 'completed', 'cancelled'];
DEFINE FIELD IF NOT EXISTS claimed_by ON sos_request TYPE option<string>;
DEFINE FIELD IF NOT EXISTS responder_location ON sos_request TYPE option<object>;
DEFINE FIELD IF NOT EXISTS responder_location.latitude ON sos_request TYPE float;
DEFINE FIELD IF NOT EXISTS responder_location.longitude ON sos_request TYPE float;
DEFINE FIELD IF NOT EXISTS estimated_arrival ON sos_request TYPE option<string>;
DEFINE FIELD IF NOT EXISTS notes ON sos_request TYPE string;
DEFINE FIELD IF NOT EXISTS created_at ON sos_request TYPE string;
DEFINE FIELD IF NOT EXISTS updated_at ON sos_request TYPE string;
DEFINE FIELD IF NOT EXISTS version ON sos_request TYPE int;
DEFINE INDEX IF NOT EXISTS idx_sos_request_id ON sos_request FIELDS sos_id UNIQUE;
DEFINE INDEX IF NOT EXISTS idx_sos_request_subject ON sos_request FIELDS subject_id, created_at;
DEFINE INDEX IF NOT EXISTS idx_sos_request_status ON sos_request FIELDS status, created_at;

DEFINE TABLE IF NOT EXISTS sos_active_subject SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS sos_id ON sos_active_subject TYPE string;

DEFINE EVENT IF NOT EXISTS release_active_subject ON TABLE sos_request
    WHEN $event = "UPDATE"
        AND $before.status IN ['initiated', 'accepted', 'en_route']
        AND $after.status NOTINSIDE ['initiated', 'accepted', 'en_route']
    THEN (DELETE type::thing('sos_active_subject', $after.subject_id));

DEFINE TABLE IF NOT EXISTS sos_responder_notification SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS sos_id ON sos_responder_notification TYPE string;
DEFINE FIELD IF NOT EXISTS responder_id ON sos_responder_notification TYPE string;
DEFINE FIELD IF NOT EXISTS created_at ON sos_responder_notification TYPE string;
DEFINE INDEX IF NOT EXISTS idx_sos_notification_request ON sos_responder_notification FIELDS sos_id;

DEFINE TABLE IF NOT EXISTS responder_unit SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS responder_id ON responder_unit TYPE string;
DEFINE FIELD IF NOT EXISTS display_name ON responder_unit TYPE string;
DEFINE FIELD IF NOT EXISTS available ON responder_unit TYPE bool;
DEFINE INDEX IF NOT EXISTS idx_responder_unit_id ON responder_unit FIELDS responder_id UNIQUE;

DEFINE TABLE IF NOT EXISTS emergency_contact SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS contact_id ON emergency_contact TYPE string;
DEFINE FIELD IF NOT EXISTS subject_id ON emergency_contact TYPE string;
DEFINE FIELD IF NOT EXISTS name ON emergency_contact TYPE string;
DEFINE FIELD IF NOT EXISTS phone ON emergency_contact TYPE string;
DEFINE FIELD IF NOT EXISTS notify_on_sos ON emergency_contact TYPE bool;
DEFINE INDEX IF NOT EXISTS idx_emergency_contact_subject ON emergency_contact FIELDS subject_id;
"#;

pub async fn apply_schema(client: &Surreal<Client>) -> anyhow::Result<()> {
    client.query(SOS_SCHEMA).await?.check()?;
    Ok(())
}

fn map_surreal_error(err: surrealdb::Error) -> DomainError {
    let message = err.to_string().to_lowercase();
    if message.contains("sos_active_subject") && message.contains("already exists") {
        return DomainError::DuplicateActiveRequest;
    }
    if message.contains("already exists")
        || message.contains("duplicate")
        || message.contains("unique")
        || message.contains("conflict")
    {
        return DomainError::Conflict;
    }
    if message.contains("assert") || message.contains("coerce") {
        return DomainError::Validation(format!("surreal rejected record: {message}"));
    }
    DomainError::Unavailable(format!("surreal query failed: {message}"))
}

fn invalid_result(err: surrealdb::Error) -> DomainError {
    DomainError::Validation(format!("invalid query result: {err}"))
}

fn parse_datetime_ms(value: &str) -> DomainResult<i64> {
    parse_rfc3339_ms(value)
        .ok_or_else(|| DomainError::Validation(format!("invalid datetime '{value}'")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SurrealLocationRow {
    latitude: f64,
    longitude: f64,
    sampled_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SurrealSosRequestRow {
    sos_id: String,
    subject_id: String,
    location: SurrealLocationRow,
    status: String,
    claimed_by: Option<String>,
    responder_location: Option<GeoPoint>,
    estimated_arrival: Option<String>,
    notes: String,
    created_at: String,
    updated_at: String,
    version: u64,
}

impl SurrealSosRequestRow {
    fn from_request(request: &SosRequest) -> Self {
        Self {
            sos_id: request.sos_id.clone(),
            subject_id: request.subject_id.clone(),
            location: SurrealLocationRow {
                latitude: request.location.latitude,
                longitude: request.location.longitude,
                sampled_at: format_ms_rfc3339(request.location.sampled_at_ms),
            },
            status: request.status.as_str().to_string(),
            claimed_by: request.claimed_by.clone(),
            responder_location: request.responder_location,
            estimated_arrival: request.estimated_arrival_ms.map(format_ms_rfc3339),
            notes: request.notes.clone(),
            created_at: format_ms_rfc3339(request.created_at_ms),
            updated_at: format_ms_rfc3339(request.updated_at_ms),
            version: request.version,
        }
    }

    fn into_request(self) -> DomainResult<SosRequest> {
        let status = SosStatus::parse(&self.status).ok_or_else(|| {
            DomainError::Validation(format!("invalid sos status '{}'", self.status))
        })?;
        Ok(SosRequest {
            sos_id: self.sos_id,
            subject_id: self.subject_id,
            location: LocationSample {
                latitude: self.location.latitude,
                longitude: self.location.longitude,
                sampled_at_ms: parse_datetime_ms(&self.location.sampled_at)?,
            },
            status,
            claimed_by: self.claimed_by,
            responder_location: self.responder_location,
            estimated_arrival_ms: self
                .estimated_arrival
                .as_deref()
                .map(parse_datetime_ms)
                .transpose()?,
            notes: self.notes,
            created_at_ms: parse_datetime_ms(&self.created_at)?,
            updated_at_ms: parse_datetime_ms(&self.updated_at)?,
            version: self.version,
        })
    }
}

fn decode_requests(rows: Vec<Value>) -> DomainResult<Vec<SosRequest>> {
    rows.into_iter()
        .map(|row| {
            serde_json::from_value::<SurrealSosRequestRow>(row)
                .map_err(|err| DomainError::Validation(format!("invalid sos_request row: {err}")))
                .and_then(SurrealSosRequestRow::into_request)
        })
        .collect()
}

fn request_payload(request: &SosRequest) -> DomainResult<Value> {
    to_value(SurrealSosRequestRow::from_request(request))
        .map_err(|err| DomainError::Validation(format!("invalid sos_request payload: {err}")))
}

#[derive(Clone)]
pub struct SurrealSosRequestStore {
    client: Arc<Surreal<Client>>,
}

impl SurrealSosRequestStore {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    async fn fetch(client: &Surreal<Client>, sos_id: &str) -> DomainResult<Option<SosRequest>> {
        let mut response = client
            .query("SELECT * FROM sos_request WHERE sos_id = $sos_id LIMIT 1")
            .bind(("sos_id", sos_id.to_string()))
            .await
            .map_err(map_surreal_error)?;
        let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
        Ok(decode_requests(rows)?.into_iter().next())
    }
}

impl SosRequestStore for SurrealSosRequestStore {
    fn create_if_no_active(&self, request: &SosRequest) -> BoxFuture<'_, DomainResult<SosRequest>> {
        let client = self.client.clone();
        let request = request.clone();
        Box::pin(async move {
            let payload = request_payload(&request)?;
            let response = client
                .query(
                    "BEGIN TRANSACTION; \
                     CREATE type::thing('sos_active_subject', $subject_id) \
                        CONTENT { sos_id: $sos_id } RETURN NONE; \
                     CREATE type::thing('sos_request', $sos_id) CONTENT $payload RETURN NONE; \
                     COMMIT TRANSACTION;",
                )
                .bind(("subject_id", request.subject_id.clone()))
                .bind(("sos_id", request.sos_id.clone()))
                .bind(("payload", payload))
                .await
                .map_err(map_surreal_error)?;
            response.check().map_err(map_surreal_error)?;
            Ok(request)
        })
    }

    fn get(&self, sos_id: &str) -> BoxFuture<'_, DomainResult<Option<SosRequest>>> {
        let client = self.client.clone();
        let sos_id = sos_id.to_string();
        Box::pin(async move { Self::fetch(&client, &sos_id).await })
    }

    fn compare_and_swap(
        &self,
        expected_version: u64,
        next: &SosRequest,
    ) -> BoxFuture<'_, DomainResult<CasOutcome>> {
        let client = self.client.clone();
        let next = next.clone();
        Box::pin(async move {
            let payload = request_payload(&next)?;
            let mut response = client
                .query(
                    "UPDATE type::thing('sos_request', $sos_id) MERGE $payload \
                     WHERE version = $expected_version \
                     RETURN AFTER",
                )
                .bind(("sos_id", next.sos_id.clone()))
                .bind(("payload", payload))
                .bind(("expected_version", expected_version))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
            if let Some(applied) = decode_requests(rows)?.into_iter().next() {
                return Ok(CasOutcome::Applied(applied));
            }
            Ok(CasOutcome::Stale(Self::fetch(&client, &next.sos_id).await?))
        })
    }

    fn list_by_subject(&self, subject_id: &str) -> BoxFuture<'_, DomainResult<Vec<SosRequest>>> {
        let client = self.client.clone();
        let subject_id = subject_id.to_string();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT * FROM sos_request WHERE subject_id = $subject_id \
                     ORDER BY created_at DESC, sos_id DESC",
                )
                .bind(("subject_id", subject_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
            decode_requests(rows)
        })
    }

    fn list_by_status(
        &self,
        status: SosStatus,
        created_after_ms: i64,
        created_before_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, DomainResult<Vec<SosRequest>>> {
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT * FROM sos_request \
                     WHERE status = $status \
                     AND created_at > $created_after AND created_at <= $created_before \
                     ORDER BY created_at ASC, sos_id ASC \
                     LIMIT $limit",
                )
                .bind(("status", status.as_str().to_string()))
                .bind(("created_after", format_ms_rfc3339(created_after_ms)))
                .bind(("created_before", format_ms_rfc3339(created_before_ms)))
                .bind(("limit", limit as i64))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
            decode_requests(rows)
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SurrealResponderRow {
    responder_id: String,
    display_name: String,
}

#[derive(Clone)]
pub struct SurrealResponderDirectory {
    client: Arc<Surreal<Client>>,
}

impl SurrealResponderDirectory {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }
}

impl ResponderDirectory for SurrealResponderDirectory {
    fn list_available(&self) -> BoxFuture<'_, DomainResult<Vec<ResponderUnit>>> {
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query("SELECT * FROM responder_unit WHERE available = true ORDER BY responder_id")
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
            rows.into_iter()
                .map(|row| {
                    let row: SurrealResponderRow = serde_json::from_value(row).map_err(|err| {
                        DomainError::Validation(format!("invalid responder_unit row: {err}"))
                    })?;
                    Ok(ResponderUnit {
                        responder_id: row.responder_id,
                        display_name: row.display_name,
                    })
                })
                .collect()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SurrealNotificationRow {
    sos_id: String,
    responder_id: String,
    created_at: String,
}

#[derive(Clone)]
pub struct SurrealResponderNotificationLog {
    client: Arc<Surreal<Client>>,
}

impl SurrealResponderNotificationLog {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }
}

impl ResponderNotificationLog for SurrealResponderNotificationLog {
    /// The record id is `[sos_id, responder_id]`, so a repeat insert fails
    /// and is skipped.
    fn record_new(
        &self,
        notifications: &[ResponderNotification],
    ) -> BoxFuture<'_, DomainResult<Vec<ResponderNotification>>> {
        let client = self.client.clone();
        let notifications = notifications.to_vec();
        Box::pin(async move {
            let mut fresh = Vec::with_capacity(notifications.len());
            for notification in notifications {
                let payload = to_value(SurrealNotificationRow {
                    sos_id: notification.sos_id.clone(),
                    responder_id: notification.responder_id.clone(),
                    created_at: format_ms_rfc3339(notification.created_at_ms),
                })
                .map_err(|err| {
                    DomainError::Validation(format!("invalid notification payload: {err}"))
                })?;
                let outcome = client
                    .query(
                        "CREATE type::thing('sos_responder_notification', [$sos_id, $responder_id]) \
                         CONTENT $payload RETURN NONE",
                    )
                    .bind(("sos_id", notification.sos_id.clone()))
                    .bind(("responder_id", notification.responder_id.clone()))
                    .bind(("payload", payload))
                    .await
                    .and_then(|response| response.check());
                match outcome.map_err(map_surreal_error) {
                    Ok(_) => fresh.push(notification),
                    Err(DomainError::Conflict) => {}
                    Err(err) => return Err(err),
                }
            }
            Ok(fresh)
        })
    }

    fn list_by_request(
        &self,
        sos_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<ResponderNotification>>> {
        let client = self.client.clone();
        let sos_id = sos_id.to_string();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT * FROM sos_responder_notification WHERE sos_id = $sos_id \
                     ORDER BY created_at ASC, responder_id ASC",
                )
                .bind(("sos_id", sos_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
            rows.into_iter()
                .map(|row| {
                    let row: SurrealNotificationRow = serde_json::from_value(row).map_err(|err| {
                        DomainError::Validation(format!("invalid notification row: {err}"))
                    })?;
                    Ok(ResponderNotification {
                        sos_id: row.sos_id,
                        responder_id: row.responder_id,
                        created_at_ms: parse_datetime_ms(&row.created_at)?,
                    })
                })
                .collect()
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SurrealContactRow {
    contact_id: String,
    subject_id: String,
    name: String,
    phone: String,
    notify_on_sos: bool,
}

#[derive(Clone)]
pub struct SurrealEmergencyContactDirectory {
    client: Arc<Surreal<Client>>,
}

impl SurrealEmergencyContactDirectory {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }
}

impl EmergencyContactDirectory for SurrealEmergencyContactDirectory {
    fn list_for_subject(
        &self,
        subject_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<EmergencyContact>>> {
        let client = self.client.clone();
        let subject_id = subject_id.to_string();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT * FROM emergency_contact WHERE subject_id = $subject_id \
                     ORDER BY contact_id",
                )
                .bind(("subject_id", subject_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(invalid_result)?;
            rows.into_iter()
                .map(|row| {
                    let row: SurrealContactRow = serde_json::from_value(row).map_err(|err| {
                        DomainError::Validation(format!("invalid emergency_contact row: {err}"))
                    })?;
                    Ok(EmergencyContact {
                        contact_id: row.contact_id,
                        subject_id: row.subject_id,
                        name: row.name,
                        phone: row.phone,
                        notify_on_sos: row.notify_on_sos,
                    })
                })
                .collect()
        })
    }
}
