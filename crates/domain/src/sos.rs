use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::geo::{GeoPoint, LocationSample};

pub const MAX_NOTES_LEN: usize = 1_000;
const MAX_ID_LEN: usize = 128;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SosStatus {
    Initiated,
    Accepted,
    EnRoute,
    Arrived,
    Completed,
    Cancelled,
}

impl SosStatus {
    pub const ALL: [SosStatus; 6] = [
        SosStatus::Initiated,
        SosStatus::Accepted,
        SosStatus::EnRoute,
        SosStatus::Arrived,
        SosStatus::Completed,
        SosStatus::Cancelled,
    ];

    /// Statuses that count against the one-active-request-per-subject rule.
    pub const BLOCKING: [SosStatus; 3] = [
        SosStatus::Initiated,
        SosStatus::Accepted,
        SosStatus::EnRoute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Accepted => "accepted",
            Self::EnRoute => "en_route",
            Self::Arrived => "arrived",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        value.parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn blocks_new_request(&self) -> bool {
        Self::BLOCKING.contains(self)
    }

    pub fn is_claimed(&self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::EnRoute | Self::Arrived | Self::Completed
        )
    }

    pub fn accepts_responder_location(&self) -> bool {
        matches!(self, Self::Accepted | Self::EnRoute | Self::Arrived)
    }

    /// Next status in the responder chain. `Initiated` and `Cancelled` have
    /// none because they are left only through claim or never.
    pub fn responder_successor(&self) -> Option<Self> {
        match self {
            Self::Accepted => Some(Self::EnRoute),
            Self::EnRoute => Some(Self::Arrived),
            Self::Arrived => Some(Self::Completed),
            Self::Initiated | Self::Completed | Self::Cancelled => None,
        }
    }
}

impl fmt::Display for SosStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SosStatus {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "initiated" => Ok(Self::Initiated),
            "accepted" => Ok(Self::Accepted),
            "en_route" => Ok(Self::EnRoute),
            "arrived" => Ok(Self::Arrived),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err("unknown sos status"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SosRequest {
    pub sos_id: String,
    pub subject_id: String,
    pub location: LocationSample,
    pub status: SosStatus,
    pub claimed_by: Option<String>,
    pub responder_location: Option<GeoPoint>,
    pub estimated_arrival_ms: Option<i64>,
    pub notes: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub version: u64,
}

impl SosRequest {
    pub fn new_initiated(
        sos_id: impl Into<String>,
        subject_id: impl Into<String>,
        location: LocationSample,
        notes: impl Into<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            sos_id: sos_id.into(),
            subject_id: subject_id.into(),
            location,
            status: SosStatus::Initiated,
            claimed_by: None,
            responder_location: None,
            estimated_arrival_ms: None,
            notes: notes.into(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            version: 1,
        }
    }

    pub fn is_owned_by(&self, subject_id: &str) -> bool {
        self.subject_id == subject_id
    }

    pub fn is_claimed_by(&self, responder_id: &str) -> bool {
        self.claimed_by.as_deref() == Some(responder_id)
    }

    /// Subject and claimant are the only parties allowed to read or follow
    /// a request.
    pub fn is_participant(&self, actor_id: &str) -> bool {
        self.is_owned_by(actor_id) || self.is_claimed_by(actor_id)
    }

    fn next_revision(&self, now_ms: i64) -> Self {
        let mut next = self.clone();
        next.version = self.version.saturating_add(1);
        next.updated_at_ms = now_ms.max(self.updated_at_ms);
        next
    }
}

#[derive(Clone, Debug)]
pub struct CreateSosRequest {
    pub location: LocationSample,
    pub notes: String,
    pub correlation_id: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponderUpdate {
    pub location: Option<GeoPoint>,
    pub estimated_arrival_ms: Option<i64>,
}

impl ResponderUpdate {
    pub fn is_empty(&self) -> bool {
        self.location.is_none() && self.estimated_arrival_ms.is_none()
    }
}

pub fn validate_notes(notes: &str) -> DomainResult<String> {
    let notes = notes.trim().to_string();
    if notes.chars().count() > MAX_NOTES_LEN {
        return Err(DomainError::Validation("notes are too long".into()));
    }
    Ok(notes)
}

pub fn validate_actor_id(field: &str, value: &str) -> DomainResult<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::Validation(format!("{field} is required")));
    }
    if trimmed.len() > MAX_ID_LEN {
        return Err(DomainError::Validation(format!("{field} is too long")));
    }
    Ok(())
}

/// Claim a request still waiting for a responder. The returned record is
/// only a proposal; it takes effect when the store accepts it against
/// `current.version`.
pub fn plan_accept(current: &SosRequest, responder_id: &str, now_ms: i64) -> DomainResult<SosRequest> {
    validate_actor_id("responder_id", responder_id)?;
    match current.status {
        SosStatus::Initiated => {}
        SosStatus::Cancelled => return Err(DomainError::InvalidState(SosStatus::Cancelled)),
        _ => return Err(DomainError::AlreadyClaimed),
    }

    let mut next = current.next_revision(now_ms);
    next.status = SosStatus::Accepted;
    next.claimed_by = Some(responder_id.to_string());
    Ok(next)
}

pub fn plan_advance(
    current: &SosRequest,
    responder_id: &str,
    next_status: SosStatus,
    update: &ResponderUpdate,
    now_ms: i64,
) -> DomainResult<SosRequest> {
    if !current.is_claimed_by(responder_id) {
        return Err(DomainError::NotAuthorized(
            "only the claiming responder can advance this request".into(),
        ));
    }
    if current.status.responder_successor() != Some(next_status) {
        return Err(DomainError::InvalidTransition {
            from: current.status,
            to: next_status,
        });
    }
    if next_status.is_terminal() && update.location.is_some() {
        return Err(DomainError::Validation(
            "responder location cannot accompany a terminal status".into(),
        ));
    }

    let mut next = current.next_revision(now_ms);
    next.status = next_status;
    apply_responder_update(&mut next, update)?;
    Ok(next)
}

pub fn plan_location_update(
    current: &SosRequest,
    responder_id: &str,
    update: &ResponderUpdate,
    now_ms: i64,
) -> DomainResult<SosRequest> {
    if !current.is_claimed_by(responder_id) {
        return Err(DomainError::NotAuthorized(
            "only the claiming responder can report location".into(),
        ));
    }
    if !current.status.accepts_responder_location() {
        return Err(DomainError::InvalidState(current.status));
    }
    if update.is_empty() {
        return Err(DomainError::Validation(
            "location or estimated arrival is required".into(),
        ));
    }

    let mut next = current.next_revision(now_ms);
    apply_responder_update(&mut next, update)?;
    Ok(next)
}

pub fn plan_cancel(current: &SosRequest, subject_id: &str, now_ms: i64) -> DomainResult<SosRequest> {
    if !current.is_owned_by(subject_id) {
        return Err(DomainError::NotAuthorized(
            "only the requesting subject can cancel".into(),
        ));
    }
    match current.status {
        SosStatus::Initiated => {}
        SosStatus::Cancelled => return Err(DomainError::InvalidState(SosStatus::Cancelled)),
        _ => return Err(DomainError::AlreadyClaimed),
    }

    let mut next = current.next_revision(now_ms);
    next.status = SosStatus::Cancelled;
    Ok(next)
}

fn apply_responder_update(next: &mut SosRequest, update: &ResponderUpdate) -> DomainResult<()> {
    if let Some(point) = update.location {
        point.validate()?;
        next.responder_location = Some(point);
    }
    if let Some(eta_ms) = update.estimated_arrival_ms {
        if eta_ms < next.created_at_ms {
            return Err(DomainError::Validation(
                "estimated arrival cannot precede the request".into(),
            ));
        }
        next.estimated_arrival_ms = Some(eta_ms);
    }
    Ok(())
}
