use std::sync::Arc;

use crate::DomainResult;
use crate::auth::Role;
use crate::error::DomainError;
use crate::fanout::DispatchSummary;
use crate::geo::{LocationPolicy, sample_location};
use crate::identity::ActorIdentity;
use crate::ports::geolocation::GeolocationSource;
use crate::ports::sos::{CasOutcome, SosRequestStore};
use crate::realtime::{SosSubscription, SosUpdateEvent, SosUpdateHub};
use crate::sos::{
    CreateSosRequest, ResponderUpdate, SosRequest, SosStatus, plan_accept, plan_advance,
    plan_cancel, plan_location_update, validate_actor_id, validate_notes,
};

/// Conditional writes re-read and re-plan at most this many times before
/// giving up with `Conflict`.
pub const MAX_CAS_ATTEMPTS: usize = 3;

pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Owns every mutation of an SOS request. Each write is planned against the
/// record as read and committed with a version-guarded swap; a lost race is
/// re-planned against the fresh record, never replayed blindly.
#[derive(Clone)]
pub struct SosService {
    store: Arc<dyn SosRequestStore>,
    hub: SosUpdateHub,
    location_policy: LocationPolicy,
    clock: Clock,
}

impl SosService {
    pub fn new(
        store: Arc<dyn SosRequestStore>,
        hub: SosUpdateHub,
        location_policy: LocationPolicy,
    ) -> Self {
        Self {
            store,
            hub,
            location_policy,
            clock: Arc::new(crate::util::now_ms),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn hub(&self) -> &SosUpdateHub {
        &self.hub
    }

    pub fn now_ms(&self) -> i64 {
        (self.clock)()
    }

    pub async fn create_request(
        &self,
        actor: &ActorIdentity,
        input: CreateSosRequest,
    ) -> DomainResult<SosRequest> {
        validate_actor_id("subject_id", &actor.user_id)?;
        let notes = validate_notes(&input.notes)?;
        let now_ms = self.now_ms();
        let location = self.location_policy.check(&input.location, now_ms)?;

        let request = SosRequest::new_initiated(
            crate::util::uuid_v7_without_dashes(),
            actor.user_id.clone(),
            location,
            notes,
            now_ms,
        );
        let created = match self.store.create_if_no_active(&request).await {
            Ok(created) => created,
            Err(err) => {
                tracing::warn!(
                    subject_id = %actor.user_id,
                    correlation_id = %input.correlation_id,
                    error = %err,
                    "sos request rejected"
                );
                return Err(err);
            }
        };
        tracing::info!(
            sos_id = %created.sos_id,
            subject_id = %created.subject_id,
            correlation_id = %input.correlation_id,
            version = created.version,
            "sos request created"
        );
        self.hub
            .publish(SosUpdateEvent::Snapshot {
                request: created.clone(),
            })
            .await;
        Ok(created)
    }

    /// Samples the device first; a failed fix blocks creation.
    pub async fn trigger(
        &self,
        actor: &ActorIdentity,
        source: &dyn GeolocationSource,
        notes: String,
        correlation_id: String,
    ) -> DomainResult<SosRequest> {
        let location = sample_location(source, &self.location_policy, self.now_ms()).await?;
        self.create_request(
            actor,
            CreateSosRequest {
                location,
                notes,
                correlation_id,
            },
        )
        .await
    }

    pub async fn accept(
        &self,
        actor: &ActorIdentity,
        role: &Role,
        sos_id: &str,
    ) -> DomainResult<SosRequest> {
        ensure_responder(role)?;
        self.apply_conditional(sos_id, "accept", |current, now_ms| {
            plan_accept(current, &actor.user_id, now_ms)
        })
        .await
    }

    pub async fn advance(
        &self,
        actor: &ActorIdentity,
        role: &Role,
        sos_id: &str,
        next_status: SosStatus,
        update: ResponderUpdate,
    ) -> DomainResult<SosRequest> {
        ensure_responder(role)?;
        self.apply_conditional(sos_id, "advance", |current, now_ms| {
            plan_advance(current, &actor.user_id, next_status, &update, now_ms)
        })
        .await
    }

    pub async fn update_location(
        &self,
        actor: &ActorIdentity,
        role: &Role,
        sos_id: &str,
        update: ResponderUpdate,
    ) -> DomainResult<SosRequest> {
        ensure_responder(role)?;
        self.apply_conditional(sos_id, "update_location", |current, now_ms| {
            plan_location_update(current, &actor.user_id, &update, now_ms)
        })
        .await
    }

    pub async fn cancel(&self, actor: &ActorIdentity, sos_id: &str) -> DomainResult<SosRequest> {
        self.apply_conditional(sos_id, "cancel", |current, now_ms| {
            plan_cancel(current, &actor.user_id, now_ms)
        })
        .await
    }

    /// Readable by the subject and the claimant; responders may also read a
    /// request that is still waiting for a claim.
    pub async fn get(
        &self,
        actor: &ActorIdentity,
        role: &Role,
        sos_id: &str,
    ) -> DomainResult<SosRequest> {
        let request = self.load(sos_id).await?;
        ensure_can_view(&request, actor, role)?;
        Ok(request)
    }

    pub async fn current_for_subject(&self, subject_id: &str) -> DomainResult<Option<SosRequest>> {
        let requests = self.store.list_by_subject(subject_id).await?;
        Ok(requests
            .into_iter()
            .find(|request| !request.status.is_terminal()))
    }

    /// The lease is taken before the record is read so no write committed
    /// after the read can be missed.
    pub async fn subscribe(
        &self,
        actor: &ActorIdentity,
        role: &Role,
        sos_id: &str,
    ) -> DomainResult<SosSubscription> {
        let lease = self.hub.subscribe(sos_id);
        let current = self.load(sos_id).await?;
        ensure_can_view(&current, actor, role)?;
        tracing::debug!(sos_id, subscriber = %actor.user_id, version = current.version, "subscribed");
        let bystander = !current.is_participant(&actor.user_id) && *role != Role::System;
        let subscription = SosSubscription::new(lease, current);
        Ok(if bystander {
            subscription.until_claimed_by_other(actor.user_id.clone())
        } else {
            subscription
        })
    }

    /// Unclaimed requests created in `(created_after_ms, created_before_ms]`,
    /// oldest first.
    pub async fn list_waiting(
        &self,
        created_after_ms: i64,
        created_before_ms: i64,
        limit: usize,
    ) -> DomainResult<Vec<SosRequest>> {
        self.store
            .list_by_status(
                SosStatus::Initiated,
                created_after_ms,
                created_before_ms,
                limit,
            )
            .await
    }

    pub async fn publish_dispatch(&self, request: &SosRequest, summary: DispatchSummary) {
        self.hub
            .publish(SosUpdateEvent::Dispatch {
                sos_id: request.sos_id.clone(),
                version: request.version,
                summary,
            })
            .await;
    }

    async fn load(&self, sos_id: &str) -> DomainResult<SosRequest> {
        self.store.get(sos_id).await?.ok_or(DomainError::NotFound)
    }

    async fn apply_conditional<F>(
        &self,
        sos_id: &str,
        operation: &'static str,
        plan: F,
    ) -> DomainResult<SosRequest>
    where
        F: Fn(&SosRequest, i64) -> DomainResult<SosRequest>,
    {
        let mut current = self.load(sos_id).await?;
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let next = plan(&current, self.now_ms()).inspect_err(|err| {
                tracing::info!(
                    sos_id,
                    operation,
                    status = %current.status,
                    version = current.version,
                    error = %err,
                    "sos write refused"
                );
            })?;
            // A backend-level write conflict is the same lost race as a
            // version mismatch; re-read and re-plan against the winner.
            let outcome = match self.store.compare_and_swap(current.version, &next).await {
                Ok(outcome) => outcome,
                Err(DomainError::Conflict) => CasOutcome::Stale(self.store.get(sos_id).await?),
                Err(err) => return Err(err),
            };
            match outcome {
                CasOutcome::Applied(stored) => {
                    tracing::info!(
                        sos_id,
                        operation,
                        status = %stored.status,
                        version = stored.version,
                        claimed_by = stored.claimed_by.as_deref().unwrap_or(""),
                        "sos request updated"
                    );
                    self.hub
                        .publish(SosUpdateEvent::Snapshot {
                            request: stored.clone(),
                        })
                        .await;
                    return Ok(stored);
                }
                CasOutcome::Stale(Some(fresh)) => {
                    tracing::debug!(
                        sos_id,
                        operation,
                        attempt,
                        expected = current.version,
                        found = fresh.version,
                        "conditional write lost race"
                    );
                    current = fresh;
                }
                CasOutcome::Stale(None) => return Err(DomainError::NotFound),
            }
        }
        tracing::warn!(sos_id, operation, "conditional write kept losing races");
        Err(DomainError::Conflict)
    }
}

fn ensure_responder(role: &Role) -> DomainResult<()> {
    if role.can_respond() {
        Ok(())
    } else {
        Err(DomainError::NotAuthorized(
            "responder role required".into(),
        ))
    }
}

fn ensure_can_view(request: &SosRequest, actor: &ActorIdentity, role: &Role) -> DomainResult<()> {
    let waiting_for_responder = role.can_respond() && request.status == SosStatus::Initiated;
    if request.is_participant(&actor.user_id) || waiting_for_responder || *role == Role::System {
        Ok(())
    } else {
        Err(DomainError::NotAuthorized(
            "not a participant of this request".into(),
        ))
    }
}
