use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::dispatch::SosService;
use crate::fanout::{DispatchSummary, FanoutNotifier};
use crate::sos::{SosRequest, SosStatus};

pub const DEFAULT_ESCALATION_INTERVAL_MS: i64 = 60_000;
pub const DEFAULT_ESCALATION_MAX_ROUNDS: u32 = 10;
pub const DEFAULT_SWEEP_BATCH: usize = 200;

/// What to do with a request still waiting for a claim. Requests are never
/// expired automatically; only the subject cancels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EscalationDecision {
    NotDue,
    Rebroadcast { round: u32 },
    /// Past the rebroadcast window; needs a human.
    Exhausted,
}

#[derive(Clone, Debug)]
pub struct EscalationPolicy {
    pub interval_ms: i64,
    pub max_rounds: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_ESCALATION_INTERVAL_MS,
            max_rounds: DEFAULT_ESCALATION_MAX_ROUNDS,
        }
    }
}

impl EscalationPolicy {
    /// Age at which a waiting request stops being rebroadcast.
    pub fn window_ms(&self) -> i64 {
        self.interval_ms
            .max(0)
            .saturating_mul(i64::from(self.max_rounds))
    }

    pub fn decide(&self, request: &SosRequest, now_ms: i64) -> EscalationDecision {
        if request.status != SosStatus::Initiated || self.interval_ms <= 0 {
            return EscalationDecision::NotDue;
        }
        let age_ms = now_ms.saturating_sub(request.created_at_ms);
        if age_ms < self.interval_ms {
            return EscalationDecision::NotDue;
        }
        let round = u32::try_from(age_ms / self.interval_ms).unwrap_or(u32::MAX);
        if round >= self.max_rounds {
            EscalationDecision::Exhausted
        } else {
            EscalationDecision::Rebroadcast { round }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub rebroadcast: usize,
    pub newly_notified: usize,
    pub exhausted: usize,
}

/// Periodic pass over waiting requests that widens the responder fan-out to
/// units that became available after creation.
#[derive(Clone)]
pub struct EscalationSweeper {
    service: SosService,
    notifier: FanoutNotifier,
    policy: EscalationPolicy,
    batch_size: usize,
}

impl EscalationSweeper {
    pub fn new(
        service: SosService,
        notifier: FanoutNotifier,
        policy: EscalationPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            service,
            notifier,
            policy,
            batch_size: batch_size.max(1),
        }
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    /// Requests still inside the rebroadcast window are paged separately from
    /// exhausted ones, so a backlog of old requests cannot starve newer ones.
    pub async fn sweep(&self, now_ms: i64) -> DomainResult<SweepReport> {
        let due_before = now_ms.saturating_sub(self.policy.interval_ms);
        let window_start = now_ms.saturating_sub(self.policy.window_ms());
        let mut waiting = self
            .service
            .list_waiting(window_start, due_before, self.batch_size)
            .await?;
        let overdue = self
            .service
            .list_waiting(i64::MIN, window_start.min(due_before), self.batch_size)
            .await?;
        waiting.extend(overdue);
        let mut report = SweepReport {
            scanned: waiting.len(),
            ..SweepReport::default()
        };

        for request in waiting {
            match self.policy.decide(&request, now_ms) {
                EscalationDecision::NotDue => {}
                EscalationDecision::Rebroadcast { round } => {
                    let fanout = self
                        .notifier
                        .notify_responders(&request.sos_id, &request.location, now_ms)
                        .await;
                    report.rebroadcast += 1;
                    report.newly_notified += fanout.notified;
                    if fanout.notified > 0 {
                        let summary = DispatchSummary {
                            responders_notified: fanout.notified,
                            round,
                            ..DispatchSummary::default()
                        };
                        self.service.publish_dispatch(&request, summary).await;
                    }
                }
                EscalationDecision::Exhausted => {
                    report.exhausted += 1;
                    tracing::warn!(
                        sos_id = %request.sos_id,
                        subject_id = %request.subject_id,
                        age_ms = now_ms - request.created_at_ms,
                        "sos request still unclaimed after escalation window"
                    );
                }
            }
        }
        Ok(report)
    }
}
