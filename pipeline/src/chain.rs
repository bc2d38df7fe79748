//! Fallback chain
//!
//! Walks the tiers in priority order for one request, as an explicit state
//! machine:
//!
//! ```text
//! Pending ─▶ TryingTier(i) ─┬─▶ Succeeded(level)      all sentences accepted
//!                           ├─▶ Advancing(i+1)        breaker open, failure,
//!                           │     │                   or sentences still pending
//!                           │     ├─▶ TryingTier(i+1)
//!                           │     └─▶ Failed          past the last tier
//!                           └─▶ Failed                deadline or cancellation
//! ```
//!
//! Each tier only sees the sentences earlier tiers did not accept, so a
//! response can mix levels; its overall level is the lowest one. Every state
//! visited is kept in a [`ChainTrace`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

use crate::analyzer::{ParsedSentence, QualityMetrics};
use crate::breaker::{FailureKind, Outcome};
use crate::budget::{BudgetTracker, TimeoutBudgetAllocator};
use crate::config::PipelineConfig;
use crate::gate::{combine_levels, GateDecision, QualityGate, RejectReason};
use crate::otel;
use crate::telemetry::{SharedMetrics, GATE_REJECTED, TIER_SKIPPED};
use crate::tier::{AnalyzerTier, AttemptOutcome, CallFailure, QualityLevel, TierAttempt, TierId};

/// Why a chain ended without an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    DeadlineExceeded,
    /// Every tier was tried or skipped and some sentence never passed a gate.
    QualityFloor,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum ChainState {
    Pending,
    TryingTier(TierId),
    /// Move on to the tier at this index; one past the last means exhausted.
    Advancing(usize),
    Succeeded(QualityLevel),
    Failed(FailureCause),
}

impl ChainState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_))
    }
}

/// Every state a chain run passed through, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChainTrace {
    states: Vec<ChainState>,
}

impl ChainTrace {
    fn push(&mut self, state: ChainState) {
        self.states.push(state);
    }

    pub fn states(&self) -> &[ChainState] {
        &self.states
    }

    pub fn last(&self) -> Option<ChainState> {
        self.states.last().copied()
    }

    /// Tiers entered, whether or not they were invoked.
    pub fn tiers_tried(&self) -> Vec<TierId> {
        self.states
            .iter()
            .filter_map(|s| match s {
                ChainState::TryingTier(t) => Some(*t),
                _ => None,
            })
            .collect()
    }
}

/// A sentence that passed some tier's gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptedSentence {
    pub sentence: ParsedSentence,
    pub level: QualityLevel,
    pub tier: TierId,
}

/// Everything the chain needs for one request.
#[derive(Debug, Clone)]
pub struct ChainInput {
    pub request_id: Uuid,
    pub sentences: Vec<String>,
    /// Snapshot the whole run uses, even if a reload happens meanwhile.
    pub config: Arc<PipelineConfig>,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub verdict: Result<QualityLevel, FailureCause>,
    pub trace: ChainTrace,
    pub attempts: Vec<TierAttempt>,
    /// One slot per input sentence; `None` where no tier was accepted.
    pub sentences: Vec<Option<AcceptedSentence>>,
    /// Latest gate rejection for each sentence still unaccepted.
    pub reasons: Vec<RejectReason>,
    pub elapsed: Duration,
}

/// Mutable state of one run.
struct Run {
    request_id: Uuid,
    texts: Vec<String>,
    gate: QualityGate,
    budget: BudgetTracker,
    cancel: CancellationToken,
    accepted: Vec<Option<AcceptedSentence>>,
    last_reason: Vec<Option<RejectReason>>,
    attempts: Vec<TierAttempt>,
}

impl Run {
    fn pending(&self) -> Vec<usize> {
        (0..self.texts.len())
            .filter(|&i| self.accepted[i].is_none())
            .collect()
    }
}

/// The ordered tiers, shared by all requests.
pub struct FallbackChain {
    tiers: [Arc<AnalyzerTier>; 3],
    metrics: SharedMetrics,
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain")
            .field("tiers", &self.tiers)
            .finish()
    }
}

impl FallbackChain {
    pub fn new(tiers: [Arc<AnalyzerTier>; 3], metrics: SharedMetrics) -> Self {
        Self { tiers, metrics }
    }

    pub fn tier(&self, id: TierId) -> &Arc<AnalyzerTier> {
        &self.tiers[id.index()]
    }

    pub fn tiers(&self) -> &[Arc<AnalyzerTier>] {
        &self.tiers
    }

    /// Push reloaded tier settings into each tier and breaker.
    pub fn reconfigure(&self, config: &PipelineConfig) {
        for tier in &self.tiers {
            tier.reconfigure(config.tiers.get(tier.id()));
        }
    }

    pub async fn run(&self, input: ChainInput) -> ChainOutcome {
        let started = Instant::now();
        let n = input.sentences.len();
        let mut run = Run {
            request_id: input.request_id,
            gate: QualityGate::from_config(&input.config.tiers),
            budget: BudgetTracker::new(
                TimeoutBudgetAllocator::from_config(&input.config.budget),
                input.deadline,
            ),
            texts: input.sentences,
            cancel: input.cancel,
            accepted: vec![None; n],
            last_reason: vec![None; n],
            attempts: Vec::with_capacity(TierId::ALL.len()),
        };

        let mut trace = ChainTrace::default();
        let mut state = ChainState::Pending;
        let verdict = loop {
            trace.push(state);
            state = match state {
                ChainState::Pending => {
                    if run.cancel.is_cancelled() {
                        ChainState::Failed(FailureCause::Cancelled)
                    } else if n == 0 {
                        ChainState::Failed(FailureCause::QualityFloor)
                    } else {
                        ChainState::TryingTier(TierId::Primary)
                    }
                }
                ChainState::TryingTier(tier) => self.try_tier(tier, &mut run).await,
                ChainState::Advancing(index) => match TierId::from_index(index) {
                    Some(tier) => ChainState::TryingTier(tier),
                    None => ChainState::Failed(exhausted_cause(&run)),
                },
                ChainState::Succeeded(level) => break Ok(level),
                ChainState::Failed(cause) => break Err(cause),
            };
        };

        let elapsed = started.elapsed();
        match verdict {
            Ok(level) => info!(
                request_id = %run.request_id,
                %level,
                attempts = run.attempts.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Chain succeeded"
            ),
            Err(cause) => info!(
                request_id = %run.request_id,
                ?cause,
                attempts = run.attempts.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Chain failed"
            ),
        }

        let reasons = run
            .accepted
            .iter()
            .zip(run.last_reason)
            .filter(|(accepted, _)| accepted.is_none())
            .filter_map(|(_, reason)| reason)
            .collect();

        ChainOutcome {
            verdict,
            trace,
            attempts: run.attempts,
            sentences: run.accepted,
            reasons,
            elapsed,
        }
    }

    async fn try_tier(&self, id: TierId, run: &mut Run) -> ChainState {
        let next = ChainState::Advancing(id.index() + 1);
        if run.cancel.is_cancelled() {
            return ChainState::Failed(FailureCause::Cancelled);
        }
        let tier = self.tier(id);
        let pending = run.pending();

        let Some(permit) = tier.breaker().try_acquire() else {
            run.budget.skip(id);
            run.attempts
                .push(TierAttempt::skipped(id, tier.name(), pending.len()));
            self.metrics
                .record_counter(TIER_SKIPPED, 1, &[("tier", tier.name())]);
            debug!(
                request_id = %run.request_id,
                tier = %tier.name(),
                "Breaker open, skipping tier"
            );
            return next;
        };

        // Dropping the permit here returns a probe slot without an outcome.
        let timeout = match run.budget.next_timeout(id) {
            Ok(timeout) => timeout,
            Err(e) => {
                info!(
                    request_id = %run.request_id,
                    tier = %tier.name(),
                    error = %e,
                    "Deadline exhausted before tier"
                );
                return ChainState::Failed(FailureCause::DeadlineExceeded);
            }
        };

        let texts: Vec<String> = pending.iter().map(|&i| run.texts[i].clone()).collect();
        let span = otel::tier_span(tier.name(), timeout.as_millis() as u64);
        let call = tier
            .call(texts, timeout, &run.cancel)
            .instrument(span.clone())
            .await;
        run.budget.record(id, timeout, call.elapsed);

        let mut attempt = TierAttempt {
            tier: id,
            tier_name: tier.name().to_string(),
            started_at: call.started_at,
            elapsed: call.elapsed,
            allocated: timeout,
            outcome: AttemptOutcome::Success,
            sentences_submitted: pending.len(),
            sentences_accepted: 0,
            quality_metrics: None,
        };

        let state = match call.result {
            Err(CallFailure::Cancelled) => {
                drop(permit);
                attempt.outcome = AttemptOutcome::Cancelled;
                ChainState::Failed(FailureCause::Cancelled)
            }
            Err(CallFailure::Tier(error)) => {
                permit.record(Outcome::Failure(error.failure_kind()));
                attempt.outcome = if error.failure_kind() == FailureKind::Timeout {
                    AttemptOutcome::Timeout
                } else {
                    AttemptOutcome::Error { error }
                };
                next
            }
            Ok(output) => {
                let gate_span = otel::gate_span(tier.name(), output.sentences.len());
                let decisions = gate_span.in_scope(|| run.gate.review(id, &output));
                attempt.quality_metrics = Some(QualityMetrics::aggregate(
                    output.sentences.iter().map(|s| &s.metrics),
                ));

                let mut accepted = 0;
                for ((&slot, sentence), decision) in
                    pending.iter().zip(output.sentences).zip(decisions)
                {
                    match decision {
                        GateDecision::Accept(level) => {
                            accepted += 1;
                            run.accepted[slot] = Some(AcceptedSentence {
                                sentence,
                                level,
                                tier: id,
                            });
                        }
                        GateDecision::Reject(reason) => {
                            self.metrics.record_counter(
                                GATE_REJECTED,
                                1,
                                &[("tier", tier.name()), ("reason", reason.label())],
                            );
                            run.last_reason[slot] = Some(reason);
                        }
                    }
                }
                let rejected = pending.len() - accepted;
                otel::record_gate_result(&gate_span, accepted, rejected);
                attempt.sentences_accepted = accepted;

                if accepted == 0 {
                    permit.record(Outcome::Failure(FailureKind::Validation));
                    attempt.outcome = AttemptOutcome::QualityRejected;
                    debug!(
                        request_id = %run.request_id,
                        tier = %tier.name(),
                        rejected,
                        "Gate rejected all sentences"
                    );
                } else {
                    permit.record(Outcome::Success);
                    if rejected > 0 {
                        debug!(
                            request_id = %run.request_id,
                            tier = %tier.name(),
                            accepted,
                            rejected,
                            "Gate accepted part of the output"
                        );
                    }
                }

                if run.accepted.iter().all(Option::is_some) {
                    let levels = run.accepted.iter().flatten().map(|a| a.level);
                    match combine_levels(levels) {
                        Some(level) => ChainState::Succeeded(level),
                        None => next,
                    }
                } else {
                    next
                }
            }
        };

        otel::record_tier_result(
            &span,
            attempt.outcome.label(),
            attempt.elapsed.as_millis() as u64,
        );
        run.attempts.push(attempt);
        state
    }
}

/// Cause reported once every tier has been tried or skipped.
fn exhausted_cause(run: &Run) -> FailureCause {
    if run.cancel.is_cancelled() {
        FailureCause::Cancelled
    } else if !run.budget.viable() {
        FailureCause::DeadlineExceeded
    } else {
        FailureCause::QualityFloor
    }
}
