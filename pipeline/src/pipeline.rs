//! Request pipeline
//!
//! Ties admission, segmentation and the fallback chain together behind
//! [`AnalysisPipeline::analyze`], and owns the shared state that outlives a
//! request: the config snapshot, admission counters and the tiers with their
//! breakers and semaphores.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmissionSnapshot, QueueTicket};
use crate::analyzer::{Analyzer, ParsedSentence};
use crate::breaker::BreakerSnapshot;
use crate::chain::{ChainInput, ChainOutcome, FailureCause, FallbackChain};
use crate::config::{ConfigStore, PipelineConfig};
use crate::error::{ConfigError, PipelineError, PipelineResult};
use crate::otel;
use crate::segment::split_sentences;
use crate::telemetry::{SharedMetrics, QUALITY_LEVEL, REQUEST_FAILED, REQUEST_LATENCY_MS};
use crate::tier::{AnalyzerTier, QualityLevel, TierAttempt, TierId};

/// An admitted request. Immutable once created.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Uuid,
    pub text: String,
    pub session_id: String,
    pub submitted_at: DateTime<Utc>,
    pub deadline: Instant,
}

/// Successful analysis.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub request_id: Uuid,
    /// Lowest level across sentences.
    pub quality_level: QualityLevel,
    pub payload: Vec<ParsedSentence>,
    pub per_sentence_levels: Vec<QualityLevel>,
    pub attempt_log: Vec<TierAttempt>,
    pub config_version: u64,
    pub elapsed_ms: u64,
}

/// Combined health view for operators.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineHealth {
    pub config_version: u64,
    pub admission: AdmissionSnapshot,
    pub breakers: Vec<BreakerSnapshot>,
}

pub struct AnalysisPipeline {
    config: ConfigStore,
    admission: AdmissionController,
    chain: FallbackChain,
    metrics: SharedMetrics,
    /// Held across a whole reload so the active snapshot and the limits
    /// pushed into admission and the tiers always come from one version.
    reload_lock: Mutex<()>,
}

impl std::fmt::Debug for AnalysisPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisPipeline")
            .field("config_version", &self.config.version())
            .field("chain", &self.chain)
            .finish()
    }
}

impl AnalysisPipeline {
    /// Build a pipeline over three analyzers given in chain order.
    pub fn new(
        config: PipelineConfig,
        analyzers: [Arc<dyn Analyzer>; 3],
        metrics: SharedMetrics,
    ) -> Result<Self, ConfigError> {
        let config = ConfigStore::new(config)?;
        let snapshot = config.current();
        let [primary, secondary, tertiary] = analyzers;
        let tier = |id: TierId, analyzer: Arc<dyn Analyzer>| {
            Arc::new(AnalyzerTier::new(
                id,
                snapshot.tiers.get(id),
                analyzer,
                metrics.clone(),
            ))
        };
        let chain = FallbackChain::new(
            [
                tier(TierId::Primary, primary),
                tier(TierId::Secondary, secondary),
                tier(TierId::Tertiary, tertiary),
            ],
            metrics.clone(),
        );
        Ok(Self {
            admission: AdmissionController::new(snapshot.admission.clone(), metrics.clone()),
            config,
            chain,
            metrics,
            reload_lock: Mutex::new(()),
        })
    }

    /// Analyze `text` for `session_id` within `deadline_ms` (0 uses the
    /// configured default).
    pub async fn analyze(
        &self,
        text: &str,
        session_id: &str,
        deadline_ms: u64,
    ) -> PipelineResult<AnalysisResult> {
        if text.trim().is_empty() {
            return Err(self.fail(PipelineError::InvalidInput {
                reason: "text is empty".to_string(),
            }));
        }
        let ticket = self.admit(session_id)?;
        self.process(&ticket, text, deadline_ms).await
    }

    /// Admission only. Lets a caller hold the ticket, e.g. to cancel it
    /// while [`process`](Self::process) runs.
    pub fn admit(&self, session_id: &str) -> PipelineResult<QueueTicket> {
        self.admission.admit(session_id).map_err(|rejected| {
            self.fail(PipelineError::AdmissionRejected {
                scope: rejected.scope,
                retry_after_ms: rejected.retry_after_ms(),
            })
        })
    }

    /// Run an admitted request through the chain. Releases the ticket when
    /// done.
    pub async fn process(
        &self,
        ticket: &QueueTicket,
        text: &str,
        deadline_ms: u64,
    ) -> PipelineResult<AnalysisResult> {
        let result = self.process_inner(ticket, text, deadline_ms).await;
        ticket.release();
        result
    }

    async fn process_inner(
        &self,
        ticket: &QueueTicket,
        text: &str,
        deadline_ms: u64,
    ) -> PipelineResult<AnalysisResult> {
        let config = self.config.current();
        let deadline_ms = if deadline_ms == 0 {
            config.budget.default_deadline_ms
        } else {
            deadline_ms
        };
        let request = Request {
            id: ticket.id(),
            text: text.to_string(),
            session_id: ticket.session_id().to_string(),
            submitted_at: Utc::now(),
            deadline: Instant::now() + Duration::from_millis(deadline_ms),
        };

        let sentences = split_sentences(&request.text);
        if sentences.is_empty() {
            return Err(self.fail(PipelineError::InvalidInput {
                reason: "text contains no sentences".to_string(),
            }));
        }

        let span = otel::request_span(
            &request.id.to_string(),
            &request.session_id,
            sentences.len(),
        );
        let outcome = self
            .chain
            .run(ChainInput {
                request_id: request.id,
                sentences,
                config: config.clone(),
                deadline: request.deadline,
                cancel: ticket.cancellation_token(),
            })
            .instrument(span.clone())
            .await;

        let elapsed_ms = outcome.elapsed.as_millis() as u64;
        let result = self.finish(&request, config.version, outcome);
        let level = result.as_ref().ok().map(|r| r.quality_level.as_str());
        let label = match &result {
            Ok(_) => "succeeded",
            Err(e) => e.kind().as_str(),
        };
        otel::record_request_result(&span, label, level, elapsed_ms);
        self.metrics
            .record_histogram(REQUEST_LATENCY_MS, elapsed_ms as f64, &[("outcome", label)]);
        result
    }

    fn finish(
        &self,
        request: &Request,
        config_version: u64,
        outcome: ChainOutcome,
    ) -> PipelineResult<AnalysisResult> {
        let elapsed_ms = outcome.elapsed.as_millis() as u64;
        match outcome.verdict {
            Ok(quality_level) => {
                let (payload, per_sentence_levels): (Vec<_>, Vec<_>) = outcome
                    .sentences
                    .into_iter()
                    .flatten()
                    .map(|a| (a.sentence, a.level))
                    .unzip();
                self.metrics.record_counter(
                    QUALITY_LEVEL,
                    1,
                    &[("level", quality_level.as_str())],
                );
                Ok(AnalysisResult {
                    request_id: request.id,
                    quality_level,
                    payload,
                    per_sentence_levels,
                    attempt_log: outcome.attempts,
                    config_version,
                    elapsed_ms,
                })
            }
            Err(FailureCause::DeadlineExceeded) => Err(self.fail(PipelineError::DeadlineExceeded {
                elapsed_ms,
                attempt_log: outcome.attempts,
            })),
            Err(FailureCause::QualityFloor) => {
                Err(self.fail(PipelineError::QualityFloorViolation {
                    reasons: outcome.reasons,
                    attempt_log: outcome.attempts,
                }))
            }
            Err(FailureCause::Cancelled) => Err(self.fail(PipelineError::Cancelled {
                attempt_log: outcome.attempts,
            })),
        }
    }

    fn fail(&self, err: PipelineError) -> PipelineError {
        self.metrics
            .record_counter(REQUEST_FAILED, 1, &[("kind", err.kind().as_str())]);
        err
    }

    /// Install a newer config and push it into admission, breakers and tier
    /// semaphores. On error the active config is unchanged. Concurrent
    /// reloads apply one at a time.
    pub fn reload_config(
        &self,
        next: PipelineConfig,
    ) -> Result<Arc<PipelineConfig>, ConfigError> {
        let _reloading = self.reload_lock.lock().unwrap_or_else(|e| e.into_inner());
        let active = self.config.reload(next)?;
        self.admission.reconfigure(active.admission.clone());
        self.chain.reconfigure(&active);
        Ok(active)
    }

    pub fn reload_from_path(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Arc<PipelineConfig>, ConfigError> {
        self.reload_config(PipelineConfig::load(path)?)
    }

    pub fn config(&self) -> Arc<PipelineConfig> {
        self.config.current()
    }

    pub fn chain(&self) -> &FallbackChain {
        &self.chain
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn admission_snapshot(&self) -> AdmissionSnapshot {
        self.admission.snapshot()
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.chain
            .tiers()
            .iter()
            .map(|t| t.breaker().snapshot())
            .collect()
    }

    pub fn health(&self) -> PipelineHealth {
        PipelineHealth {
            config_version: self.config.version(),
            admission: self.admission_snapshot(),
            breakers: self.breaker_snapshots(),
        }
    }
}
