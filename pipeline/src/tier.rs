//! Analyzer tiers.
//!
//! An [`AnalyzerTier`] wraps one analyzer behind a bounded-concurrency gate,
//! a per-call timeout and the tier's [`CircuitBreaker`]. The breaker is only
//! consulted and fed by the fallback chain, which knows the gate outcome.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::cmp::Ordering as CapChange;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::analyzer::{Analyzer, ParseOutput, ParseRequest, QualityMetrics, TierError};
use crate::breaker::CircuitBreaker;
use crate::config::TierConfig;
use crate::telemetry::{SharedMetrics, TIER_LATENCY_MS};

/// Position of a tier in the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierId {
    Primary,
    Secondary,
    Tertiary,
}

impl TierId {
    /// Chain order.
    pub const ALL: [TierId; 3] = [TierId::Primary, TierId::Secondary, TierId::Tertiary];

    pub fn index(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::Secondary => 1,
            Self::Tertiary => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Level a sentence earns by passing this tier's gate.
    pub fn level(self) -> QualityLevel {
        match self {
            Self::Primary => QualityLevel::Dep,
            Self::Secondary => QualityLevel::Morph,
            Self::Tertiary => QualityLevel::Word,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Tertiary => "tertiary",
        }
    }
}

impl std::fmt::Display for TierId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fidelity of an accepted analysis. Ordered lowest first, so `Dep` is the
/// maximum and `min()` over sentences gives the response level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    /// Word-level heuristics.
    Word,
    /// Morphological analysis.
    Morph,
    /// Full dependency parse.
    Dep,
}

impl QualityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Word => "word",
            Self::Morph => "morph",
            Self::Dep => "dep",
        }
    }
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a tier attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// At least one sentence passed the gate.
    Success,
    Timeout,
    Error { error: TierError },
    /// Skipped without invocation because the breaker was open.
    RejectedByBreaker,
    /// The tier answered but no sentence passed the gate.
    QualityRejected,
    Cancelled,
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::Error { .. } => "error",
            Self::RejectedByBreaker => "rejected_by_breaker",
            Self::QualityRejected => "quality_rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// One entry of a request's attempt log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierAttempt {
    pub tier: TierId,
    pub tier_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    #[serde(rename = "allocated_ms", serialize_with = "as_millis")]
    pub allocated: Duration,
    pub outcome: AttemptOutcome,
    pub sentences_submitted: usize,
    pub sentences_accepted: usize,
    /// Aggregate over the sentences the tier returned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_metrics: Option<QualityMetrics>,
}

impl TierAttempt {
    /// Attempt record for a tier skipped by its breaker.
    pub fn skipped(tier: TierId, tier_name: &str, sentences: usize) -> Self {
        Self {
            tier,
            tier_name: tier_name.to_string(),
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            allocated: Duration::ZERO,
            outcome: AttemptOutcome::RejectedByBreaker,
            sentences_submitted: sentences,
            sentences_accepted: 0,
            quality_metrics: None,
        }
    }
}

/// Why a tier call produced no output.
#[derive(Debug, Clone, PartialEq)]
pub enum CallFailure {
    Tier(TierError),
    /// The request's cancellation token fired.
    Cancelled,
}

/// A held concurrency slot. On release it either returns to the gate or,
/// while a shrink is outstanding, is retired.
struct Slot<'a> {
    permit: Option<SemaphorePermit<'a>>,
    tier: &'a AnalyzerTier,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let mut debt = self.tier.lock_debt();
        if *debt > 0 {
            *debt -= 1;
            permit.forget();
        }
    }
}

/// Result of [`AnalyzerTier::call`] with its timing.
#[derive(Debug)]
pub struct TierCall {
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub result: Result<ParseOutput, CallFailure>,
}

/// One analyzer behind its concurrency gate and breaker.
pub struct AnalyzerTier {
    id: TierId,
    name: String,
    analyzer: Arc<dyn Analyzer>,
    gate: Semaphore,
    max_concurrency: AtomicUsize,
    /// Permits a shrink could not take back because they were checked out.
    /// Released slots pay this down before returning to the gate.
    shrink_debt: Mutex<usize>,
    breaker: Arc<CircuitBreaker>,
    metrics: SharedMetrics,
}

impl std::fmt::Debug for AnalyzerTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzerTier")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("analyzer", &self.analyzer.name())
            .field("max_concurrency", &self.max_concurrency())
            .finish()
    }
}

impl AnalyzerTier {
    pub fn new(
        id: TierId,
        config: &TierConfig,
        analyzer: Arc<dyn Analyzer>,
        metrics: SharedMetrics,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            config.name.clone(),
            config.breaker.clone(),
            metrics.clone(),
        ));
        Self {
            id,
            name: config.name.clone(),
            analyzer,
            gate: Semaphore::new(config.max_concurrency),
            max_concurrency: AtomicUsize::new(config.max_concurrency),
            shrink_debt: Mutex::new(0),
            breaker,
            metrics,
        }
    }

    pub fn id(&self) -> TierId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.load(Ordering::SeqCst)
    }

    /// Free slots on the concurrency gate.
    pub fn available_permits(&self) -> usize {
        self.gate.available_permits()
    }

    fn lock_debt(&self) -> std::sync::MutexGuard<'_, usize> {
        self.shrink_debt.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply reloaded settings. The concurrency gate is resized in place so
    /// calls already holding a slot count against the new cap. The tier
    /// name is fixed at construction.
    pub fn reconfigure(&self, config: &TierConfig) {
        self.breaker.reconfigure(config.breaker.clone());

        let next = config.max_concurrency;
        let mut debt = self.lock_debt();
        let previous = self.max_concurrency.swap(next, Ordering::SeqCst);
        match next.cmp(&previous) {
            CapChange::Greater => {
                let grow = next - previous;
                let repaid = grow.min(*debt);
                *debt -= repaid;
                self.gate.add_permits(grow - repaid);
            }
            CapChange::Less => {
                let shrink = previous - next;
                let forgotten = self.gate.forget_permits(shrink);
                *debt += shrink - forgotten;
            }
            CapChange::Equal => return,
        }
        debug!(
            tier = %self.name,
            from = previous,
            to = next,
            outstanding = *debt,
            "Tier concurrency cap changed"
        );
    }

    async fn acquire_slot(&self) -> Result<Slot<'_>, TierError> {
        let permit = self.gate.acquire().await.map_err(|_| {
            TierError::ResourceExhausted("concurrency gate closed".to_string())
        })?;
        Ok(Slot {
            permit: Some(permit),
            tier: self,
        })
    }

    /// Invoke the analyzer on `sentences`.
    ///
    /// `timeout` bounds the wait for a concurrency slot and the analyzer call
    /// together. The analyzer gets a child of `cancel`, which is cancelled
    /// once this call returns so abandoned work can stop.
    pub async fn call(
        &self,
        sentences: Vec<String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TierCall {
        let started_at = Utc::now();
        let start = Instant::now();
        let expected = sentences.len();
        let child = cancel.child_token();

        let work = async {
            let _slot = self.acquire_slot().await?;
            let request = ParseRequest {
                sentences,
                timeout: timeout.saturating_sub(start.elapsed()),
                cancel: child.clone(),
            };
            self.analyzer.parse(request).await
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CallFailure::Cancelled),
            res = tokio::time::timeout(timeout, work) => match res {
                Ok(Ok(output)) if output.sentences.len() == expected => Ok(output),
                Ok(Ok(output)) => Err(CallFailure::Tier(TierError::Invalid(format!(
                    "expected {expected} sentences, got {}",
                    output.sentences.len()
                )))),
                Ok(Err(e)) => Err(CallFailure::Tier(e)),
                Err(_) => {
                    debug!(
                        tier = %self.name,
                        ?timeout,
                        "Tier call timed out; late result will be discarded"
                    );
                    Err(CallFailure::Tier(TierError::Timeout))
                }
            },
        };
        child.cancel();

        let elapsed = start.elapsed();
        let outcome = match &result {
            Ok(_) => "success",
            Err(CallFailure::Cancelled) => "cancelled",
            Err(CallFailure::Tier(TierError::Timeout)) => "timeout",
            Err(CallFailure::Tier(e)) => {
                warn!(tier = %self.name, error = %e, "Analyzer call failed");
                "error"
            }
        };
        self.metrics.record_histogram(
            TIER_LATENCY_MS,
            elapsed.as_secs_f64() * 1_000.0,
            &[("tier", self.name.as_str()), ("outcome", outcome)],
        );

        TierCall {
            started_at,
            elapsed,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Behavior, ScriptedAnalyzer};
    use crate::telemetry::{NoopMetrics, RecordingMetrics};

    fn tier_with(
        analyzer: ScriptedAnalyzer,
        max_concurrency: usize,
    ) -> (AnalyzerTier, Arc<ScriptedAnalyzer>) {
        let analyzer = Arc::new(analyzer);
        let tier = AnalyzerTier::new(
            TierId::Primary,
            &cap(max_concurrency),
            analyzer.clone(),
            Arc::new(NoopMetrics),
        );
        (tier, analyzer)
    }

    fn cap(max_concurrency: usize) -> TierConfig {
        let mut config = TierConfig::default_for(TierId::Primary);
        config.max_concurrency = max_concurrency;
        config
    }

    /// Answers after a fixed delay while tracking how many calls overlap.
    #[derive(Default)]
    struct Gauge {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn in_flight(&self) -> usize {
            self.in_flight.load(Ordering::SeqCst)
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Analyzer for Gauge {
        fn name(&self) -> &str {
            "gauge"
        }

        async fn parse(&self, request: ParseRequest) -> Result<ParseOutput, TierError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            ScriptedAnalyzer::new("gauge", Behavior::respond(0.9))
                .parse(request)
                .await
        }
    }

    fn gauge_tier(max_concurrency: usize) -> (Arc<AnalyzerTier>, Arc<Gauge>) {
        let gauge = Arc::new(Gauge::default());
        let tier = AnalyzerTier::new(
            TierId::Primary,
            &cap(max_concurrency),
            gauge.clone(),
            Arc::new(NoopMetrics),
        );
        (Arc::new(tier), gauge)
    }

    fn spawn_calls(
        tier: &Arc<AnalyzerTier>,
        n: usize,
    ) -> Vec<tokio::task::JoinHandle<TierCall>> {
        (0..n)
            .map(|_| {
                let tier = tier.clone();
                tokio::spawn(async move {
                    tier.call(sentences(1), Duration::from_secs(5), &CancellationToken::new())
                        .await
                })
            })
            .collect()
    }

    fn sentences(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("철수가 책을 읽었다{i}.")).collect()
    }

    #[test]
    fn test_quality_level_ordering() {
        assert!(QualityLevel::Dep > QualityLevel::Morph);
        assert!(QualityLevel::Morph > QualityLevel::Word);
        assert_eq!(TierId::Primary.level(), QualityLevel::Dep);
        assert_eq!(TierId::Tertiary.level(), QualityLevel::Word);
    }

    #[test]
    fn test_tier_id_index_roundtrip() {
        for tier in TierId::ALL {
            assert_eq!(TierId::from_index(tier.index()), Some(tier));
        }
        assert_eq!(TierId::from_index(3), None);
    }

    #[test]
    fn test_attempt_serializes_durations_as_millis() {
        let mut attempt = TierAttempt::skipped(TierId::Primary, "ud", 2);
        attempt.elapsed = Duration::from_millis(1500);
        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["elapsed_ms"], 1500);
        assert_eq!(json["outcome"]["status"], "rejected_by_breaker");
        assert_eq!(json["tier"], "primary");
    }

    #[tokio::test]
    async fn test_call_returns_output() {
        let (tier, analyzer) = tier_with(ScriptedAnalyzer::new("ud", Behavior::respond(0.95)), 2);
        let call = tier
            .call(sentences(2), Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert_eq!(call.result.unwrap().sentences.len(), 2);
        assert_eq!(analyzer.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out_hanging_analyzer() {
        let (tier, analyzer) = tier_with(ScriptedAnalyzer::new("ud", Behavior::Hang), 2);
        let call = tier
            .call(sentences(1), Duration::from_millis(500), &CancellationToken::new())
            .await;
        assert_eq!(call.result.unwrap_err(), CallFailure::Tier(TierError::Timeout));
        assert!(call.elapsed >= Duration::from_millis(500));
        assert!(call.elapsed < Duration::from_millis(600));
        // The analyzer future was dropped mid-wait rather than answering.
        assert_eq!(analyzer.cancellations(), 0);
    }

    #[tokio::test]
    async fn test_call_rejects_mismatched_sentence_count() {
        struct Short;
        #[async_trait::async_trait]
        impl Analyzer for Short {
            fn name(&self) -> &str {
                "short"
            }
            async fn parse(&self, _request: ParseRequest) -> Result<ParseOutput, TierError> {
                Ok(ParseOutput { sentences: Vec::new() })
            }
        }
        let tier = AnalyzerTier::new(
            TierId::Secondary,
            &TierConfig::default_for(TierId::Secondary),
            Arc::new(Short),
            Arc::new(NoopMetrics),
        );
        let call = tier
            .call(sentences(1), Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert!(matches!(
            call.result,
            Err(CallFailure::Tier(TierError::Invalid(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancellation_wins() {
        let (tier, _) = tier_with(ScriptedAnalyzer::new("ud", Behavior::Hang), 2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let call = tier.call(sentences(1), Duration::from_secs(5), &cancel).await;
        assert_eq!(call.result.unwrap_err(), CallFailure::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_semaphore_wait_counts_against_timeout() {
        let (tier, _) = tier_with(
            ScriptedAnalyzer::new(
                "ud",
                Behavior::delayed(Duration::from_secs(10), Behavior::respond(0.95)),
            ),
            1,
        );
        let tier = Arc::new(tier);
        let busy = {
            let tier = tier.clone();
            tokio::spawn(async move {
                tier.call(sentences(1), Duration::from_secs(20), &CancellationToken::new())
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(tier.available_permits(), 0);

        let waiting = tier
            .call(sentences(1), Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert_eq!(waiting.result.unwrap_err(), CallFailure::Tier(TierError::Timeout));
        assert!(busy.await.unwrap().result.is_ok());
    }

    #[test]
    fn test_reconfigure_resizes_idle_gate() {
        let (tier, _) = tier_with(ScriptedAnalyzer::new("ud", Behavior::respond(0.9)), 2);
        tier.reconfigure(&cap(5));
        assert_eq!(tier.max_concurrency(), 5);
        assert_eq!(tier.available_permits(), 5);
        tier.reconfigure(&cap(1));
        assert_eq!(tier.available_permits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raised_cap_counts_calls_already_running() {
        let (tier, gauge) = gauge_tier(2);
        let mut calls = spawn_calls(&tier, 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gauge.in_flight(), 2);

        tier.reconfigure(&cap(3));
        calls.extend(spawn_calls(&tier, 3));
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Two old calls plus one new one fill the raised cap of 3.
        assert_eq!(gauge.in_flight(), 3);

        for call in futures::future::join_all(calls).await {
            assert!(call.unwrap().result.is_ok());
        }
        assert_eq!(gauge.peak(), 3);
        assert_eq!(tier.available_permits(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lowered_cap_retires_slots_as_calls_finish() {
        let (tier, gauge) = gauge_tier(4);
        let mut calls = spawn_calls(&tier, 4);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gauge.in_flight(), 4);

        tier.reconfigure(&cap(2));
        calls.extend(spawn_calls(&tier, 4));
        tokio::time::sleep(Duration::from_millis(150)).await;
        // The first four finished at 100ms; only two replacements started.
        assert_eq!(gauge.in_flight(), 2);
        assert_eq!(tier.available_permits(), 0);

        for call in futures::future::join_all(calls).await {
            assert!(call.unwrap().result.is_ok());
        }
        assert_eq!(tier.available_permits(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raise_after_pending_shrink_settles_at_new_cap() {
        let (tier, gauge) = gauge_tier(4);
        let calls = spawn_calls(&tier, 4);
        tokio::time::sleep(Duration::from_millis(10)).await;

        tier.reconfigure(&cap(1));
        tier.reconfigure(&cap(3));
        for call in futures::future::join_all(calls).await {
            assert!(call.unwrap().result.is_ok());
        }
        assert_eq!(gauge.peak(), 4);
        assert_eq!(tier.available_permits(), 3);
    }

    #[tokio::test]
    async fn test_call_records_latency() {
        let metrics = Arc::new(RecordingMetrics::new());
        let tier = AnalyzerTier::new(
            TierId::Tertiary,
            &TierConfig::default_for(TierId::Tertiary),
            Arc::new(ScriptedAnalyzer::new("heuristic", Behavior::respond_without_f1())),
            metrics.clone(),
        );
        tier.call(sentences(1), Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert_eq!(
            metrics
                .histogram_values(TIER_LATENCY_MS, &[("tier", "heuristic"), ("outcome", "success")])
                .len(),
            1
        );
    }
}
