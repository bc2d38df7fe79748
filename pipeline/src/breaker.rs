//! Per-tier circuit breaker.
//!
//! Tracks a sliding window of weighted outcomes. When the weighted failure
//! rate crosses the threshold (or too many timeouts arrive back to back) the
//! circuit *opens* and the tier is skipped. After the cool-down it goes
//! *half-open* and admits a fixed batch of probes; the batch's success rate
//! decides between *closed* and another open period.
//!
//! ```text
//!   Closed ──(rate ≥ threshold | N timeouts)──▶ Open
//!     ▲                                           │ cool-down
//!     └──(probe batch ok)── HalfOpen ◀────────────┘
//!                              └──(probe batch fails)──▶ Open
//! ```
//!
//! All state lives behind one mutex; every transition happens while it is
//! held. Metrics and log events for a transition are emitted after release.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::telemetry::{SharedMetrics, BREAKER_TRANSITION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Healthy, calls allowed.
    Closed,
    /// Tripped, calls blocked until the cool-down expires.
    Open,
    /// Cool-down expired, a bounded probe batch is allowed.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure class, weighted per [`crate::config::FailureWeights`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ResourceExhausted,
    Crash,
    /// Output rejected by the quality gate or structurally invalid.
    Validation,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Crash => "crash",
            Self::Validation => "validation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(FailureKind),
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    /// `None` for a success.
    failure_weight: Option<f64>,
}

type Transition = (BreakerState, BreakerState);

#[derive(Debug)]
struct Inner {
    config: BreakerConfig,
    state: BreakerState,
    window: VecDeque<Sample>,
    consecutive_timeouts: u32,
    opened_at: Option<Instant>,
    probes_issued: u32,
    probe_successes: u32,
    probe_failures: u32,
    /// Bumped on every transition so outcomes from an earlier phase are ignored.
    epoch: u64,
    last_transition: Option<DateTime<Utc>>,
}

impl Inner {
    fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            window: VecDeque::new(),
            consecutive_timeouts: 0,
            opened_at: None,
            probes_issued: 0,
            probe_successes: 0,
            probe_failures: 0,
            epoch: 0,
            last_transition: None,
        }
    }

    fn transition(&mut self, to: BreakerState, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.epoch += 1;
        self.last_transition = Some(Utc::now());
        self.probes_issued = 0;
        self.probe_successes = 0;
        self.probe_failures = 0;
        match to {
            BreakerState::Open => self.opened_at = Some(now),
            BreakerState::HalfOpen => {}
            BreakerState::Closed => {
                self.opened_at = None;
                self.window.clear();
                self.consecutive_timeouts = 0;
            }
        }
        (from, to)
    }

    /// Lazily move Open → HalfOpen once the cool-down has elapsed.
    fn refresh(&mut self, now: Instant, out: &mut Vec<Transition>) {
        if self.state != BreakerState::Open {
            return;
        }
        let cooled = self
            .opened_at
            .map_or(true, |at| now.duration_since(at) >= self.config.cooldown());
        if cooled {
            out.push(self.transition(BreakerState::HalfOpen, now));
        }
    }

    fn evict(&mut self, now: Instant) {
        let window = self.config.window();
        while self.window.len() > self.config.window_samples {
            match self.window.front() {
                Some(s) if now.duration_since(s.at) >= window => {
                    self.window.pop_front();
                }
                _ => break,
            }
        }
    }

    fn weighted_rate(&self) -> f64 {
        let (failures, successes) =
            self.window
                .iter()
                .fold((0.0, 0.0), |(f, s), sample| match sample.failure_weight {
                    Some(w) => (f + w, s),
                    None => (f, s + 1.0),
                });
        let total = failures + successes;
        if total > 0.0 {
            failures / total
        } else {
            0.0
        }
    }

    fn has_room(&self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => self.probes_issued < self.config.half_open_probe_size,
        }
    }

    /// Reserve a call slot; returns the epoch the call belongs to and whether
    /// it is a half-open probe.
    fn admit(&mut self, now: Instant, out: &mut Vec<Transition>) -> Option<(u64, bool)> {
        self.refresh(now, out);
        match self.state {
            BreakerState::Closed => Some((self.epoch, false)),
            BreakerState::Open => None,
            BreakerState::HalfOpen => {
                if self.probes_issued < self.config.half_open_probe_size {
                    self.probes_issued += 1;
                    Some((self.epoch, true))
                } else {
                    None
                }
            }
        }
    }

    fn record(
        &mut self,
        outcome: Outcome,
        epoch: Option<u64>,
        now: Instant,
        out: &mut Vec<Transition>,
    ) {
        self.refresh(now, out);
        if epoch.is_some_and(|e| e != self.epoch) {
            return;
        }
        match self.state {
            BreakerState::Open => {}
            BreakerState::Closed => {
                let failure_weight = match outcome {
                    Outcome::Success => {
                        self.consecutive_timeouts = 0;
                        None
                    }
                    Outcome::Failure(kind) => {
                        if kind == FailureKind::Timeout {
                            self.consecutive_timeouts += 1;
                        }
                        Some(self.config.weights.weight(kind))
                    }
                };
                self.window.push_back(Sample {
                    at: now,
                    failure_weight,
                });
                self.evict(now);

                let timeouts_tripped =
                    self.consecutive_timeouts >= self.config.consecutive_timeout_limit;
                let rate_tripped = self.window.len() >= self.config.min_samples
                    && self.weighted_rate() >= self.config.failure_threshold;
                if timeouts_tripped || rate_tripped {
                    out.push(self.transition(BreakerState::Open, now));
                }
            }
            BreakerState::HalfOpen => {
                let resolved = self.probe_successes + self.probe_failures;
                if resolved >= self.probes_issued {
                    // Not a probe of this batch.
                    return;
                }
                match outcome {
                    Outcome::Success => {
                        self.probe_successes += 1;
                        self.consecutive_timeouts = 0;
                    }
                    Outcome::Failure(_) => self.probe_failures += 1,
                }
                let batch = self.config.half_open_probe_size;
                if self.probe_successes + self.probe_failures >= batch {
                    let rate = f64::from(self.probe_successes) / f64::from(batch);
                    let to = if rate >= self.config.half_open_success_rate {
                        BreakerState::Closed
                    } else {
                        BreakerState::Open
                    };
                    out.push(self.transition(to, now));
                }
            }
        }
    }

    /// Give back a probe slot whose call never reported.
    fn abandon(&mut self, epoch: u64) {
        if self.state == BreakerState::HalfOpen && self.epoch == epoch && self.probes_issued > 0 {
            self.probes_issued -= 1;
        }
    }
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub tier: String,
    pub state: BreakerState,
    pub failure_rate: f64,
    pub samples: usize,
    pub consecutive_timeouts: u32,
    pub probes_in_flight: u32,
    pub last_transition: Option<DateTime<Utc>>,
}

/// Circuit breaker guarding one analyzer tier.
pub struct CircuitBreaker {
    tier: String,
    inner: Mutex<Inner>,
    metrics: SharedMetrics,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("tier", &self.tier)
            .field("state", &self.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(tier: impl Into<String>, config: BreakerConfig, metrics: SharedMetrics) -> Self {
        Self {
            tier: tier.into(),
            inner: Mutex::new(Inner::new(config)),
            metrics,
        }
    }

    pub fn tier(&self) -> &str {
        &self.tier
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state, applying an expired cool-down first.
    pub fn state(&self) -> BreakerState {
        let mut transitions = Vec::new();
        let state = {
            let mut inner = self.lock();
            inner.refresh(Instant::now(), &mut transitions);
            inner.state
        };
        self.emit(transitions);
        state
    }

    /// Whether a call would be admitted right now. Reserves nothing; use
    /// [`try_acquire`](Self::try_acquire) to actually claim a slot.
    pub fn allow(&self) -> bool {
        let mut transitions = Vec::new();
        let room = {
            let mut inner = self.lock();
            inner.refresh(Instant::now(), &mut transitions);
            inner.has_room()
        };
        self.emit(transitions);
        room
    }

    /// Claim a call slot. The permit reports the call's outcome; dropping it
    /// unreported returns a half-open slot.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BreakerPermit> {
        let mut transitions = Vec::new();
        let admitted = self.lock().admit(Instant::now(), &mut transitions);
        self.emit(transitions);
        let (epoch, probe) = admitted?;
        Some(BreakerPermit {
            breaker: Arc::clone(self),
            epoch,
            probe,
            reported: false,
        })
    }

    pub fn record(&self, outcome: Outcome) {
        self.record_at_epoch(outcome, None);
    }

    pub fn record_success(&self) {
        self.record(Outcome::Success);
    }

    pub fn record_failure(&self, kind: FailureKind) {
        self.record(Outcome::Failure(kind));
    }

    fn record_at_epoch(&self, outcome: Outcome, epoch: Option<u64>) {
        let mut transitions = Vec::new();
        self.lock()
            .record(outcome, epoch, Instant::now(), &mut transitions);
        self.emit(transitions);
    }

    /// Apply new thresholds. Current state and window are kept.
    pub fn reconfigure(&self, config: BreakerConfig) {
        let mut inner = self.lock();
        inner.config = config;
        inner.evict(Instant::now());
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut transitions = Vec::new();
        let snapshot = {
            let mut inner = self.lock();
            inner.refresh(Instant::now(), &mut transitions);
            BreakerSnapshot {
                tier: self.tier.clone(),
                state: inner.state,
                failure_rate: inner.weighted_rate(),
                samples: inner.window.len(),
                consecutive_timeouts: inner.consecutive_timeouts,
                probes_in_flight: inner
                    .probes_issued
                    .saturating_sub(inner.probe_successes + inner.probe_failures),
                last_transition: inner.last_transition,
            }
        };
        self.emit(transitions);
        snapshot
    }

    fn emit(&self, transitions: Vec<Transition>) {
        for (from, to) in transitions {
            self.metrics.record_counter(
                BREAKER_TRANSITION,
                1,
                &[
                    ("tier", self.tier.as_str()),
                    ("from", from.as_str()),
                    ("to", to.as_str()),
                ],
            );
            if to == BreakerState::Open {
                warn!(tier = %self.tier, %from, %to, "Circuit breaker opened");
            } else {
                info!(tier = %self.tier, %from, %to, "Circuit breaker transition");
            }
        }
    }
}

/// Admission to call a tier, obtained from [`CircuitBreaker::try_acquire`].
#[must_use = "report the call outcome through the permit"]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    epoch: u64,
    probe: bool,
    reported: bool,
}

impl BreakerPermit {
    /// Whether this call is one of the half-open probe batch.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record(mut self, outcome: Outcome) {
        self.reported = true;
        self.breaker.record_at_epoch(outcome, Some(self.epoch));
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.reported && self.probe {
            self.breaker.lock().abandon(self.epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{NoopMetrics, RecordingMetrics};
    use std::time::Duration;

    fn breaker(config: BreakerConfig) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("ud", config, Arc::new(NoopMetrics)))
    }

    fn trip(cb: &CircuitBreaker) {
        for _ in 0..10 {
            cb.record_failure(FailureKind::Timeout);
        }
    }

    #[test]
    fn test_breaker_starts_closed() {
        let cb = breaker(BreakerConfig::default());
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.allow());
    }

    #[test]
    fn test_consecutive_timeouts_open_breaker() {
        let cb = breaker(BreakerConfig::default());
        for _ in 0..9 {
            cb.record_failure(FailureKind::Timeout);
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure(FailureKind::Timeout);
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow());
    }

    #[test]
    fn test_timeout_streak_survives_other_failures() {
        let cb = breaker(BreakerConfig {
            min_samples: 1_000,
            ..Default::default()
        });
        for _ in 0..5 {
            cb.record_failure(FailureKind::Timeout);
        }
        cb.record_failure(FailureKind::Crash);
        for _ in 0..5 {
            cb.record_failure(FailureKind::Timeout);
        }
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_success_resets_timeout_streak() {
        let cb = breaker(BreakerConfig {
            min_samples: 1_000,
            ..Default::default()
        });
        for _ in 0..9 {
            cb.record_failure(FailureKind::Timeout);
        }
        cb.record_success();
        for _ in 0..9 {
            cb.record_failure(FailureKind::Timeout);
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot().consecutive_timeouts, 9);
    }

    #[test]
    fn test_rate_rule_needs_min_samples() {
        let cb = breaker(BreakerConfig::default());
        // 5 crashes among 19 samples: rate ~0.33 but below min_samples.
        for _ in 0..5 {
            cb.record_failure(FailureKind::Crash);
        }
        for _ in 0..14 {
            cb.record_success();
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure(FailureKind::Crash);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_validation_failures_are_weighted_lightly() {
        let cb = breaker(BreakerConfig::default());
        // 10 validation failures weigh 3.0 against 10 successes: rate 0.23.
        for _ in 0..10 {
            cb.record_failure(FailureKind::Validation);
            cb.record_success();
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        let rate = cb.snapshot().failure_rate;
        assert!((rate - 3.0 / 13.0).abs() < 1e-9, "{rate}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown() {
        let cb = breaker(BreakerConfig::default());
        trip(&cb);
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!cb.allow());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_in_half_open_reserves_nothing() {
        let cb = breaker(BreakerConfig::default());
        trip(&cb);
        tokio::time::advance(Duration::from_secs(60)).await;

        for _ in 0..50 {
            assert!(cb.allow());
        }
        assert_eq!(cb.snapshot().probes_in_flight, 0);
        let permits: Vec<_> = (0..10).filter_map(|_| cb.try_acquire()).collect();
        assert_eq!(permits.len(), 10);
        // Batch is full, so nothing more would be admitted.
        assert!(!cb.allow());
        for permit in permits {
            permit.record(Outcome::Success);
        }
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_probe_batch() {
        let cb = breaker(BreakerConfig::default());
        trip(&cb);
        tokio::time::advance(Duration::from_secs(60)).await;

        let permits: Vec<_> = (0..10).map(|_| cb.try_acquire().unwrap()).collect();
        assert!(permits.iter().all(BreakerPermit::is_probe));
        assert!(cb.try_acquire().is_none());

        // Dropping an unreported probe frees its slot.
        let mut permits = permits;
        permits.pop();
        assert!(cb.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_batch_closes_or_reopens() {
        let cb = breaker(BreakerConfig::default());
        trip(&cb);
        tokio::time::advance(Duration::from_secs(60)).await;
        let permits: Vec<_> = (0..10).map(|_| cb.try_acquire().unwrap()).collect();
        for (i, permit) in permits.into_iter().enumerate() {
            if i < 7 {
                permit.record(Outcome::Success);
            } else {
                permit.record(Outcome::Failure(FailureKind::Crash));
            }
        }
        // 7/10 < 0.8
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_permit_is_ignored_after_transition() {
        let cb = breaker(BreakerConfig::default());
        let stale = cb.try_acquire().unwrap();
        trip(&cb);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        stale.record(Outcome::Failure(FailureKind::Timeout));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert_eq!(cb.snapshot().probes_in_flight, 0);
    }

    #[test]
    fn test_window_keeps_latest_samples_within_age() {
        let cb = breaker(BreakerConfig {
            window_samples: 5,
            ..Default::default()
        });
        for _ in 0..8 {
            cb.record_success();
        }
        // All samples are younger than the window, so none are evicted.
        assert_eq!(cb.snapshot().samples, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_evicts_old_samples_beyond_count() {
        let cb = breaker(BreakerConfig {
            window_samples: 5,
            ..Default::default()
        });
        for _ in 0..8 {
            cb.record_success();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        cb.record_success();
        assert_eq!(cb.snapshot().samples, 5);
    }

    #[test]
    fn test_transitions_emit_metrics() {
        let metrics = Arc::new(RecordingMetrics::new());
        let cb = CircuitBreaker::new("mecab", BreakerConfig::default(), metrics.clone());
        trip(&cb);
        assert_eq!(
            metrics.counter_with(
                BREAKER_TRANSITION,
                &[("tier", "mecab"), ("from", "closed"), ("to", "open")]
            ),
            1
        );
    }
}
