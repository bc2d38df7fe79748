//! Circuit breaker behavior under concurrent callers.
//!
//! Tests verify:
//! - Many tasks reporting timeouts at once open the breaker exactly once
//! - Half-open hands out no more probes than the batch size
//! - Abandoned probes give their slot back
//! - Late outcomes from before a transition do not move the new state

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use pipeline::config::BreakerConfig;
use pipeline::telemetry::BREAKER_TRANSITION;
use pipeline::{BreakerState, CircuitBreaker, FailureKind, Outcome, RecordingMetrics};

fn breaker() -> (Arc<CircuitBreaker>, Arc<RecordingMetrics>) {
    let metrics = Arc::new(RecordingMetrics::new());
    let cb = Arc::new(CircuitBreaker::new(
        "ud",
        BreakerConfig::default(),
        metrics.clone(),
    ));
    (cb, metrics)
}

async fn open_and_cool(cb: &Arc<CircuitBreaker>) {
    for _ in 0..10 {
        cb.record_failure(FailureKind::Timeout);
    }
    assert_eq!(cb.state(), BreakerState::Open);
    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(cb.state(), BreakerState::HalfOpen);
}

// ── Property: one transition per trip ──────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_timeouts_open_once() {
    let (cb, metrics) = breaker();

    let tasks = (0..64).map(|_| {
        let cb = cb.clone();
        tokio::spawn(async move { cb.record_failure(FailureKind::Timeout) })
    });
    for joined in join_all(tasks).await {
        joined.unwrap();
    }

    assert_eq!(cb.state(), BreakerState::Open);
    assert_eq!(
        metrics.counter_with(BREAKER_TRANSITION, &[("to", "open")]),
        1
    );
}

// ── Property: probe batch is bounded ───────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_half_open_issues_at_most_batch_size_probes() {
    let (cb, _) = breaker();
    open_and_cool(&cb).await;

    let permits: Vec<_> = (0..25).filter_map(|_| cb.try_acquire()).collect();
    assert_eq!(permits.len(), 10);
    assert!(permits.iter().all(|p| p.is_probe()));
    assert_eq!(cb.snapshot().probes_in_flight, 10);

    for permit in permits {
        permit.record(Outcome::Success);
    }
    assert_eq!(cb.state(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_probe_returns_its_slot() {
    let (cb, _) = breaker();
    open_and_cool(&cb).await;

    let mut permits: Vec<_> = (0..10).filter_map(|_| cb.try_acquire()).collect();
    assert!(cb.try_acquire().is_none());

    drop(permits.pop());
    let replacement = cb.try_acquire();
    assert!(replacement.is_some());
    permits.extend(replacement);

    // 7 of 10 is below the 0.8 success rate.
    for (i, permit) in permits.into_iter().enumerate() {
        if i < 7 {
            permit.record(Outcome::Success);
        } else {
            permit.record(Outcome::Failure(FailureKind::Crash));
        }
    }
    assert_eq!(cb.state(), BreakerState::Open);
}

// ── Property: stale outcomes are ignored ───────────────────────────

#[tokio::test(start_paused = true)]
async fn test_outcome_from_closed_phase_ignored_after_trip() {
    let (cb, _) = breaker();
    let slow_call = cb.try_acquire().unwrap();
    assert!(!slow_call.is_probe());

    open_and_cool(&cb).await;
    // Success from a call admitted before the trip counts for nothing.
    slow_call.record(Outcome::Success);
    let snap = cb.snapshot();
    assert_eq!(snap.state, BreakerState::HalfOpen);
    assert_eq!(snap.probes_in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_rule_needs_minimum_samples() {
    let (cb, _) = breaker();
    // 5 crashes out of 5 is a 100% rate but below 20 samples.
    for _ in 0..5 {
        cb.record_failure(FailureKind::Crash);
    }
    assert_eq!(cb.state(), BreakerState::Closed);

    // 15 successes: 6.0 / (6.0 + 15.0) = 0.29 stays closed.
    for _ in 0..15 {
        cb.record_success();
    }
    assert_eq!(cb.state(), BreakerState::Closed);

    // One more crash: 7.2 / (7.2 + 15.0) = 0.32 trips.
    cb.record_failure(FailureKind::Crash);
    assert_eq!(cb.state(), BreakerState::Open);
}
