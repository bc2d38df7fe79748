//! Observability sink.
//!
//! The pipeline reports counters and histograms through [`MetricsSink`]; where
//! they end up is the embedder's business. Three sinks ship with the crate:
//! [`NoopMetrics`], [`RecordingMetrics`] (in-memory, for tests and the load
//! generator) and [`FacadeMetrics`] (forwards into the `metrics` facade so any
//! installed recorder/exporter picks them up).

use std::sync::{Arc, Mutex};

use serde::Serialize;

// ── Metric Name Constants ────────────────────────────────────────────

pub const ADMISSION_ACCEPTED: &str = "admission_accepted";
/// Labels: `scope`.
pub const ADMISSION_REJECTED: &str = "admission_rejected";
/// Labels: `tier`, `from`, `to`.
pub const BREAKER_TRANSITION: &str = "breaker_transition";
/// Labels: `tier`, `outcome`.
pub const TIER_LATENCY_MS: &str = "tier_latency_ms";
/// Labels: `tier`.
pub const TIER_SKIPPED: &str = "tier_skipped";
/// Labels: `tier`, `reason`.
pub const GATE_REJECTED: &str = "gate_rejected";
/// Labels: `level`.
pub const QUALITY_LEVEL: &str = "quality_level";
/// Labels: `kind`.
pub const REQUEST_FAILED: &str = "request_failed";
pub const REQUEST_LATENCY_MS: &str = "request_latency_ms";

/// Destination for pipeline counters and histograms.
pub trait MetricsSink: Send + Sync {
    fn record_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]);
    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// Shared reference to a metrics sink
pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_counter(&self, _name: &str, _value: u64, _labels: &[(&str, &str)]) {}
    fn record_histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    Counter(u64),
    Histogram(f64),
}

/// One recorded metric emission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEvent {
    pub name: String,
    pub value: MetricValue,
    pub labels: Vec<(String, String)>,
}

impl MetricEvent {
    fn matches(&self, name: &str, labels: &[(&str, &str)]) -> bool {
        self.name == name
            && labels
                .iter()
                .all(|(k, v)| self.labels.iter().any(|(lk, lv)| lk == k && lv == v))
    }
}

/// Keeps every emission in memory.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, name: &str, value: MetricValue, labels: &[(&str, &str)]) {
        let event = MetricEvent {
            name: name.to_string(),
            value,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Sum of every counter emission named `name`.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counter_with(name, &[])
    }

    /// Sum of counter emissions named `name` whose labels include `labels`.
    pub fn counter_with(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.matches(name, labels))
            .map(|e| match e.value {
                MetricValue::Counter(n) => n,
                MetricValue::Histogram(_) => 0,
            })
            .sum()
    }

    /// Every histogram observation named `name` whose labels include `labels`.
    pub fn histogram_values(&self, name: &str, labels: &[(&str, &str)]) -> Vec<f64> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.matches(name, labels))
            .filter_map(|e| match e.value {
                MetricValue::Histogram(v) => Some(v),
                MetricValue::Counter(_) => None,
            })
            .collect()
    }
}

impl MetricsSink for RecordingMetrics {
    fn record_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        self.push(name, MetricValue::Counter(value), labels);
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.push(name, MetricValue::Histogram(value), labels);
    }
}

/// Forwards into the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetrics;

fn facade_labels(labels: &[(&str, &str)]) -> Vec<metrics::Label> {
    labels
        .iter()
        .map(|(k, v)| metrics::Label::new(k.to_string(), v.to_string()))
        .collect()
}

impl MetricsSink for FacadeMetrics {
    fn record_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        metrics::counter!(name.to_string(), value, facade_labels(labels));
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        metrics::histogram!(name.to_string(), value, facade_labels(labels));
    }
}
