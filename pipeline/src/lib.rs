//! Resilient Korean Analysis Pipeline
//!
//! This library provides the request path in front of three analyzer tiers:
//! - Admission control with global and per-session caps (strict load shedding)
//! - A fallback chain over dependency → morphological → heuristic analyzers
//! - Per-tier circuit breakers with weighted failures and half-open probing
//! - Deadline splitting across tiers
//! - A quality gate that never lets output below the safety floor through
//!
//! # Flow
//!
//! ```text
//! analyze(text, session, deadline)
//!   └─ AdmissionController ── Rejected{scope, retry_after}
//!       └─ FallbackChain
//!           ├─ primary   (ud)        F1 ≥ 0.90  → dep
//!           ├─ secondary (mecab)     F1 ≥ 0.82  → morph
//!           └─ tertiary  (heuristic) safety only → word
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use pipeline::{AnalysisPipeline, PipelineConfig, FacadeMetrics};
//!
//! let pipeline = AnalysisPipeline::new(
//!     PipelineConfig::load("pipeline.toml")?,
//!     [ud, mecab, heuristic],
//!     Arc::new(FacadeMetrics),
//! )?;
//! let result = pipeline.analyze("철수가 밥을 먹었다.", "session-1", 0).await?;
//! println!("{} {:?}", result.quality_level, result.per_sentence_levels);
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod admission;
pub mod analyzer;
pub mod breaker;
pub mod budget;
pub mod chain;
pub mod config;
pub mod error;
pub mod gate;
pub mod otel;
pub mod pipeline;
pub mod segment;
pub mod telemetry;
pub mod tier;

// Re-export the request boundary
pub use pipeline::{AnalysisPipeline, AnalysisResult, PipelineHealth, Request};

pub use admission::{AdmissionController, AdmissionScope, AdmissionSnapshot, QueueTicket, Rejected};
pub use analyzer::{
    Analyzer, Behavior, ElementCounts, ParseOutput, ParseRequest, ParsedSentence, QualityMetrics,
    Role, ScriptedAnalyzer, SentenceShape, TierError, Token,
};
pub use breaker::{
    BreakerPermit, BreakerSnapshot, BreakerState, CircuitBreaker, FailureKind, Outcome,
};
pub use budget::{BudgetExhausted, BudgetTracker, TimeoutBudgetAllocator};
pub use chain::{ChainState, ChainTrace, FailureCause, FallbackChain};
pub use config::{ConfigStore, PipelineConfig};
pub use error::{ConfigError, ErrorKind, PipelineError, PipelineResult};
pub use gate::{GateDecision, QualityGate, RejectReason};
pub use telemetry::{FacadeMetrics, MetricsSink, NoopMetrics, RecordingMetrics, SharedMetrics};
pub use tier::{AnalyzerTier, AttemptOutcome, QualityLevel, TierAttempt, TierId};
