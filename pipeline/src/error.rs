//! Pipeline error types
//!
//! [`PipelineError`] is what callers of the pipeline see. It serializes with a
//! `kind` tag so it can be returned as-is over whatever framing wraps the
//! pipeline. Tier-level failures never surface here directly; they live in
//! the attempt log.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::admission::AdmissionScope;
use crate::gate::RejectReason;
use crate::tier::TierAttempt;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Caller-facing failure of an `analyze` call.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "kind")]
pub enum PipelineError {
    /// Capacity exhausted; retry after the hinted delay.
    #[error("admission rejected at {scope} scope, retry after {retry_after_ms} ms")]
    AdmissionRejected {
        scope: AdmissionScope,
        retry_after_ms: u64,
    },

    #[error("deadline exceeded after {elapsed_ms} ms")]
    DeadlineExceeded {
        elapsed_ms: u64,
        attempt_log: Vec<TierAttempt>,
    },

    /// Every tier was tried or skipped and no output met the floor.
    #[error("quality floor not met: {}", summarize(.reasons))]
    QualityFloorViolation {
        reasons: Vec<RejectReason>,
        attempt_log: Vec<TierAttempt>,
    },

    #[error("request cancelled")]
    Cancelled { attempt_log: Vec<TierAttempt> },

    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },
}

/// Discriminant of [`PipelineError`], handy for metrics labels and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    AdmissionRejected,
    DeadlineExceeded,
    QualityFloorViolation,
    Cancelled,
    InvalidInput,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdmissionRejected => "admission_rejected",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::QualityFloorViolation => "quality_floor_violation",
            Self::Cancelled => "cancelled",
            Self::InvalidInput => "invalid_input",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AdmissionRejected { .. } => ErrorKind::AdmissionRejected,
            Self::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Self::QualityFloorViolation { .. } => ErrorKind::QualityFloorViolation,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
        }
    }

    /// Backoff hint; only admission rejections carry one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::AdmissionRejected { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Tier attempts made before the failure, if any were made.
    pub fn attempt_log(&self) -> &[TierAttempt] {
        match self {
            Self::DeadlineExceeded { attempt_log, .. }
            | Self::QualityFloorViolation { attempt_log, .. }
            | Self::Cancelled { attempt_log } => attempt_log,
            Self::AdmissionRejected { .. } | Self::InvalidInput { .. } => &[],
        }
    }
}

fn summarize(reasons: &[RejectReason]) -> String {
    if reasons.is_empty() {
        return "no tier produced output".to_string();
    }
    reasons
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors loading, validating or reloading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("config version {offered} is not newer than active version {active}")]
    StaleVersion { offered: u64, active: u64 },
}
