//! OpenTelemetry-Compatible Span Helpers
//!
//! Structured `tracing` span builders for the request pipeline. Span and field
//! names use dot notation so an OpenTelemetry layer can export them unchanged.
//!
//! # Span Hierarchy
//!
//! ```text
//! pipeline.request        (root, one per admitted request)
//!   └─ pipeline.tier      (one per tier considered, including skips)
//!       └─ pipeline.gate  (quality gate over that tier's output)
//! ```
//!
//! Result fields start out empty and are filled by the `record_*` helpers
//! once the outcome is known.

use tracing::Span;

// ── Span Name Constants ──────────────────────────────────────────────

pub const SPAN_REQUEST: &str = "pipeline.request";
pub const SPAN_TIER: &str = "pipeline.tier";
pub const SPAN_GATE: &str = "pipeline.gate";

// ── Field Name Constants ─────────────────────────────────────────────

pub const FIELD_REQUEST_ID: &str = "request.id";
pub const FIELD_SESSION_ID: &str = "request.session_id";
pub const FIELD_SENTENCES: &str = "request.sentences";
pub const FIELD_TIER: &str = "pipeline.tier.name";
pub const FIELD_ALLOCATED_MS: &str = "pipeline.tier.allocated_ms";
pub const FIELD_OUTCOME: &str = "pipeline.outcome";
pub const FIELD_QUALITY_LEVEL: &str = "pipeline.quality_level";
pub const FIELD_ACCEPTED: &str = "pipeline.gate.accepted";
pub const FIELD_REJECTED: &str = "pipeline.gate.rejected";
pub const FIELD_DURATION_MS: &str = "pipeline.duration_ms";

// ── Span Builders ────────────────────────────────────────────────────

/// Root span for one request.
///
/// Fields filled later via [`record_request_result`]: `pipeline.outcome`,
/// `pipeline.quality_level`, `pipeline.duration_ms`.
pub fn request_span(request_id: &str, session_id: &str, sentences: usize) -> Span {
    tracing::info_span!(
        "pipeline.request",
        "request.id" = %request_id,
        "request.session_id" = %session_id,
        "request.sentences" = sentences,
        "pipeline.outcome" = tracing::field::Empty,
        "pipeline.quality_level" = tracing::field::Empty,
        "pipeline.duration_ms" = tracing::field::Empty,
    )
}

/// Record the final outcome on a request span. `level` is `None` on failure.
pub fn record_request_result(span: &Span, outcome: &str, level: Option<&str>, duration_ms: u64) {
    span.record("pipeline.outcome", outcome);
    if let Some(level) = level {
        span.record("pipeline.quality_level", level);
    }
    span.record("pipeline.duration_ms", duration_ms);
}

/// Span for one tier attempt.
pub fn tier_span(tier: &str, allocated_ms: u64) -> Span {
    tracing::info_span!(
        "pipeline.tier",
        "pipeline.tier.name" = %tier,
        "pipeline.tier.allocated_ms" = allocated_ms,
        "pipeline.outcome" = tracing::field::Empty,
        "pipeline.duration_ms" = tracing::field::Empty,
    )
}

pub fn record_tier_result(span: &Span, outcome: &str, duration_ms: u64) {
    span.record("pipeline.outcome", outcome);
    span.record("pipeline.duration_ms", duration_ms);
}

/// Span for the quality gate pass over one tier's output.
pub fn gate_span(tier: &str, sentences: usize) -> Span {
    tracing::debug_span!(
        "pipeline.gate",
        "pipeline.tier.name" = %tier,
        "request.sentences" = sentences,
        "pipeline.gate.accepted" = tracing::field::Empty,
        "pipeline.gate.rejected" = tracing::field::Empty,
    )
}

pub fn record_gate_result(span: &Span, accepted: usize, rejected: usize) {
    span.record("pipeline.gate.accepted", accepted);
    span.record("pipeline.gate.rejected", rejected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn init_test_subscriber() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(tracing::Level::TRACE)
                .try_init();
        });
    }

    #[test]
    fn test_request_span_creates_valid_span() {
        init_test_subscriber();
        let span = request_span("req-1", "session-a", 3);
        assert!(!span.is_disabled());
        record_request_result(&span, "succeeded", Some("morph"), 120);
    }

    #[test]
    fn test_tier_span_creates_valid_span() {
        init_test_subscriber();
        let span = tier_span("ud", 2500);
        assert!(!span.is_disabled());
        record_tier_result(&span, "timeout", 2500);
    }

    #[test]
    fn test_gate_span_creates_valid_span() {
        init_test_subscriber();
        let span = gate_span("heuristic", 4);
        assert!(!span.is_disabled());
        record_gate_result(&span, 3, 1);
    }

    #[test]
    fn test_span_constants_are_dotted() {
        assert!(SPAN_REQUEST.contains('.'));
        assert!(SPAN_TIER.contains('.'));
        assert!(SPAN_GATE.contains('.'));
    }

    #[test]
    fn test_field_constants_are_dotted() {
        for field in [
            FIELD_REQUEST_ID,
            FIELD_SESSION_ID,
            FIELD_SENTENCES,
            FIELD_TIER,
            FIELD_ALLOCATED_MS,
            FIELD_OUTCOME,
            FIELD_QUALITY_LEVEL,
            FIELD_ACCEPTED,
            FIELD_REJECTED,
            FIELD_DURATION_MS,
        ] {
            assert!(field.contains('.'), "{field}");
        }
    }
}
