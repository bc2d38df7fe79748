//! Quality gate
//!
//! Decides per sentence whether a tier's output is good enough to return.
//! Every tier enforces the structural safety rules; the primary and secondary
//! tiers additionally require an F1 estimate at or above their floor. Passing
//! a tier's gate tags the sentence with that tier's [`QualityLevel`].

use serde::Serialize;

use crate::analyzer::{ElementCounts, ParseOutput, ParsedSentence, QualityMetrics, Role, Token};
use crate::config::TiersConfig;
use crate::tier::{QualityLevel, TierId};

/// Case particles that must not end a sentence or stand alone.
pub const ORPHAN_PARTICLES: &[&str] = &["이", "가", "을", "를", "의", "에서", "으로", "와", "과"];

/// Minimum number of {subject, predicate, object} roles a sentence needs.
pub const MIN_CORE_ROLES: u32 = 2;

/// Why a sentence was rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    MissingF1 { required: f64 },
    F1BelowThreshold { f1: f64, required: f64 },
    InsufficientElements { present: u32, required: u32 },
    OrphanParticle { count: u32 },
    Fragment,
    SafetyViolation { detail: String },
}

impl RejectReason {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::MissingF1 { .. } => "missing_f1",
            Self::F1BelowThreshold { .. } => "f1_below_threshold",
            Self::InsufficientElements { .. } => "insufficient_elements",
            Self::OrphanParticle { .. } => "orphan_particle",
            Self::Fragment => "fragment",
            Self::SafetyViolation { .. } => "safety_violation",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingF1 { required } => write!(f, "missing F1 (required {required:.2})"),
            Self::F1BelowThreshold { f1, required } => {
                write!(f, "F1 {f1:.2} below {required:.2}")
            }
            Self::InsufficientElements { present, required } => {
                write!(f, "{present} core elements, need {required}")
            }
            Self::OrphanParticle { count } => write!(f, "{count} orphan particle(s)"),
            Self::Fragment => write!(f, "sentence fragment"),
            Self::SafetyViolation { detail } => write!(f, "safety violation: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Accept(QualityLevel),
    Reject(RejectReason),
}

impl GateDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }
}

/// Tally roles, orphan particles and fragments from a token sequence.
///
/// An orphan particle is a particle emitted as its own token, or a case
/// particle carried by the final token. A sentence is a fragment when it is
/// not terminated, empty, or does not end in a predicate.
pub fn count_elements(tokens: &[Token], terminated: bool) -> ElementCounts {
    let mut counts = ElementCounts::default();
    for token in tokens {
        match token.role {
            Role::Subject => counts.subject += 1,
            Role::Predicate => counts.predicate += 1,
            Role::Object => counts.object += 1,
            Role::Particle => counts.orphan_particles += 1,
            Role::Adverbial | Role::Modifier | Role::Other => {}
        }
    }

    match tokens.last() {
        Some(last) => {
            let ends_in_particle = last.role != Role::Particle
                && last
                    .particle
                    .as_deref()
                    .is_some_and(|p| ORPHAN_PARTICLES.contains(&p));
            if ends_in_particle {
                counts.orphan_particles += 1;
            }
            if !terminated || last.role != Role::Predicate {
                counts.fragments = 1;
            }
        }
        None => counts.fragments = 1,
    }
    counts
}

/// Lowest level across sentences; `None` for an empty set.
pub fn combine_levels(levels: impl IntoIterator<Item = QualityLevel>) -> Option<QualityLevel> {
    levels.into_iter().min()
}

/// Per-tier acceptance rules.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityGate {
    min_f1: [Option<f64>; 3],
}

impl QualityGate {
    pub fn new(min_f1: [Option<f64>; 3]) -> Self {
        Self { min_f1 }
    }

    pub fn from_config(tiers: &TiersConfig) -> Self {
        Self::new(TierId::ALL.map(|t| tiers.get(t).min_f1))
    }

    pub fn required_f1(&self, tier: TierId) -> Option<f64> {
        self.min_f1[tier.index()]
    }

    /// Judge reported metrics for one sentence.
    pub fn evaluate_metrics(&self, tier: TierId, metrics: &QualityMetrics) -> GateDecision {
        if let Some(detail) = metrics.safety_violations.first() {
            return GateDecision::Reject(RejectReason::SafetyViolation {
                detail: detail.clone(),
            });
        }

        if let Some(required) = self.required_f1(tier) {
            match metrics.f1_score {
                None => return GateDecision::Reject(RejectReason::MissingF1 { required }),
                Some(f1) if f1.is_nan() || f1 < required => {
                    return GateDecision::Reject(RejectReason::F1BelowThreshold { f1, required })
                }
                Some(_) => {}
            }
        }

        let counts = &metrics.element_counts;
        if counts.fragments > 0 {
            return GateDecision::Reject(RejectReason::Fragment);
        }
        if counts.orphan_particles > 0 {
            return GateDecision::Reject(RejectReason::OrphanParticle {
                count: counts.orphan_particles,
            });
        }
        let present = counts.core_roles_present();
        if present < MIN_CORE_ROLES {
            return GateDecision::Reject(RejectReason::InsufficientElements {
                present,
                required: MIN_CORE_ROLES,
            });
        }

        GateDecision::Accept(tier.level())
    }

    /// Judge a parsed sentence. Role counts come from the tokens; defect
    /// counts keep the larger of the observed and reported values.
    pub fn evaluate(&self, tier: TierId, sentence: &ParsedSentence) -> GateDecision {
        let observed = count_elements(&sentence.tokens, sentence.terminated);
        let reported = &sentence.metrics.element_counts;
        let merged = QualityMetrics {
            f1_score: sentence.metrics.f1_score,
            element_counts: ElementCounts {
                subject: observed.subject,
                predicate: observed.predicate,
                object: observed.object,
                orphan_particles: observed.orphan_particles.max(reported.orphan_particles),
                fragments: observed.fragments.max(reported.fragments),
            },
            safety_violations: sentence.metrics.safety_violations.clone(),
        };
        self.evaluate_metrics(tier, &merged)
    }

    /// Judge every sentence of a tier's output, in order.
    pub fn review(&self, tier: TierId, output: &ParseOutput) -> Vec<GateDecision> {
        output
            .sentences
            .iter()
            .map(|s| self.evaluate(tier, s))
            .collect()
    }
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::from_config(&TiersConfig::default())
    }
}
