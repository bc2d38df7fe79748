//! Analyzer collaborator interface.
//!
//! Each tier of the fallback chain wraps one [`Analyzer`]. Analyzers are
//! black boxes: the pipeline hands them a batch of sentences, a timeout and a
//! cancellation token, and gets back one [`ParsedSentence`] per input sentence
//! or a [`TierError`].
//!
//! [`ScriptedAnalyzer`] is a deterministic stand-in used by the integration
//! tests and the load generator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::breaker::FailureKind;
use crate::gate::count_elements;

/// Grammatical role of a token in an analyzed sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Subject,
    Predicate,
    Object,
    Adverbial,
    Modifier,
    /// A particle emitted as its own token instead of attached to a host word.
    Particle,
    Other,
}

/// One analyzed token. Case particles normally ride on their host word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub surface: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub particle: Option<String>,
}

impl Token {
    pub fn new(surface: impl Into<String>, role: Role) -> Self {
        Self {
            surface: surface.into(),
            role,
            particle: None,
        }
    }

    pub fn with_particle(mut self, particle: impl Into<String>) -> Self {
        self.particle = Some(particle.into());
        self
    }
}

/// Structural tallies of a sentence, used by the tertiary safety rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementCounts {
    pub subject: u32,
    pub predicate: u32,
    pub object: u32,
    pub orphan_particles: u32,
    pub fragments: u32,
}

impl ElementCounts {
    /// How many of {subject, predicate, object} are present at least once.
    pub fn core_roles_present(&self) -> u32 {
        [self.subject, self.predicate, self.object]
            .iter()
            .filter(|&&n| n > 0)
            .count() as u32
    }

    fn add(&mut self, other: &ElementCounts) {
        self.subject += other.subject;
        self.predicate += other.predicate;
        self.object += other.object;
        self.orphan_particles += other.orphan_particles;
        self.fragments += other.fragments;
    }
}

/// Quality signals an analyzer reports alongside each sentence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Estimated F1 against the tier's reference; `None` when the tier cannot
    /// estimate it (heuristic tiers).
    pub f1_score: Option<f64>,
    pub element_counts: ElementCounts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safety_violations: Vec<String>,
}

impl QualityMetrics {
    /// Conservative aggregate across sentences: lowest F1, summed counts,
    /// concatenated violations.
    pub fn aggregate<'a>(metrics: impl IntoIterator<Item = &'a QualityMetrics>) -> Self {
        let mut out = QualityMetrics::default();
        let mut f1: Option<f64> = None;
        for m in metrics {
            if let Some(score) = m.f1_score {
                f1 = Some(f1.map_or(score, |cur: f64| cur.min(score)));
            }
            out.element_counts.add(&m.element_counts);
            out.safety_violations
                .extend(m.safety_violations.iter().cloned());
        }
        out.f1_score = f1;
        out
    }
}

/// A single sentence as returned by an analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedSentence {
    pub text: String,
    pub tokens: Vec<Token>,
    /// False when the analyzer only produced a truncated/partial parse.
    pub terminated: bool,
    pub metrics: QualityMetrics,
}

/// Input handed to an analyzer for one tier attempt.
#[derive(Debug, Clone)]
pub struct ParseRequest {
    pub sentences: Vec<String>,
    /// Time left for this call once the concurrency gate was passed.
    pub timeout: Duration,
    /// Cancelled when the caller no longer wants the result.
    pub cancel: CancellationToken,
}

/// Analyzer output: one entry per requested sentence, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseOutput {
    pub sentences: Vec<ParsedSentence>,
}

/// Failure reported by (or on behalf of) an analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TierError {
    #[error("analyzer timed out")]
    Timeout,

    #[error("analyzer crashed: {0}")]
    Crash(String),

    #[error("analyzer resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("analyzer returned invalid output: {0}")]
    Invalid(String),
}

impl TierError {
    /// Breaker weighting class for this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Timeout => FailureKind::Timeout,
            Self::Crash(_) => FailureKind::Crash,
            Self::ResourceExhausted(_) => FailureKind::ResourceExhausted,
            Self::Invalid(_) => FailureKind::Validation,
        }
    }
}

/// A morphological/dependency analyzer behind one tier.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Short identifier used in logs and metrics labels.
    fn name(&self) -> &str;

    /// Parse every sentence in `request`.
    ///
    /// Implementations should return early with [`TierError::Timeout`] once
    /// `request.cancel` fires; the pipeline discards late results either way.
    async fn parse(&self, request: ParseRequest) -> Result<ParseOutput, TierError>;
}

// ── Scripted analyzer ────────────────────────────────────────────────

/// Shape of the sentences a [`ScriptedAnalyzer`] fabricates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceShape {
    /// Subject, object and a final predicate.
    Complete,
    /// Complete, plus a detached particle token.
    OrphanParticle,
    /// Subject and object only, flagged as not terminated.
    Fragment,
    /// Modifier and predicate: a single core role.
    MissingElements,
    /// Complete structure, but the analyzer reports a safety violation.
    ReportedViolation,
}

/// One scripted reaction to a `parse` call.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Answer every sentence with `shape`; `f1` is cycled across sentences.
    Respond {
        f1: Vec<Option<f64>>,
        shape: SentenceShape,
    },
    Fail(TierError),
    /// Never answer; returns only when cancelled.
    Hang,
    /// Wait, then behave as `then`. Honors cancellation while waiting.
    Delay { delay: Duration, then: Box<Behavior> },
}

impl Behavior {
    /// Complete sentences, all with the same F1.
    pub fn respond(f1: f64) -> Self {
        Self::Respond {
            f1: vec![Some(f1)],
            shape: SentenceShape::Complete,
        }
    }

    /// Complete sentences without any F1 estimate (heuristic tiers).
    pub fn respond_without_f1() -> Self {
        Self::Respond {
            f1: vec![None],
            shape: SentenceShape::Complete,
        }
    }

    pub fn respond_shape(f1: Option<f64>, shape: SentenceShape) -> Self {
        Self::Respond { f1: vec![f1], shape }
    }

    /// Per-sentence F1 values, cycled if there are more sentences.
    pub fn respond_each(f1: Vec<Option<f64>>) -> Self {
        Self::Respond {
            f1,
            shape: SentenceShape::Complete,
        }
    }

    pub fn delayed(delay: Duration, then: Behavior) -> Self {
        Self::Delay {
            delay,
            then: Box::new(then),
        }
    }
}

/// Deterministic analyzer driven by a queue of [`Behavior`]s.
///
/// Each call pops the next scripted behavior; once the script runs dry the
/// fallback behavior answers every call.
pub struct ScriptedAnalyzer {
    name: String,
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    calls: AtomicUsize,
    cancellations: AtomicUsize,
}

impl ScriptedAnalyzer {
    pub fn new(name: impl Into<String>, fallback: Behavior) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
            cancellations: AtomicUsize::new(0),
        }
    }

    /// Queue behaviors to be used, in order, before the fallback.
    pub fn with_script(self, script: impl IntoIterator<Item = Behavior>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(script);
        self
    }

    /// Number of `parse` calls received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of calls that observed cancellation before answering.
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> Behavior {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn parse(&self, request: ParseRequest) -> Result<ParseOutput, TierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut behavior = self.next_behavior();
        loop {
            match behavior {
                Behavior::Respond { f1, shape } => {
                    let sentences = request
                        .sentences
                        .iter()
                        .enumerate()
                        .map(|(i, text)| {
                            let score = if f1.is_empty() {
                                None
                            } else {
                                f1[i % f1.len()]
                            };
                            fabricate(text, score, shape)
                        })
                        .collect();
                    return Ok(ParseOutput { sentences });
                }
                Behavior::Fail(err) => return Err(err),
                Behavior::Hang => {
                    request.cancel.cancelled().await;
                    self.cancellations.fetch_add(1, Ordering::SeqCst);
                    return Err(TierError::Timeout);
                }
                Behavior::Delay { delay, then } => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => behavior = *then,
                        _ = request.cancel.cancelled() => {
                            self.cancellations.fetch_add(1, Ordering::SeqCst);
                            return Err(TierError::Timeout);
                        }
                    }
                }
            }
        }
    }
}

fn fabricate(text: &str, f1: Option<f64>, shape: SentenceShape) -> ParsedSentence {
    let words: Vec<&str> = text.split_whitespace().collect();
    let word = |i: usize, fallback: &str| -> String {
        words
            .get(i)
            .map(|w| w.trim_end_matches(['.', '!', '?', '…', '。']).to_string())
            .unwrap_or_else(|| fallback.to_string())
    };
    let last = words.len().saturating_sub(1);

    let subject = Token::new(word(0, "학생"), Role::Subject).with_particle("가");
    let object = Token::new(word(1, "책"), Role::Object).with_particle("를");
    let predicate = Token::new(word(last.max(2), "읽었다"), Role::Predicate);

    let mut violations = Vec::new();
    let (tokens, terminated) = match shape {
        SentenceShape::Complete => (vec![subject, object, predicate], true),
        SentenceShape::OrphanParticle => (
            vec![subject, object, Token::new("를", Role::Particle), predicate],
            true,
        ),
        SentenceShape::Fragment => (vec![subject, object], false),
        SentenceShape::MissingElements => (
            vec![Token::new(word(0, "아주"), Role::Modifier), predicate],
            true,
        ),
        SentenceShape::ReportedViolation => {
            violations.push("analyzer flagged unsafe segmentation".to_string());
            (vec![subject, object, predicate], true)
        }
    };

    let element_counts = count_elements(&tokens, terminated);
    ParsedSentence {
        text: text.to_string(),
        tokens,
        terminated,
        metrics: QualityMetrics {
            f1_score: f1,
            element_counts,
            safety_violations: violations,
        },
    }
}
