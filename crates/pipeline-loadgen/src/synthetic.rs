//! Synthetic analyzer tiers for load runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pipeline::{Analyzer, Behavior, ParseOutput, ParseRequest, ScriptedAnalyzer, TierError};

/// Knobs for one synthetic tier.
#[derive(Debug, Clone, Copy)]
pub struct TierProfile {
    pub latency: Duration,
    /// Every `failure_period`-th call crashes; 0 disables failures.
    pub failure_period: u64,
    /// Reported F1; `None` for a heuristic tier.
    pub f1: Option<f64>,
}

/// Answers with complete sentences after a fixed latency, crashing on a
/// fixed period.
pub struct SyntheticAnalyzer {
    profile: TierProfile,
    responder: ScriptedAnalyzer,
    calls: AtomicU64,
}

impl SyntheticAnalyzer {
    pub fn new(name: &str, profile: TierProfile) -> Self {
        let answer = match profile.f1 {
            Some(f1) => Behavior::respond(f1),
            None => Behavior::respond_without_f1(),
        };
        Self {
            profile,
            responder: ScriptedAnalyzer::new(name, Behavior::delayed(profile.latency, answer)),
            calls: AtomicU64::new(0),
        }
    }

    fn should_fail(&self) -> bool {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        self.profile.failure_period > 0 && n % self.profile.failure_period == 0
    }
}

#[async_trait]
impl Analyzer for SyntheticAnalyzer {
    fn name(&self) -> &str {
        self.responder.name()
    }

    async fn parse(&self, request: ParseRequest) -> Result<ParseOutput, TierError> {
        if self.should_fail() {
            tokio::select! {
                _ = tokio::time::sleep(self.profile.latency) => {}
                _ = request.cancel.cancelled() => return Err(TierError::Timeout),
            }
            return Err(TierError::Crash("synthetic failure".to_string()));
        }
        self.responder.parse(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ParseRequest {
        ParseRequest {
            sentences: vec!["철수가 밥을 먹었다.".to_string()],
            timeout: Duration::from_secs(1),
            cancel: Default::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_on_period() {
        let analyzer = SyntheticAnalyzer::new(
            "ud",
            TierProfile {
                latency: Duration::from_millis(20),
                failure_period: 3,
                f1: Some(0.95),
            },
        );
        let mut outcomes = Vec::new();
        for _ in 0..6 {
            outcomes.push(analyzer.parse(request()).await.is_ok());
        }
        assert_eq!(outcomes, vec![true, true, false, true, true, false]);
    }
}
