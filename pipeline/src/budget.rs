//! Timeout budget: splitting a request deadline across sequential tiers
//!
//! The current tier gets `ratio_i / Σ ratio_i..n` of what is left, so with the
//! default ratios a 5 s budget becomes 2.5 s / 1.5 s / 1.0 s when each tier
//! uses its whole slice, and whatever a tier leaves unused rolls forward.
//!
//! A tier skipped by an open breaker only carries part of its slice forward;
//! the rest is held back as slack for assembling the response.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pipeline::budget::{BudgetTracker, TimeoutBudgetAllocator};
//!
//! let allocator = TimeoutBudgetAllocator::from_config(&config.budget);
//! let mut budget = BudgetTracker::new(allocator, request.deadline);
//! let timeout = budget.next_timeout(TierId::Primary)?;
//! ```

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::BudgetConfig;
use crate::tier::TierId;

/// Not enough time left to give a tier a useful timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("remaining budget {remaining:?} is below the minimum viable timeout {min_viable:?}")]
pub struct BudgetExhausted {
    pub remaining: Duration,
    pub min_viable: Duration,
}

/// Stateless deadline splitter.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutBudgetAllocator {
    ratios: Vec<f64>,
    carry_fraction: f64,
    min_viable: Duration,
}

impl TimeoutBudgetAllocator {
    pub fn new(ratios: Vec<f64>, carry_fraction: f64, min_viable: Duration) -> Self {
        Self {
            ratios,
            carry_fraction: carry_fraction.clamp(0.0, 1.0),
            min_viable,
        }
    }

    pub fn from_config(config: &BudgetConfig) -> Self {
        Self::new(
            config.split_ratios.clone(),
            config.skip_carry_fraction,
            Duration::from_millis(config.min_viable_timeout_ms),
        )
    }

    pub fn min_viable(&self) -> Duration {
        self.min_viable
    }

    pub fn carry_fraction(&self) -> f64 {
        self.carry_fraction
    }

    /// Fraction of `remaining` that belongs to `tier`. The last configured
    /// tier (and anything past it) owns everything that is left.
    fn share(&self, tier: usize) -> f64 {
        let rest: f64 = self.ratios.iter().skip(tier).sum();
        match self.ratios.get(tier) {
            Some(r) if rest > 0.0 => r / rest,
            _ => 1.0,
        }
    }

    /// Slice of `remaining` for `tier` before any floor is applied.
    pub fn slice(&self, remaining: Duration, tier: usize) -> Duration {
        remaining.mul_f64(self.share(tier))
    }

    /// Timeout for `tier` given the effective remaining budget.
    ///
    /// Never returns more than `remaining`. A slice smaller than the minimum
    /// viable timeout is raised to it when the budget allows.
    pub fn allocate(&self, remaining: Duration, tier: usize) -> Result<Duration, BudgetExhausted> {
        if remaining < self.min_viable {
            return Err(BudgetExhausted {
                remaining,
                min_viable: self.min_viable,
            });
        }
        Ok(self.slice(remaining, tier).max(self.min_viable).min(remaining))
    }

    /// The slice `tier` gets out of a fresh `total` budget when every earlier
    /// tier consumes its own slice in full.
    pub fn nominal(&self, total: Duration, tier: usize) -> Duration {
        let sum: f64 = self.ratios.iter().sum();
        match self.ratios.get(tier) {
            Some(r) if sum > 0.0 => total.mul_f64(r / sum),
            _ => Duration::ZERO,
        }
    }
}

/// Timing record for one tier, kept by [`BudgetTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierTiming {
    pub tier: TierId,
    pub allocated: Duration,
    pub elapsed: Duration,
    pub skipped: bool,
}

/// Per-request budget state: deadline, slack held back and tier timings.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    allocator: TimeoutBudgetAllocator,
    started: Instant,
    deadline: Instant,
    slack: Duration,
    timings: Vec<TierTiming>,
}

impl BudgetTracker {
    pub fn new(allocator: TimeoutBudgetAllocator, deadline: Instant) -> Self {
        Self {
            allocator,
            started: Instant::now(),
            deadline,
            slack: Duration::ZERO,
            timings: Vec::with_capacity(TierId::ALL.len()),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Remaining budget minus the slack reserved for response assembly.
    pub fn effective_remaining(&self) -> Duration {
        self.remaining().saturating_sub(self.slack)
    }

    pub fn slack(&self) -> Duration {
        self.slack
    }

    /// Timeout for the next attempt at `tier`.
    pub fn next_timeout(&self, tier: TierId) -> Result<Duration, BudgetExhausted> {
        self.allocator
            .allocate(self.effective_remaining(), tier.index())
    }

    /// Whether there is still enough budget for any tier to run.
    pub fn viable(&self) -> bool {
        self.effective_remaining() >= self.allocator.min_viable()
    }

    /// Account for `tier` being skipped: part of the slice it would have had
    /// rolls forward, the rest becomes slack.
    pub fn skip(&mut self, tier: TierId) {
        let slice = self
            .allocator
            .slice(self.effective_remaining(), tier.index());
        let held = slice.mul_f64(1.0 - self.allocator.carry_fraction());
        self.slack += held;
        self.timings.push(TierTiming {
            tier,
            allocated: Duration::ZERO,
            elapsed: Duration::ZERO,
            skipped: true,
        });
    }

    pub fn record(&mut self, tier: TierId, allocated: Duration, elapsed: Duration) {
        self.timings.push(TierTiming {
            tier,
            allocated,
            elapsed,
            skipped: false,
        });
    }

    pub fn timings(&self) -> &[TierTiming] {
        &self.timings
    }

    /// Sum of the recorded tier durations.
    pub fn spent(&self) -> Duration {
        self.timings.iter().map(|t| t.elapsed).sum()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
