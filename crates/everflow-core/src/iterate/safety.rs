//! Hard ceilings for the iteration loop.
//!
//! The evaluator is consulted before every attempt and wins over any
//! strategy estimate: once a ceiling is breached the loop stops, full
//! stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fraction of `max_cost` at which the one-shot warning fires.
pub const COST_WARNING_RATIO: f64 = 0.8;

/// Ceilings one iteration loop must stay under.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Attempts the loop may make, exhausted normally.
    pub max_iterations: u32,
    /// Wall-clock budget across all attempts and delays.
    pub max_duration: Duration,
    /// Spend budget across all attempts.
    pub max_cost: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_duration: Duration::from_secs(3_600),
            max_cost: 10.0,
        }
    }
}

/// A breached ceiling, carrying the limit and what was observed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SafetyLimitExceeded {
    #[error("iteration limit reached: {observed} of {limit}")]
    IterationLimit { limit: u32, observed: u32 },
    #[error("time limit exceeded: {observed_ms}ms of {limit_ms}ms")]
    TimeLimit { limit_ms: u64, observed_ms: u64 },
    #[error("cost limit exceeded: {observed:.2} of {limit:.2}")]
    CostLimit { limit: f64, observed: f64 },
}

/// Checks observations against the limits and owns the one-shot cost
/// warning latch.
#[derive(Debug)]
pub struct SafetyEvaluator {
    limits: SafetyLimits,
    cost_warned: AtomicBool,
}

impl SafetyEvaluator {
    pub fn new(limits: SafetyLimits) -> Self {
        Self {
            limits,
            cost_warned: AtomicBool::new(false),
        }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Err the instant any ceiling is breached. `iterations` counts
    /// attempts already made.
    pub fn check(
        &self,
        iterations: u32,
        elapsed: Duration,
        cost: f64,
    ) -> Result<(), SafetyLimitExceeded> {
        if iterations >= self.limits.max_iterations {
            return Err(SafetyLimitExceeded::IterationLimit {
                limit: self.limits.max_iterations,
                observed: iterations,
            });
        }
        if elapsed > self.limits.max_duration {
            return Err(SafetyLimitExceeded::TimeLimit {
                limit_ms: self.limits.max_duration.as_millis() as u64,
                observed_ms: elapsed.as_millis() as u64,
            });
        }
        if cost > self.limits.max_cost {
            return Err(SafetyLimitExceeded::CostLimit {
                limit: self.limits.max_cost,
                observed: cost,
            });
        }
        Ok(())
    }

    /// Some exactly once, the first time spend crosses the warning ratio.
    /// Returns the observed cost and the ceiling.
    pub fn cost_warning(&self, cost: f64) -> Option<(f64, f64)> {
        if cost >= self.limits.max_cost * COST_WARNING_RATIO
            && !self.cost_warned.swap(true, Ordering::Relaxed)
        {
            return Some((cost, self.limits.max_cost));
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
