//! Task and iteration-loop types.
//!
//! A `TaskSpec` describes *how* the next workflow attempt should run; it is
//! the record recovery strategies rewrite between iterations. The iteration
//! engine reports its outcome as an `IterateResult` built from per-attempt
//! `IterationProgress` records.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Task Specification
// ---------------------------------------------------------------------------

/// Execution parameters for one workflow attempt.
///
/// Strategies never mutate a task in place; `apply` produces the modified
/// copy used for the next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// What the workflow is trying to accomplish.
    pub description: String,
    /// Perceived difficulty; `simplify-task` steps this down.
    #[serde(default)]
    pub complexity: TaskComplexity,
    /// Forces the router to a specific executor for every step
    /// (installed by `different-agent` / `hybrid-approach`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_override: Option<String>,
    /// Backend provider hint passed through to executors in the context
    /// view (rotated by `different-provider`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Steps in flight within the attempt (None = definition, then engine
    /// default; adjusted by `adaptive-parallelism`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Per-step timeout floor in milliseconds (raised by
    /// `gradual-relaxation`; never shrinks a step's own timeout).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Delay to sleep before the next attempt, installed by
    /// `exponential-backoff` and consumed once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_delay_ms: Option<u64>,
    /// Cool-down installed by `circuit-breaker`, consumed once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cool_down_ms: Option<u64>,
    /// Prefer smaller-chunk processing (set by `incremental-retry`;
    /// surfaced to executors through the context view).
    #[serde(default)]
    pub incremental: bool,
}

impl TaskSpec {
    /// A task with engine defaults and the given description.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            complexity: TaskComplexity::default(),
            executor_override: None,
            provider: None,
            concurrency: None,
            timeout_ms: None,
            next_delay_ms: None,
            cool_down_ms: None,
            incremental: false,
        }
    }
}

/// Ordered task difficulty. Variant order is the ordering.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Trivial,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskComplexity {
    /// One level easier, saturating at `Trivial`.
    pub fn step_down(&self) -> TaskComplexity {
        match self {
            TaskComplexity::Critical => TaskComplexity::High,
            TaskComplexity::High => TaskComplexity::Medium,
            TaskComplexity::Medium => TaskComplexity::Low,
            TaskComplexity::Low | TaskComplexity::Trivial => TaskComplexity::Trivial,
        }
    }
}

// ---------------------------------------------------------------------------
// Iteration Progress & Result
// ---------------------------------------------------------------------------

/// One attempt's entry in the iteration log. Observability only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationProgress {
    /// 1-based attempt index.
    pub iteration: u32,
    /// Strategy applied before this attempt (None on the first).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    /// Whether the attempt reached `completed`.
    pub success: bool,
    /// Wall-clock duration of the attempt, in milliseconds.
    pub duration_ms: u64,
    /// Terminal error of the attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate outcome of an adaptive iteration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterateResult {
    /// True when some attempt succeeded.
    pub success: bool,
    /// Attempts performed.
    pub iterations: u32,
    /// Per-attempt progress log.
    pub progress: Vec<IterationProgress>,
    /// Total wall-clock time across all attempts, in milliseconds.
    pub total_duration_ms: u64,
    /// Total cost accumulated across all attempts.
    pub total_cost: f64,
}

impl IterateResult {
    /// Fraction of attempts that succeeded, in [0, 1].
    pub fn success_rate(&self) -> f64 {
        if self.progress.is_empty() {
            return 0.0;
        }
        let successes = self.progress.iter().filter(|p| p.success).count();
        successes as f64 / self.progress.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
