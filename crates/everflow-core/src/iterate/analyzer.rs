//! Maps attempt failures onto the coarse classification the strategy
//! catalog keys on.

use everflow_types::error::ExecutionError;
use everflow_types::failure::{FailureKind, FailurePattern};
use everflow_types::task::{IterationProgress, TaskComplexity, TaskSpec};

use crate::runner::RunnerError;

/// Stateless classifier for attempt-level failures.
pub struct FailureAnalyzer;

impl FailureAnalyzer {
    /// The failure kind of one terminal attempt error.
    ///
    /// Malformed input only reads as a complexity problem when the task
    /// itself is high complexity or above; on simpler tasks it stays
    /// unclassified.
    pub fn classify(error: &RunnerError, complexity: TaskComplexity) -> FailureKind {
        match error {
            RunnerError::StepTimeout { .. } | RunnerError::AttemptTimeout { .. } => {
                FailureKind::Timeout
            }
            RunnerError::StepFailed { error, .. } => match error {
                ExecutionError::Timeout { .. } => FailureKind::Timeout,
                ExecutionError::RateLimited { .. } => FailureKind::RateLimit,
                ExecutionError::TransientNetwork(_) | ExecutionError::Unknown(_) => {
                    FailureKind::ApiError
                }
                ExecutionError::PermissionDenied(_) => FailureKind::Permission,
                ExecutionError::MalformedInput(_) => {
                    if complexity >= TaskComplexity::High {
                        FailureKind::Complexity
                    } else {
                        FailureKind::Unknown
                    }
                }
            },
            _ => FailureKind::Unknown,
        }
    }

    /// Fold the attempt history into the pattern for this decision point.
    ///
    /// `progress` must already contain the failed attempt being analyzed;
    /// the consecutive count is the trailing run of failures and the
    /// latency is the mean over every recorded attempt.
    pub fn analyze(
        error: &RunnerError,
        task: &TaskSpec,
        progress: &[IterationProgress],
    ) -> FailurePattern {
        let kind = Self::classify(error, task.complexity);
        let consecutive_failures = progress
            .iter()
            .rev()
            .take_while(|entry| !entry.success)
            .count()
            .max(1) as u32;
        let average_latency_ms = if progress.is_empty() {
            None
        } else {
            let total: u64 = progress.iter().map(|entry| entry.duration_ms).sum();
            Some(total / progress.len() as u64)
        };

        FailurePattern {
            kind,
            consecutive_failures,
            average_latency_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
