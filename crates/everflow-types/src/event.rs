//! Progress events published by the engine.
//!
//! `EngineEvent` is the payload of the broadcast event bus. Events are
//! observability only: they are emitted best-effort and never gate engine
//! correctness. Consumers (CLI, dashboard, log observer) subscribe and
//! render; the engine never waits for them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything the engine announces while working.
///
/// Externally tagged as `{"type": "...", ...}` with snake_case names so
/// consumers can dispatch on the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A workflow attempt entered `executing`.
    WorkflowStarted {
        workflow_id: Uuid,
        workflow_name: String,
    },
    /// The attempt reached `completed`.
    WorkflowCompleted { workflow_id: Uuid, duration_ms: u64 },
    /// The attempt reached `failed`.
    WorkflowFailed { workflow_id: Uuid, error: String },
    /// The attempt was paused and checkpointed.
    WorkflowPaused { workflow_id: Uuid },
    /// A paused workflow resumed executing.
    WorkflowResumed { workflow_id: Uuid },
    /// The attempt was cancelled.
    WorkflowCancelled { workflow_id: Uuid },

    /// A step was routed and started executing.
    StepStarted {
        workflow_id: Uuid,
        step_id: String,
        executor: String,
        tier: String,
        confidence: f64,
    },
    /// A step finished successfully.
    StepCompleted {
        workflow_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },
    /// A step attempt failed.
    StepFailed {
        workflow_id: Uuid,
        step_id: String,
        error: String,
        will_retry: bool,
    },
    /// A step was skipped because an ancestor failed or was skipped.
    StepSkipped { workflow_id: Uuid, step_id: String },
    /// A retry was scheduled after a retryable failure.
    RetryScheduled {
        workflow_id: Uuid,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
    },

    /// A checkpoint was written to the store.
    CheckpointSaved { workflow_id: Uuid, state: String },

    /// An iteration attempt is starting.
    IterationStarted {
        workflow_id: Uuid,
        iteration: u32,
        /// Strategy applied before this attempt, if any.
        strategy: Option<String>,
    },
    /// An iteration attempt finished.
    IterationFinished {
        workflow_id: Uuid,
        iteration: u32,
        success: bool,
        duration_ms: u64,
        /// Running success rate across attempts so far.
        success_rate: f64,
        /// Projected time for the remaining iterations, in milliseconds.
        eta_ms: u64,
    },
    /// The strategy selector picked a recovery strategy.
    StrategySelected {
        workflow_id: Uuid,
        strategy: String,
        priority: u8,
        estimate: f64,
    },

    /// Cumulative cost crossed the warning threshold.
    CostWarning {
        workflow_id: Uuid,
        cost: f64,
        limit: f64,
    },
    /// A safety ceiling was breached and the loop aborted.
    SafetyAbort { workflow_id: Uuid, reason: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
