//! Execution context: the immutable value the state machine owns.
//!
//! A `WorkflowContext` is never mutated in place. Every operation returns a
//! new context value, which is what makes checkpointing and rollback safe:
//! the runner holds exactly one current context, spawned steps only ever
//! see a read-only `ContextView`, and all mutation is serialized through
//! the single owner applying `update_step`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use everflow_types::task::TaskSpec;
use everflow_types::workflow::{StepState, StepStatus, WorkflowDefinition, WorkflowState};

/// Misuse of the context's step-update operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    /// The step id names no step in this workflow.
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    /// The step already reached a terminal status for this attempt and is
    /// frozen.
    #[error("step '{step_id}' is frozen in status '{status}'")]
    StepFrozen { step_id: String, status: StepStatus },
}

// ---------------------------------------------------------------------------
// Workflow Context
// ---------------------------------------------------------------------------

/// Complete execution state of one workflow.
///
/// Fields are public for inspection and serialization; updates must go
/// through the copy-on-write operations below so the freeze and cursor
/// invariants hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// Workflow ID from the definition.
    pub workflow_id: Uuid,
    /// Workflow name from the definition.
    pub workflow_name: String,
    /// Workflow-scoped variables. Insertion order is irrelevant.
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    /// Per-step state, in definition order.
    pub steps: Vec<StepState>,
    /// Index of the first non-terminal step, or `steps.len()` when all are
    /// terminal. Resume starts here.
    pub current_step_index: usize,
    /// Past workflow states, oldest first.
    #[serde(default)]
    pub history: Vec<WorkflowState>,
    /// Current workflow state.
    pub state: WorkflowState,
    /// Error carried by a `fail` transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stamped by the `start` transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Stamped by `pause`, cleared by `resume`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    /// Stamped by any terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowContext {
    /// A fresh idle context with one pending `StepState` per step.
    pub fn new(definition: &WorkflowDefinition) -> Self {
        Self {
            workflow_id: definition.id,
            workflow_name: definition.name.clone(),
            variables: HashMap::new(),
            steps: definition
                .steps
                .iter()
                .map(|step| StepState::pending(&step.id))
                .collect(),
            current_step_index: 0,
            history: Vec::new(),
            state: WorkflowState::Idle,
            error: None,
            started_at: None,
            paused_at: None,
            completed_at: None,
        }
    }

    /// The state record for a step id.
    pub fn step(&self, step_id: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Apply `transform` to exactly one step, returning the new context.
    ///
    /// Pure with respect to `self`: the receiver is untouched. Rejects
    /// unknown ids and steps already terminal for this attempt.
    pub fn update_step(
        &self,
        step_id: &str,
        transform: impl FnOnce(&mut StepState),
    ) -> Result<WorkflowContext, StateError> {
        let position = self
            .steps
            .iter()
            .position(|s| s.id == step_id)
            .ok_or_else(|| StateError::UnknownStep(step_id.to_string()))?;

        let current = &self.steps[position];
        if current.status.is_terminal() {
            return Err(StateError::StepFrozen {
                step_id: current.id.clone(),
                status: current.status,
            });
        }

        let mut next = self.clone();
        transform(&mut next.steps[position]);
        next.recompute_cursor();
        Ok(next)
    }

    /// Mark a step running, stamping its start time.
    pub fn step_running(&self, step_id: &str) -> Result<WorkflowContext, StateError> {
        self.update_step(step_id, |step| {
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
        })
    }

    /// Mark a step completed with its result payload.
    pub fn step_completed(
        &self,
        step_id: &str,
        result: HashMap<String, serde_json::Value>,
    ) -> Result<WorkflowContext, StateError> {
        self.update_step(step_id, |step| {
            step.status = StepStatus::Completed;
            step.completed_at = Some(Utc::now());
            step.result = result;
        })
    }

    /// Mark a step failed with its terminal error.
    pub fn step_failed(
        &self,
        step_id: &str,
        error: impl Into<String>,
    ) -> Result<WorkflowContext, StateError> {
        let error = error.into();
        self.update_step(step_id, |step| {
            step.status = StepStatus::Failed;
            step.completed_at = Some(Utc::now());
            step.error = Some(error);
        })
    }

    /// Mark a step skipped because an ancestor failed or was skipped.
    pub fn step_skipped(&self, step_id: &str) -> Result<WorkflowContext, StateError> {
        self.update_step(step_id, |step| {
            step.status = StepStatus::Skipped;
            step.completed_at = Some(Utc::now());
        })
    }

    /// Set a workflow variable, returning the new context.
    pub fn set_variable(&self, key: impl Into<String>, value: serde_json::Value) -> WorkflowContext {
        let mut next = self.clone();
        next.variables.insert(key.into(), value);
        next
    }

    /// Ids of steps that are terminal for this attempt.
    pub fn terminal_step_ids(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .filter(|s| s.status.is_terminal())
            .map(|s| s.id.as_str())
    }

    /// True when every step is terminal.
    pub fn all_steps_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    /// True when any step failed.
    pub fn any_step_failed(&self) -> bool {
        self.first_failed_step().is_some()
    }

    /// The first failed step in definition order, if any. A restored
    /// checkpoint can carry one from before the snapshot.
    pub fn first_failed_step(&self) -> Option<&StepState> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    fn recompute_cursor(&mut self) {
        self.current_step_index = self
            .steps
            .iter()
            .position(|s| !s.status.is_terminal())
            .unwrap_or(self.steps.len());
    }
}

// ---------------------------------------------------------------------------
// Context View
// ---------------------------------------------------------------------------

/// Read-only projection of the context handed to executors.
///
/// Owned (`'static`) so it can cross task boundaries; a step never holds a
/// reference into the live context and cannot mutate it.
#[derive(Debug, Clone)]
pub struct ContextView {
    /// Workflow ID.
    pub workflow_id: Uuid,
    /// Workflow name.
    pub workflow_name: String,
    /// Snapshot of the workflow variables.
    pub variables: HashMap<String, serde_json::Value>,
    /// Result payloads of steps completed so far, keyed by step id.
    pub step_results: HashMap<String, HashMap<String, serde_json::Value>>,
    /// Backend provider hint from the current task.
    pub provider: Option<String>,
    /// Whether the current task prefers smaller-chunk processing.
    pub incremental: bool,
}

impl ContextView {
    /// Snapshot the completed portion of `context` under `task`'s hints.
    pub fn of(context: &WorkflowContext, task: &TaskSpec) -> Self {
        let step_results = context
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| (s.id.clone(), s.result.clone()))
            .collect();
        Self {
            workflow_id: context.workflow_id,
            workflow_name: context.workflow_name.clone(),
            variables: context.variables.clone(),
            step_results,
            provider: task.provider.clone(),
            incremental: task.incremental,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
