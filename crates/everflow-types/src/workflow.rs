//! Workflow domain types for Everflow.
//!
//! Defines the canonical shape of a workflow: the definition an external
//! document parser produces (`WorkflowDefinition`, `WorkflowStep`), the
//! execution-tracking types the engine maintains (`WorkflowState`,
//! `StepState`), the persistable snapshot (`Checkpoint`), and the outcome
//! types returned to callers (`StepResult`, `WorkflowResult`).

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// Produced by an external document parser (YAML, API, SDK); the engine only
/// requires this shape and never reads files itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned when the document is first materialized.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Maximum steps in flight within one attempt (None = engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Abort the attempt on the first step failure (default true). When
    /// false, independent branches keep running and only dependents of the
    /// failed step are skipped.
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,
    /// Per-attempt timeout in seconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Ordered list of steps forming the workflow DAG.
    pub steps: Vec<WorkflowStep>,
}

fn default_fail_fast() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// User-defined step ID (e.g. "gather-news"). Unique within a workflow.
    pub id: String,
    /// Human-readable step name.
    pub name: String,
    /// Explicit executor target. When set and a live executor matches, the
    /// router selects it unconditionally (tier 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// What the step does, as a verb phrase (e.g. "run integration tests").
    /// Drives tier-2 keyword inference and tier-3 semantic matching.
    pub action: String,
    /// Opaque configuration payload handed to the executor.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, serde_json::Value>,
    /// Step IDs this step depends on (DAG edges).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Retry policy for this step (None = no retries).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Per-attempt timeout in milliseconds (None = engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Estimated duration in milliseconds, used for critical-path analysis
    /// (None = engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for retryable step failures.
///
/// `max_retries = N` permits N+1 attempts total. The delay before retry
/// attempt `n` (0-based) is `initial_delay_ms * multiplier^n`, capped at
/// `max_delay_ms`. Only retryable error categories consult this policy;
/// non-retryable failures propagate after the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds (default 500).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Backoff multiplier per attempt (default 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Delay ceiling in milliseconds (default 30_000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow & Step Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a workflow.
///
/// `Idle` is initial; `Completed`, `Failed`, and `Cancelled` are terminal.
/// Legal transitions are enforced by the engine's state machine; this enum
/// only names the states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    Parsing,
    Validating,
    Executing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    /// True for `Completed`, `Failed`, and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    /// The snake_case name used in checkpoints and events.
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowState::Idle => "idle",
            WorkflowState::Parsing => "parsing",
            WorkflowState::Validating => "validating",
            WorkflowState::Executing => "executing",
            WorkflowState::Paused => "paused",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        }
    }

    /// Fail-closed name lookup used when validating checkpoints. Returns
    /// `None` for anything that is not exactly a known state name.
    pub fn from_name(name: &str) -> Option<WorkflowState> {
        match name {
            "idle" => Some(WorkflowState::Idle),
            "parsing" => Some(WorkflowState::Parsing),
            "validating" => Some(WorkflowState::Validating),
            "executing" => Some(WorkflowState::Executing),
            "paused" => Some(WorkflowState::Paused),
            "completed" => Some(WorkflowState::Completed),
            "failed" => Some(WorkflowState::Failed),
            "cancelled" => Some(WorkflowState::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Status of an individual step within one workflow attempt.
///
/// `Completed`, `Failed`, and `Skipped` are terminal for the attempt; a
/// `StepState` is frozen once it reaches one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// True for `Completed`, `Failed`, and `Skipped`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Step State
// ---------------------------------------------------------------------------

/// Per-step execution record inside a `WorkflowContext`.
///
/// Created as `Pending` when the workflow starts. Mutated only through the
/// context's update-step operation; once the status is terminal for the
/// attempt the record is frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    /// Step ID matching `WorkflowStep.id`.
    pub id: String,
    /// Current status.
    pub status: StepStatus,
    /// When execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Error message if the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Result payload reported by the executor.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub result: HashMap<String, serde_json::Value>,
}

impl StepState {
    /// A fresh pending record for the given step ID.
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            result: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// A serialized snapshot of workflow execution state.
///
/// The workflow state is stored as its name string and re-validated on
/// restore; variables and steps are stored pre-serialized so a storage
/// collaborator can persist the record opaquely. Restoring a checkpoint
/// whose state name is unrecognized fails closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Workflow state name (e.g. "executing").
    pub workflow_state: String,
    /// Workflow ID the snapshot belongs to.
    pub workflow_id: Uuid,
    /// Workflow name (denormalized for display).
    pub workflow_name: String,
    /// Index of the first non-terminal step at capture time.
    pub current_step_index: usize,
    /// Serialized context variables.
    pub variables: serde_json::Value,
    /// Serialized step states.
    pub steps: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Record of a single execution attempt of a step.
///
/// One entry per executor invocation, including retries, so a step with
/// `max_retries = 2` that keeps failing produces three records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    /// Step ID matching `WorkflowStep.id`.
    pub step_id: String,
    /// Attempt number, 1-based.
    pub attempt: u32,
    /// Executor that ran the attempt.
    pub executor: String,
    /// Routing tier name ("explicit", "type_inferred", "semantic").
    pub tier: String,
    /// Routing confidence in [0, 1].
    pub confidence: f64,
    /// Wall-clock duration of the attempt, in milliseconds.
    pub duration_ms: u64,
    /// Error message when the attempt failed; `None` on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepAttempt {
    /// True when the attempt produced an output.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Final outcome of one step within a workflow attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step ID matching `WorkflowStep.id`.
    pub step_id: String,
    /// Terminal status for the attempt.
    pub status: StepStatus,
    /// Output value reported by the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error message if the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration across all attempts, in milliseconds.
    pub duration_ms: u64,
    /// Execution attempts used (1-based).
    pub attempts: u32,
}

/// Outcome of one full workflow attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// True when the workflow reached `completed`.
    pub success: bool,
    /// Terminal (or paused) workflow state.
    pub state: WorkflowState,
    /// Per-step outcomes in definition order.
    pub step_results: Vec<StepResult>,
    /// Every execution attempt in the order it finished.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<StepAttempt>,
    /// Wall-clock duration of the attempt, in milliseconds.
    pub duration_ms: u64,
    /// Cumulative cost reported by executors.
    pub cost: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Build a small diamond-shaped definition: fetch -> {build, lint} -> report.
    fn sample_workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "nightly-build".to_string(),
            description: Some("Fetch, build, lint, report".to_string()),
            concurrency: Some(2),
            fail_fast: true,
            timeout_secs: Some(600),
            steps: vec![
                WorkflowStep {
                    id: "fetch".to_string(),
                    name: "Fetch Sources".to_string(),
                    target: None,
                    action: "fetch the latest sources".to_string(),
                    config: HashMap::new(),
                    depends_on: vec![],
                    retry: Some(RetryPolicy::default()),
                    timeout_ms: Some(30_000),
                    estimated_duration_ms: Some(2_000),
                },
                WorkflowStep {
                    id: "build".to_string(),
                    name: "Build".to_string(),
                    target: Some("builder".to_string()),
                    action: "compile the project".to_string(),
                    config: HashMap::from([("profile".to_string(), json!("release"))]),
                    depends_on: vec!["fetch".to_string()],
                    retry: None,
                    timeout_ms: None,
                    estimated_duration_ms: Some(10_000),
                },
                WorkflowStep {
                    id: "lint".to_string(),
                    name: "Lint".to_string(),
                    target: None,
                    action: "run lint analysis".to_string(),
                    config: HashMap::new(),
                    depends_on: vec!["fetch".to_string()],
                    retry: None,
                    timeout_ms: None,
                    estimated_duration_ms: None,
                },
                WorkflowStep {
                    id: "report".to_string(),
                    name: "Report".to_string(),
                    target: None,
                    action: "summarize build and lint results".to_string(),
                    config: HashMap::new(),
                    depends_on: vec!["build".to_string(), "lint".to_string()],
                    retry: None,
                    timeout_ms: None,
                    estimated_duration_ms: Some(1_000),
                },
            ],
        }
    }

    #[test]
    fn definition_json_round_trip() {
        let def = sample_workflow();
        let encoded = serde_json::to_string(&def).unwrap();
        let decoded: WorkflowDefinition = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.id, def.id);
        assert_eq!(decoded.name, "nightly-build");
        assert_eq!(decoded.steps.len(), 4);
        assert_eq!(decoded.steps[1].target.as_deref(), Some("builder"));
        assert_eq!(decoded.steps[3].depends_on, vec!["build", "lint"]);
    }

    #[test]
    fn definition_parses_from_yaml_document() {
        let yaml = r#"
name: deploy-service
steps:
  - id: test
    name: Run Tests
    action: run the unit test suite
  - id: deploy
    name: Deploy
    target: deployer
    action: deploy to staging
    depends_on: [test]
    retry:
      max_retries: 2
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();

        // Omitted fields take their serde defaults.
        assert!(def.fail_fast);
        assert!(def.concurrency.is_none());
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[1].target.as_deref(), Some("deployer"));

        let retry = def.steps[1].retry.unwrap();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.initial_delay_ms, 500);
        assert_eq!(retry.multiplier, 2.0);
        assert_eq!(retry.max_delay_ms, 30_000);
    }

    #[test]
    fn retry_policy_defaults() {
        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay_ms, 500);
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_delay_ms, 30_000);
    }

    #[test]
    fn workflow_state_terminality() {
        assert!(!WorkflowState::Idle.is_terminal());
        assert!(!WorkflowState::Executing.is_terminal());
        assert!(!WorkflowState::Paused.is_terminal());
        assert!(WorkflowState::Completed.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(WorkflowState::Cancelled.is_terminal());
    }

    #[test]
    fn workflow_state_name_round_trip() {
        let all = [
            WorkflowState::Idle,
            WorkflowState::Parsing,
            WorkflowState::Validating,
            WorkflowState::Executing,
            WorkflowState::Paused,
            WorkflowState::Completed,
            WorkflowState::Failed,
            WorkflowState::Cancelled,
        ];
        for state in all {
            assert_eq!(WorkflowState::from_name(state.name()), Some(state));
        }
    }

    #[test]
    fn workflow_state_unknown_name_fails_closed() {
        assert_eq!(WorkflowState::from_name("exploded"), None);
        assert_eq!(WorkflowState::from_name(""), None);
        assert_eq!(WorkflowState::from_name("Completed"), None);
    }

    #[test]
    fn step_status_terminality() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
    }

    #[test]
    fn step_state_starts_pending_and_empty() {
        let state = StepState::pending("fetch");
        assert_eq!(state.id, "fetch");
        assert_eq!(state.status, StepStatus::Pending);
        assert!(state.started_at.is_none());
        assert!(state.error.is_none());
        assert!(state.result.is_empty());
    }

    #[test]
    fn step_attempt_records_routing_metadata() {
        let attempt = StepAttempt {
            step_id: "deploy".to_string(),
            attempt: 2,
            executor: "deployer".to_string(),
            tier: "explicit".to_string(),
            confidence: 0.9,
            duration_ms: 1_200,
            error: Some("rate limited".to_string()),
        };
        assert!(!attempt.succeeded());

        let encoded = serde_json::to_value(&attempt).unwrap();
        assert_eq!(encoded["tier"], "explicit");
        assert_eq!(encoded["attempt"], 2);
        assert_eq!(encoded["error"], "rate limited");
    }

    #[test]
    fn checkpoint_serializes_state_as_name() {
        let checkpoint = Checkpoint {
            workflow_state: WorkflowState::Executing.name().to_string(),
            workflow_id: Uuid::now_v7(),
            workflow_name: "nightly-build".to_string(),
            current_step_index: 2,
            variables: json!({"branch": "main"}),
            steps: json!([]),
        };
        let encoded = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(encoded["workflow_state"], "executing");
        assert_eq!(encoded["current_step_index"], 2);
    }
}
