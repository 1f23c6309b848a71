//! Workflow runner: one full attempt from definition to result.
//!
//! The runner drives the formal state machine (`start`, `parse`,
//! `validate`, then execution), schedules steps wave by wave from the
//! dependency graph, and owns the single mutable `WorkflowContext`. Steps
//! within a wave run concurrently on a `JoinSet` bounded by a semaphore;
//! each spawned step sees only a read-only `ContextView`, and results flow
//! back to the coordinating loop, which applies them one at a time.
//!
//! Pause and cancel are cooperative: per-run `CancellationToken`s stop the
//! launch of further steps while in-flight steps are awaited. Checkpoints
//! are written after each wave, on pause, and at terminal states, which is
//! what makes `resume` possible.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use everflow_types::error::{ExecutionError, StoreError};
use everflow_types::event::EngineEvent;
use everflow_types::task::TaskSpec;
use everflow_types::workflow::{
    StepAttempt, StepResult, StepState, StepStatus, WorkflowDefinition, WorkflowResult,
    WorkflowState, WorkflowStep,
};

use crate::checkpoint::{CheckpointStore, capture, restore};
use crate::context::{ContextView, StateError, WorkflowContext};
use crate::event::EventBus;
use crate::graph::{GraphError, StepGraph};
use crate::retry::{effective_policy, run_with_retry};
use crate::router::{RouterError, StepRouter};
use crate::state::{TransitionRejected, WorkflowEvent};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Steps in flight per attempt when neither the task nor the definition
/// sets a limit.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Per-attempt step timeout when the step declares none.
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 300_000;

/// Wall-clock budget for a whole attempt when the definition declares none.
pub const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 1_800;

// ---------------------------------------------------------------------------
// RunnerError
// ---------------------------------------------------------------------------

/// Attempt-level failure surface of the runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The definition failed graph validation; nothing was executed.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// No executor could be selected for a step.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// A step exhausted its retries on a non-timeout error.
    #[error("step '{step_id}' failed: {error}")]
    StepFailed {
        step_id: String,
        #[source]
        error: ExecutionError,
        /// Cost spent by the attempt before it failed.
        cost: f64,
    },

    /// A step exhausted its retries, last attempt timing out.
    #[error("step '{step_id}' timed out after {timeout_ms}ms")]
    StepTimeout {
        step_id: String,
        timeout_ms: u64,
        cost: f64,
    },

    /// The whole attempt overran its wall-clock budget.
    #[error("workflow attempt timed out after {timeout_secs}s")]
    AttemptTimeout { timeout_secs: u64, cost: f64 },

    /// The attempt was cancelled; completed steps keep their results in
    /// the terminal checkpoint.
    #[error("workflow was cancelled")]
    Cancelled { cost: f64 },

    /// The checkpoint store rejected a save or load.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// `resume` found nothing to resume.
    #[error("no checkpoint stored for workflow {0}")]
    NoCheckpoint(Uuid),

    /// `resume` found a checkpoint that failed validation.
    #[error("checkpoint for workflow {0} failed validation")]
    CorruptCheckpoint(Uuid),

    /// `resume` found a checkpoint in a state that cannot continue.
    #[error("workflow {workflow_id} cannot resume from state '{state}'")]
    NotResumable { workflow_id: Uuid, state: String },

    /// Scheduling machinery failed (task join, closed semaphore).
    #[error("internal runner error: {0}")]
    Internal(String),

    /// A state-machine event was applied in an illegal state.
    #[error(transparent)]
    Transition(#[from] TransitionRejected),

    /// A context update violated the step-freeze invariant.
    #[error(transparent)]
    State(#[from] StateError),
}

impl RunnerError {
    /// Cost spent by the failed attempt, for loop-level accounting.
    pub fn cost(&self) -> f64 {
        match self {
            RunnerError::StepFailed { cost, .. }
            | RunnerError::StepTimeout { cost, .. }
            | RunnerError::AttemptTimeout { cost, .. }
            | RunnerError::Cancelled { cost } => *cost,
            _ => 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal scheduling types
// ---------------------------------------------------------------------------

/// Cooperative stop signals for one running attempt.
#[derive(Clone, Default)]
struct RunSignal {
    cancel: CancellationToken,
    pause: CancellationToken,
}

/// How the wave loop ended.
enum RunFlow {
    Completed,
    Failed { step_id: String, error: ExecutionError },
    Cancelled,
    Paused,
    TimedOut,
}

/// What one spawned step reports back to the coordinator.
struct StepOutcome {
    step_id: String,
    duration_ms: u64,
    attempts: Vec<StepAttempt>,
    result: Result<crate::executor::ExecutionOutput, ExecutionError>,
}

/// Bookkeeping accumulated across one attempt.
#[derive(Default)]
struct RunStats {
    cost: f64,
    step_durations: HashMap<String, u64>,
    step_attempts: HashMap<String, u32>,
    attempt_log: Vec<StepAttempt>,
    first_failure: Option<(String, ExecutionError)>,
}

/// An executor's output value as a step result map. Objects keep their
/// keys; anything else lands under `"output"`.
fn result_map(output: serde_json::Value) -> HashMap<String, serde_json::Value> {
    match output {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        other => HashMap::from([("output".to_string(), other)]),
    }
}

/// Failure surfaced from a restored checkpoint rather than this attempt.
/// Serialization flattened the original error to its message, so the
/// classification is gone.
fn restored_failure(step: &StepState) -> (String, ExecutionError) {
    let message = step
        .error
        .clone()
        .unwrap_or_else(|| "step failed before the checkpoint".to_string());
    (step.id.clone(), ExecutionError::Unknown(message))
}

// ---------------------------------------------------------------------------
// WorkflowRunner
// ---------------------------------------------------------------------------

/// Executes workflow attempts against a router and a checkpoint store.
pub struct WorkflowRunner<S> {
    router: Arc<StepRouter>,
    store: Arc<S>,
    events: EventBus,
    signals: Arc<DashMap<Uuid, RunSignal>>,
}

impl<S: CheckpointStore> WorkflowRunner<S> {
    /// A runner with a private event bus.
    pub fn new(router: StepRouter, store: S) -> Self {
        Self::with_events(router, store, EventBus::default())
    }

    /// A runner publishing on a shared event bus.
    pub fn with_events(router: StepRouter, store: S, events: EventBus) -> Self {
        Self {
            router: Arc::new(router),
            store: Arc::new(store),
            events,
            signals: Arc::new(DashMap::new()),
        }
    }

    /// The bus this runner publishes progress events on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The checkpoint store backing pause/resume.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Request cancellation of a running attempt. Steps not yet started
    /// are not launched; in-flight steps are awaited, not killed. Returns
    /// false when no attempt is live for the id.
    pub fn cancel(&self, workflow_id: Uuid) -> bool {
        match self.signals.get(&workflow_id) {
            Some(signal) => {
                signal.cancel.cancel();
                tracing::debug!(workflow_id = %workflow_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Request a pause of a running attempt. The runner finishes the
    /// in-flight wave, checkpoints, and returns with state `paused`.
    /// Returns false when no attempt is live for the id.
    pub fn pause(&self, workflow_id: Uuid) -> bool {
        match self.signals.get(&workflow_id) {
            Some(signal) => {
                signal.pause.cancel();
                tracing::debug!(workflow_id = %workflow_id, "pause requested");
                true
            }
            None => false,
        }
    }

    /// Run one full attempt of the workflow.
    ///
    /// A failed graph validation aborts before any executor call. A
    /// completed or paused attempt returns `Ok`; step failure, attempt
    /// timeout, and cancellation return the matching `RunnerError`.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        task: &TaskSpec,
    ) -> Result<WorkflowResult, RunnerError> {
        let started = Instant::now();
        let mut context = WorkflowContext::new(definition);
        context = context.apply(WorkflowEvent::Start)?;
        context = context.apply(WorkflowEvent::Parse)?;

        let graph = match StepGraph::build(&definition.steps) {
            Ok(graph) => graph,
            Err(graph_error) => {
                let failed = context.apply(WorkflowEvent::Fail(graph_error.to_string()))?;
                self.checkpoint_best_effort(&failed).await;
                self.events.publish(EngineEvent::WorkflowFailed {
                    workflow_id: failed.workflow_id,
                    error: graph_error.to_string(),
                });
                return Err(RunnerError::Graph(graph_error));
            }
        };

        context = context.apply(WorkflowEvent::Validate)?;
        // Confirmation that the machine reached `executing`.
        context = context.apply(WorkflowEvent::Execute)?;
        self.events.publish(EngineEvent::WorkflowStarted {
            workflow_id: context.workflow_id,
            workflow_name: context.workflow_name.clone(),
        });

        self.execute_attempt(definition, &graph, context, task, started)
            .await
    }

    /// Resume a paused (or crash-interrupted) workflow from its checkpoint.
    ///
    /// Restoration fails closed; completed steps are never re-executed, and
    /// execution continues from the first pending step.
    pub async fn resume(
        &self,
        definition: &WorkflowDefinition,
        task: &TaskSpec,
    ) -> Result<WorkflowResult, RunnerError> {
        let started = Instant::now();
        let checkpoint = self
            .store
            .load(&definition.id)
            .await?
            .ok_or(RunnerError::NoCheckpoint(definition.id))?;
        let mut context =
            restore(&checkpoint).ok_or(RunnerError::CorruptCheckpoint(definition.id))?;

        let graph = StepGraph::build(&definition.steps)?;

        context = match context.state {
            WorkflowState::Paused => {
                let resumed = context.apply(WorkflowEvent::Resume)?;
                self.events.publish(EngineEvent::WorkflowResumed {
                    workflow_id: resumed.workflow_id,
                });
                resumed
            }
            WorkflowState::Executing => {
                tracing::warn!(
                    workflow_id = %context.workflow_id,
                    "resuming from a mid-flight checkpoint"
                );
                context
            }
            other => {
                return Err(RunnerError::NotResumable {
                    workflow_id: context.workflow_id,
                    state: other.name().to_string(),
                });
            }
        };

        // A mid-flight snapshot can hold steps caught running; they never
        // finished, so they run again from pending.
        let interrupted: Vec<String> = context
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .map(|s| s.id.clone())
            .collect();
        for step_id in interrupted {
            context = context.update_step(&step_id, |step| {
                step.status = StepStatus::Pending;
                step.started_at = None;
            })?;
        }

        self.execute_attempt(definition, &graph, context, task, started)
            .await
    }

    // -----------------------------------------------------------------------
    // Attempt driving
    // -----------------------------------------------------------------------

    async fn execute_attempt(
        &self,
        definition: &WorkflowDefinition,
        graph: &StepGraph<'_>,
        mut context: WorkflowContext,
        task: &TaskSpec,
        started: Instant,
    ) -> Result<WorkflowResult, RunnerError> {
        let workflow_id = context.workflow_id;
        let timeout_secs = definition
            .timeout_secs
            .unwrap_or(DEFAULT_ATTEMPT_TIMEOUT_SECS);
        let mut stats = RunStats::default();

        let signal = RunSignal::default();
        self.signals.insert(workflow_id, signal.clone());
        let flow = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.wave_loop(definition, graph, &mut context, task, &signal, &mut stats),
        )
        .await
        {
            Ok(flow) => flow,
            Err(_elapsed) => Ok(RunFlow::TimedOut),
        };
        self.signals.remove(&workflow_id);
        let flow = flow?;

        let duration_ms = started.elapsed().as_millis() as u64;
        match flow {
            RunFlow::Completed => {
                context = context.apply(WorkflowEvent::Complete)?;
                self.save_checkpoint(&context).await?;
                self.events.publish(EngineEvent::WorkflowCompleted {
                    workflow_id,
                    duration_ms,
                });
                Ok(self.build_result(&context, &stats, duration_ms))
            }
            RunFlow::Paused => {
                context = context.apply(WorkflowEvent::Pause)?;
                self.save_checkpoint(&context).await?;
                self.events
                    .publish(EngineEvent::WorkflowPaused { workflow_id });
                Ok(self.build_result(&context, &stats, duration_ms))
            }
            RunFlow::Cancelled => {
                context = context.apply(WorkflowEvent::Cancel)?;
                self.checkpoint_best_effort(&context).await;
                self.events
                    .publish(EngineEvent::WorkflowCancelled { workflow_id });
                Err(RunnerError::Cancelled { cost: stats.cost })
            }
            RunFlow::Failed { step_id, error } => {
                context = context.apply(WorkflowEvent::Fail(error.to_string()))?;
                self.checkpoint_best_effort(&context).await;
                self.events.publish(EngineEvent::WorkflowFailed {
                    workflow_id,
                    error: error.to_string(),
                });
                Err(match error {
                    ExecutionError::Timeout { timeout_ms } => RunnerError::StepTimeout {
                        step_id,
                        timeout_ms,
                        cost: stats.cost,
                    },
                    other => RunnerError::StepFailed {
                        step_id,
                        error: other,
                        cost: stats.cost,
                    },
                })
            }
            RunFlow::TimedOut => {
                let error = format!("workflow attempt timed out after {timeout_secs}s");
                context = context.apply(WorkflowEvent::Fail(error.clone()))?;
                self.checkpoint_best_effort(&context).await;
                self.events
                    .publish(EngineEvent::WorkflowFailed { workflow_id, error });
                Err(RunnerError::AttemptTimeout {
                    timeout_secs,
                    cost: stats.cost,
                })
            }
        }
    }

    /// Launch ready steps round by round until every step is terminal or a
    /// stop condition wins.
    async fn wave_loop(
        &self,
        definition: &WorkflowDefinition,
        graph: &StepGraph<'_>,
        context: &mut WorkflowContext,
        task: &TaskSpec,
        signal: &RunSignal,
        stats: &mut RunStats,
    ) -> Result<RunFlow, RunnerError> {
        let workflow_id = context.workflow_id;
        let limit = task
            .concurrency
            .or(definition.concurrency)
            .unwrap_or(DEFAULT_CONCURRENCY)
            .max(1);

        loop {
            if signal.cancel.is_cancelled() {
                return Ok(RunFlow::Cancelled);
            }
            if signal.pause.is_cancelled() {
                return Ok(RunFlow::Paused);
            }

            self.propagate_skips(graph, context)?;

            if context.all_steps_terminal() {
                // A failure restored from a checkpoint is absent from this
                // attempt's stats; it still fails the workflow.
                return Ok(match stats.first_failure.take() {
                    Some((step_id, error)) => RunFlow::Failed { step_id, error },
                    None => match context.first_failed_step() {
                        Some(step) => {
                            let (step_id, error) = restored_failure(step);
                            RunFlow::Failed { step_id, error }
                        }
                        None => RunFlow::Completed,
                    },
                });
            }

            if definition.fail_fast {
                // Fresh failures end the loop at the bottom of their wave,
                // so a failed step seen here came out of the checkpoint.
                if let Some(step) = context.first_failed_step() {
                    let (step_id, error) = restored_failure(step);
                    return Ok(RunFlow::Failed { step_id, error });
                }
            }

            let done: HashSet<String> =
                context.terminal_step_ids().map(str::to_string).collect();
            let ready: Vec<WorkflowStep> =
                graph.ready_steps(&done).into_iter().cloned().collect();
            if ready.is_empty() {
                // Unreachable for a validated acyclic graph.
                return Err(RunnerError::Internal(
                    "scheduler stalled with non-terminal steps".to_string(),
                ));
            }
            tracing::debug!(
                workflow_id = %workflow_id,
                wave = ready.len(),
                limit,
                "launching wave"
            );

            let semaphore = Arc::new(Semaphore::new(limit));
            let mut join_set: JoinSet<Result<StepOutcome, RunnerError>> = JoinSet::new();
            for step in ready {
                if signal.cancel.is_cancelled() || signal.pause.is_cancelled() {
                    break;
                }
                let next = context.step_running(&step.id)?;
                *context = next;

                let view = ContextView::of(context, task);
                let router = Arc::clone(&self.router);
                let events = self.events.clone();
                let semaphore = Arc::clone(&semaphore);
                let executor_override = task.executor_override.clone();
                let policy = effective_policy(&step);
                let timeout_ms = step
                    .timeout_ms
                    .unwrap_or(DEFAULT_STEP_TIMEOUT_MS)
                    .max(task.timeout_ms.unwrap_or(0));

                join_set.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| RunnerError::Internal(format!("semaphore closed: {e}")))?;
                    let decision = router.route(&step, executor_override.as_deref())?;
                    events.publish(EngineEvent::StepStarted {
                        workflow_id,
                        step_id: step.id.clone(),
                        executor: decision.executor.name().to_string(),
                        tier: decision.tier.name().to_string(),
                        confidence: decision.confidence,
                    });

                    let started = Instant::now();
                    let outcome = run_with_retry(
                        &decision,
                        &step,
                        &view,
                        &policy,
                        timeout_ms,
                        workflow_id,
                        &events,
                    )
                    .await;
                    let duration_ms = started.elapsed().as_millis() as u64;

                    if outcome.result.is_ok() {
                        events.publish(EngineEvent::StepCompleted {
                            workflow_id,
                            step_id: step.id.clone(),
                            duration_ms,
                        });
                    }
                    Ok(StepOutcome {
                        step_id: step.id.clone(),
                        duration_ms,
                        attempts: outcome.attempts,
                        result: outcome.result,
                    })
                });
            }

            // Results are applied here, one at a time; the context has a
            // single owner.
            while let Some(joined) = join_set.join_next().await {
                let outcome = joined
                    .map_err(|e| RunnerError::Internal(format!("task join error: {e}")))??;
                stats
                    .step_durations
                    .insert(outcome.step_id.clone(), outcome.duration_ms);
                stats
                    .step_attempts
                    .insert(outcome.step_id.clone(), outcome.attempts.len() as u32);
                stats.attempt_log.extend(outcome.attempts);

                match outcome.result {
                    Ok(output) => {
                        stats.cost += output.cost;
                        let next =
                            context.step_completed(&outcome.step_id, result_map(output.output))?;
                        *context = next;
                    }
                    Err(error) => {
                        let next = context.step_failed(&outcome.step_id, error.to_string())?;
                        *context = next;
                        if stats.first_failure.is_none() {
                            stats.first_failure = Some((outcome.step_id, error));
                        }
                    }
                }
            }

            self.save_checkpoint(context).await?;

            if definition.fail_fast {
                if let Some((step_id, error)) = stats.first_failure.take() {
                    self.propagate_skips(graph, context)?;
                    return Ok(RunFlow::Failed { step_id, error });
                }
            }
        }
    }

    /// Mark every non-terminal step with a failed or skipped dependency as
    /// skipped. Walks in topological order, so one pass settles the whole
    /// cascade.
    fn propagate_skips(
        &self,
        graph: &StepGraph<'_>,
        context: &mut WorkflowContext,
    ) -> Result<(), RunnerError> {
        for step_id in graph.topo_order() {
            let Some(state) = context.step(step_id) else {
                continue;
            };
            if state.status.is_terminal() {
                continue;
            }
            let Some(node) = graph.node(step_id) else {
                continue;
            };
            let blocked = node.dependencies.iter().any(|dep| {
                matches!(
                    context.step(dep).map(|s| s.status),
                    Some(StepStatus::Failed | StepStatus::Skipped)
                )
            });
            if blocked {
                let next = context.step_skipped(step_id)?;
                *context = next;
                self.events.publish(EngineEvent::StepSkipped {
                    workflow_id: context.workflow_id,
                    step_id: step_id.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn save_checkpoint(&self, context: &WorkflowContext) -> Result<(), RunnerError> {
        let checkpoint = capture(context)?;
        self.store.save(&checkpoint).await?;
        self.events.publish(EngineEvent::CheckpointSaved {
            workflow_id: context.workflow_id,
            state: context.state.name().to_string(),
        });
        Ok(())
    }

    async fn checkpoint_best_effort(&self, context: &WorkflowContext) {
        if let Err(error) = self.save_checkpoint(context).await {
            tracing::warn!(
                workflow_id = %context.workflow_id,
                %error,
                "terminal checkpoint failed"
            );
        }
    }

    fn build_result(
        &self,
        context: &WorkflowContext,
        stats: &RunStats,
        duration_ms: u64,
    ) -> WorkflowResult {
        let step_results = context
            .steps
            .iter()
            .map(|s| StepResult {
                step_id: s.id.clone(),
                status: s.status,
                output: if s.result.is_empty() {
                    None
                } else {
                    Some(serde_json::Value::Object(
                        s.result.clone().into_iter().collect(),
                    ))
                },
                error: s.error.clone(),
                duration_ms: stats.step_durations.get(&s.id).copied().unwrap_or(0),
                attempts: stats.step_attempts.get(&s.id).copied().unwrap_or(0),
            })
            .collect();

        WorkflowResult {
            success: context.state == WorkflowState::Completed,
            state: context.state,
            step_results,
            attempts: stats.attempt_log.clone(),
            duration_ms,
            cost: stats.cost,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
