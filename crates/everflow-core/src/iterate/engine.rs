//! The adaptive iteration loop.
//!
//! Attempts run strictly sequentially, one in flight at most. After each
//! failure the analyzer folds the error and history into a
//! `FailurePattern`, the selector picks a recovery strategy, and the
//! strategy rewrites the task spec for the next attempt. Safety ceilings
//! are checked before every attempt and win over any strategy.

use std::time::{Duration, Instant};

use thiserror::Error;

use everflow_types::event::EngineEvent;
use everflow_types::task::{IterateResult, IterationProgress, TaskSpec};
use everflow_types::workflow::WorkflowDefinition;

use crate::checkpoint::CheckpointStore;
use crate::event::EventBus;
use crate::graph::GraphError;
use crate::iterate::analyzer::FailureAnalyzer;
use crate::iterate::progress::ProgressTracker;
use crate::iterate::safety::{SafetyEvaluator, SafetyLimitExceeded, SafetyLimits};
use crate::iterate::strategy::StrategySelector;
use crate::runner::{RunnerError, WorkflowRunner};

/// The two failure classes that bypass adaptive handling.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A safety ceiling was breached mid-loop.
    #[error(transparent)]
    Safety(#[from] SafetyLimitExceeded),
    /// The definition failed graph validation; retrying cannot help.
    #[error(transparent)]
    Validation(#[from] GraphError),
}

/// Drives workflow attempts until success, exhaustion, or a safety stop.
pub struct IterationEngine<S> {
    runner: WorkflowRunner<S>,
    selector: StrategySelector,
    limits: SafetyLimits,
    events: EventBus,
}

impl<S: CheckpointStore> IterationEngine<S> {
    pub fn new(runner: WorkflowRunner<S>, selector: StrategySelector, limits: SafetyLimits) -> Self {
        let events = runner.events().clone();
        Self {
            runner,
            selector,
            limits,
            events,
        }
    }

    /// The underlying runner, for pause and cancel signalling.
    pub fn runner(&self) -> &WorkflowRunner<S> {
        &self.runner
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Run attempts until one succeeds or the loop gives up.
    ///
    /// Exhausting `max_iterations` is a normal outcome reported in the
    /// result, not an error. Only safety breaches and graph validation
    /// failures surface as `Err`.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        task: &TaskSpec,
    ) -> Result<IterateResult, EngineError> {
        let started = Instant::now();
        let evaluator = SafetyEvaluator::new(self.limits);
        let mut tracker = ProgressTracker::new();
        let mut current = task.clone();
        let mut total_cost = 0.0;
        let mut last_strategy: Option<String> = None;
        let mut success = false;

        for iteration in 1..=self.limits.max_iterations {
            if let Err(breach) = evaluator.check(iteration - 1, started.elapsed(), total_cost) {
                self.events.publish(EngineEvent::SafetyAbort {
                    workflow_id: definition.id,
                    reason: breach.to_string(),
                });
                tracing::warn!(workflow_id = %definition.id, %breach, "iteration loop aborted");
                return Err(EngineError::Safety(breach));
            }

            // Delays installed by strategies are honored once, then cleared.
            if let Some(cool_down) = current.cool_down_ms.take() {
                tracing::info!(
                    workflow_id = %definition.id,
                    cool_down_ms = cool_down,
                    "circuit cooling down"
                );
                tokio::time::sleep(Duration::from_millis(cool_down)).await;
            }
            if let Some(delay) = current.next_delay_ms.take() {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            self.events.publish(EngineEvent::IterationStarted {
                workflow_id: definition.id,
                iteration,
                strategy: last_strategy.clone(),
            });

            let attempt_started = Instant::now();
            match self.runner.run(definition, &current).await {
                Ok(result) => {
                    total_cost += result.cost;
                    let duration_ms = attempt_started.elapsed().as_millis() as u64;
                    success = result.success;
                    tracker.record(IterationProgress {
                        iteration,
                        strategy: last_strategy.take(),
                        success: result.success,
                        duration_ms,
                        error: None,
                    });
                    self.events.publish(EngineEvent::IterationFinished {
                        workflow_id: definition.id,
                        iteration,
                        success: result.success,
                        duration_ms,
                        success_rate: tracker.success_rate(),
                        eta_ms: 0,
                    });
                    // A paused attempt also lands here and ends the loop;
                    // resuming is the caller's decision, not a retry.
                    break;
                }
                Err(RunnerError::Graph(graph_error)) => {
                    return Err(EngineError::Validation(graph_error));
                }
                Err(error) => {
                    total_cost += error.cost();
                    let duration_ms = attempt_started.elapsed().as_millis() as u64;
                    tracker.record(IterationProgress {
                        iteration,
                        strategy: last_strategy.take(),
                        success: false,
                        duration_ms,
                        error: Some(error.to_string()),
                    });

                    if let Some((cost, limit)) = evaluator.cost_warning(total_cost) {
                        self.events.publish(EngineEvent::CostWarning {
                            workflow_id: definition.id,
                            cost,
                            limit,
                        });
                        tracing::warn!(
                            workflow_id = %definition.id,
                            cost,
                            limit,
                            "cost is nearing its ceiling"
                        );
                    }

                    let pattern = FailureAnalyzer::analyze(&error, &current, tracker.entries());
                    match self.selector.select(&pattern, &current) {
                        Some(strategy) => {
                            self.events.publish(EngineEvent::StrategySelected {
                                workflow_id: definition.id,
                                strategy: strategy.name().to_string(),
                                priority: strategy.priority(),
                                estimate: strategy.estimate_success(&pattern),
                            });
                            tracing::info!(
                                workflow_id = %definition.id,
                                strategy = strategy.name(),
                                kind = %pattern.kind,
                                consecutive = pattern.consecutive_failures,
                                "recovery strategy selected"
                            );
                            current = strategy.apply(&current, &pattern);
                            last_strategy = Some(strategy.name().to_string());
                        }
                        None => {
                            tracing::debug!(
                                workflow_id = %definition.id,
                                "no applicable strategy; next attempt runs unchanged"
                            );
                            last_strategy = None;
                        }
                    }
                    self.events.publish(EngineEvent::IterationFinished {
                        workflow_id: definition.id,
                        iteration,
                        success: false,
                        duration_ms,
                        success_rate: tracker.success_rate(),
                        eta_ms: tracker
                            .eta_ms(self.limits.max_iterations.saturating_sub(iteration)),
                    });
                }
            }
        }

        Ok(IterateResult {
            success,
            iterations: tracker.len() as u32,
            progress: tracker.into_entries(),
            total_duration_ms: started.elapsed().as_millis() as u64,
            total_cost,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;
    use tokio::sync::Notify;

    use everflow_types::error::ExecutionError;
    use everflow_types::failure::FailurePattern;
    use everflow_types::workflow::WorkflowStep;

    use crate::checkpoint::MemoryStore;
    use crate::context::ContextView;
    use crate::executor::{ExecutionOutput, ExecutorCapabilities, ExecutorRegistry, StepExecutor};
    use crate::iterate::strategy::{DEFAULT_PROVIDERS, RecoveryStrategy};
    use crate::router::StepRouter;

    /// Fails a fixed number of executions (or a scripted step id forever)
    /// before succeeding.
    struct EngineProbe {
        name: String,
        capabilities: ExecutorCapabilities,
        succeed_after: u32,
        fail_step: Option<String>,
        error: ExecutionError,
        runs: AtomicU32,
        delay_ms: u64,
        started: Option<Arc<Notify>>,
    }

    impl EngineProbe {
        fn new(error: ExecutionError) -> Self {
            Self {
                name: "probe".to_string(),
                capabilities: ExecutorCapabilities::new(&[], "iteration test probe"),
                succeed_after: 0,
                fail_step: None,
                error,
                runs: AtomicU32::new(0),
                delay_ms: 0,
                started: None,
            }
        }

        fn failing_forever(error: ExecutionError) -> Self {
            let mut probe = Self::new(error);
            probe.succeed_after = u32::MAX;
            probe
        }

        fn succeed_after(mut self, failures: u32) -> Self {
            self.succeed_after = failures;
            self
        }

        fn fail_step(mut self, step_id: &str) -> Self {
            self.fail_step = Some(step_id.to_string());
            self
        }

        fn delayed(mut self, delay_ms: u64) -> Self {
            self.delay_ms = delay_ms;
            self
        }

        fn notifying(mut self, started: Arc<Notify>) -> Self {
            self.started = Some(started);
            self
        }
    }

    impl StepExecutor for EngineProbe {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> &ExecutorCapabilities {
            &self.capabilities
        }

        async fn execute(
            &self,
            step: &WorkflowStep,
            _context: &ContextView,
        ) -> Result<ExecutionOutput, ExecutionError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(notify) = &self.started {
                notify.notify_one();
            }
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if let Some(fail_id) = &self.fail_step {
                if &step.id == fail_id {
                    return Err(self.error.clone());
                }
            } else if run < self.succeed_after {
                return Err(self.error.clone());
            }
            Ok(ExecutionOutput {
                output: json!({"step": step.id}),
                cost: 0.25,
            })
        }
    }

    fn definition(steps: serde_json::Value) -> WorkflowDefinition {
        serde_json::from_value(json!({ "name": "iterate-test", "steps": steps })).unwrap()
    }

    fn single_step() -> WorkflowDefinition {
        definition(json!([{ "id": "work", "name": "Work", "action": "do the work" }]))
    }

    fn engine_with(probe: EngineProbe, limits: SafetyLimits) -> IterationEngine<MemoryStore> {
        let mut registry = ExecutorRegistry::new();
        registry.register(probe);
        let executors: Vec<String> = registry.names().iter().map(|n| n.to_string()).collect();
        let providers: Vec<String> = DEFAULT_PROVIDERS.iter().map(|p| p.to_string()).collect();
        IterationEngine::new(
            WorkflowRunner::new(StepRouter::new(registry), MemoryStore::new()),
            StrategySelector::default_catalog(executors, providers),
            limits,
        )
    }

    fn quick_limits(max_iterations: u32) -> SafetyLimits {
        SafetyLimits {
            max_iterations,
            max_duration: Duration::from_secs(60),
            max_cost: 100.0,
        }
    }

    #[tokio::test]
    async fn first_success_short_circuits_the_loop() {
        let engine = engine_with(
            EngineProbe::new(ExecutionError::Unknown("unused".to_string())),
            quick_limits(5),
        );

        let result = engine
            .run(&single_step(), &TaskSpec::new("t"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.progress.len(), 1);
        assert!((result.total_cost - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let probe =
            EngineProbe::new(ExecutionError::Unknown("upstream glitch".to_string())).succeed_after(2);
        let engine = engine_with(probe, quick_limits(5));

        let result = engine
            .run(&single_step(), &TaskSpec::new("t"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.iterations, 3);
        assert!(!result.progress[0].success);
        assert!(!result.progress[1].success);
        assert!(result.progress[2].success);
        // Unknown execution errors read as api_error, so the provider
        // rotation was the strategy entering attempt two.
        assert_eq!(
            result.progress[1].strategy.as_deref(),
            Some("different-provider")
        );
    }

    #[tokio::test]
    async fn exhaustion_reports_at_the_iteration_ceiling() {
        let probe =
            EngineProbe::failing_forever(ExecutionError::RateLimited { retry_after_ms: None });
        let engine = engine_with(probe, quick_limits(4));
        let mut rx = engine.runner().events().subscribe();

        let result = engine
            .run(&single_step(), &TaskSpec::new("t"))
            .await
            .unwrap();

        // Running out of attempts is a report, not an error.
        assert!(!result.success);
        assert_eq!(result.iterations, 4);
        assert!(result.progress.iter().all(|p| !p.success));

        let mut selected = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::StrategySelected { strategy, .. } = event {
                selected.push(strategy);
            }
        }
        assert_eq!(
            selected,
            vec![
                "adaptive-parallelism",
                "adaptive-parallelism",
                "simplify-task",
                "hybrid-approach",
            ]
        );
    }

    #[test]
    fn five_rate_limits_escalate_to_hybrid() {
        let selector = StrategySelector::default_catalog(
            vec!["alpha".to_string()],
            vec!["openai".to_string(), "anthropic".to_string()],
        );
        let mut task = TaskSpec::new("bulk ingest");
        let mut tracker = ProgressTracker::new();
        let mut picked = Vec::new();

        for iteration in 1..=5 {
            let error = RunnerError::StepFailed {
                step_id: "work".to_string(),
                error: ExecutionError::RateLimited { retry_after_ms: None },
                cost: 0.0,
            };
            tracker.record(IterationProgress {
                iteration,
                strategy: None,
                success: false,
                duration_ms: 10,
                error: Some(error.to_string()),
            });
            let pattern: FailurePattern =
                FailureAnalyzer::analyze(&error, &task, tracker.entries());
            let strategy = selector.select(&pattern, &task).unwrap();
            picked.push(strategy.name().to_string());
            task = strategy.apply(&task, &pattern);
        }

        assert_eq!(
            picked,
            vec![
                "adaptive-parallelism",
                "adaptive-parallelism",
                "simplify-task",
                "hybrid-approach",
                "hybrid-approach",
            ]
        );
    }

    #[tokio::test]
    async fn cost_ceiling_aborts_with_a_single_warning() {
        // First step succeeds and bills; the second always fails, so every
        // attempt spends 0.25 without finishing.
        let probe = EngineProbe::new(ExecutionError::Unknown("broken".to_string()))
            .fail_step("bad");
        let limits = SafetyLimits {
            max_iterations: 10,
            max_duration: Duration::from_secs(60),
            max_cost: 0.4,
        };
        let engine = engine_with(probe, limits);
        let mut rx = engine.runner().events().subscribe();
        let def = definition(json!([
            { "id": "ok", "name": "Ok", "action": "prepare data" },
            { "id": "bad", "name": "Bad", "action": "publish data", "depends_on": ["ok"] },
        ]));

        let err = engine.run(&def, &TaskSpec::new("t")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Safety(SafetyLimitExceeded::CostLimit { .. })
        ));

        let mut warnings = 0;
        let mut aborts = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                EngineEvent::CostWarning { .. } => warnings += 1,
                EngineEvent::SafetyAbort { .. } => aborts += 1,
                _ => {}
            }
        }
        assert_eq!(warnings, 1);
        assert_eq!(aborts, 1);
    }

    #[tokio::test]
    async fn time_ceiling_aborts_between_attempts() {
        let probe =
            EngineProbe::failing_forever(ExecutionError::Unknown("slow".to_string())).delayed(20);
        let limits = SafetyLimits {
            max_iterations: 10,
            max_duration: Duration::from_millis(1),
            max_cost: 100.0,
        };
        let engine = engine_with(probe, limits);

        let err = engine
            .run(&single_step(), &TaskSpec::new("t"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Safety(SafetyLimitExceeded::TimeLimit { .. })
        ));
    }

    #[tokio::test]
    async fn graph_errors_bypass_adaptation() {
        let engine = engine_with(
            EngineProbe::new(ExecutionError::Unknown("unused".to_string())),
            quick_limits(5),
        );
        let def = definition(json!([
            { "id": "a", "name": "A", "action": "first", "depends_on": ["b"] },
            { "id": "b", "name": "B", "action": "second", "depends_on": ["a"] },
        ]));

        let err = engine.run(&def, &TaskSpec::new("t")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(GraphError::CycleDetected(_))
        ));
    }

    #[tokio::test]
    async fn installed_delays_are_slept_and_cleared() {
        struct InstallDelay;

        impl RecoveryStrategy for InstallDelay {
            fn name(&self) -> &'static str {
                "install-delay"
            }
            fn priority(&self) -> u8 {
                1
            }
            fn is_applicable(&self, _pattern: &FailurePattern, _task: &TaskSpec) -> bool {
                true
            }
            fn apply(&self, task: &TaskSpec, _pattern: &FailurePattern) -> TaskSpec {
                let mut next = task.clone();
                next.next_delay_ms = Some(30);
                next
            }
            fn estimate_success(&self, _pattern: &FailurePattern) -> f64 {
                0.5
            }
        }

        let mut registry = ExecutorRegistry::new();
        registry.register(EngineProbe::failing_forever(ExecutionError::Unknown(
            "boom".to_string(),
        )));
        let engine = IterationEngine::new(
            WorkflowRunner::new(StepRouter::new(registry), MemoryStore::new()),
            StrategySelector::new(vec![Box::new(InstallDelay)]),
            quick_limits(3),
        );

        let result = engine
            .run(&single_step(), &TaskSpec::new("t"))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.iterations, 3);
        assert_eq!(result.progress[1].strategy.as_deref(), Some("install-delay"));
        // Two inter-attempt delays of 30ms each were honored.
        assert!(result.total_duration_ms >= 60);
    }

    #[tokio::test]
    async fn paused_attempt_ends_the_loop_without_retrying() {
        let started = Arc::new(Notify::new());
        let probe = EngineProbe::new(ExecutionError::Unknown("unused".to_string()))
            .delayed(50)
            .notifying(Arc::clone(&started));
        let engine = Arc::new(engine_with(probe, quick_limits(5)));
        let def = definition(json!([
            { "id": "a", "name": "A", "action": "work a" },
            { "id": "b", "name": "B", "action": "work b", "depends_on": ["a"] },
        ]));

        let handle = {
            let engine = Arc::clone(&engine);
            let def = def.clone();
            tokio::spawn(async move { engine.run(&def, &TaskSpec::new("t")).await })
        };

        started.notified().await;
        assert!(engine.runner().pause(def.id));

        let result = handle.await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.iterations, 1);
        // A pause is not a failure: the single recorded attempt carries no
        // error and the loop stopped instead of adapting.
        assert!(result.progress[0].error.is_none());
    }
}
