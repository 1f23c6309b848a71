//! The executor contract and registry.
//!
//! Executors are the external collaborators that perform a step's work.
//! The engine defines the trait, an object-safe boxed wrapper so
//! heterogeneous executors can share a registry, and the registry itself.
//! Registries are explicitly constructed and passed in; there is no global
//! executor state.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use everflow_types::error::ExecutionError;
use everflow_types::workflow::WorkflowStep;

use crate::context::ContextView;

// ---------------------------------------------------------------------------
// Capabilities & Output
// ---------------------------------------------------------------------------

/// What an executor advertises about itself.
///
/// `tags` are coarse capability names matched by tier-2 routing (e.g.
/// "testing", "build"); `description` is prose scored by tier-3 semantic
/// matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorCapabilities {
    /// Capability tags, lowercase.
    pub tags: Vec<String>,
    /// Prose description of what this executor is good at.
    pub description: String,
}

impl ExecutorCapabilities {
    pub fn new(tags: &[&str], description: impl Into<String>) -> Self {
        Self {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            description: description.into(),
        }
    }
}

/// Successful result of one executor call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Step output payload.
    pub output: serde_json::Value,
    /// Cost attributed to this call, in the embedder's unit. Executors
    /// that do not track cost leave it at zero.
    #[serde(default)]
    pub cost: f64,
}

impl ExecutionOutput {
    /// An output with no cost attached.
    pub fn json(output: serde_json::Value) -> Self {
        Self { output, cost: 0.0 }
    }
}

// ---------------------------------------------------------------------------
// StepExecutor trait
// ---------------------------------------------------------------------------

/// Trait for step executor backends.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition). The engine
/// measures duration and applies timeouts around `execute`; implementations
/// report failures through the `ExecutionError` taxonomy so retry
/// classification works.
pub trait StepExecutor: Send + Sync {
    /// Unique executor name (e.g. "builder", "deploy-bot").
    fn name(&self) -> &str;

    /// What this executor advertises for tier-2/tier-3 matching.
    fn capabilities(&self) -> &ExecutorCapabilities;

    /// Perform the step's work against a read-only context view.
    fn execute(
        &self,
        step: &WorkflowStep,
        context: &ContextView,
    ) -> impl Future<Output = Result<ExecutionOutput, ExecutionError>> + Send;
}

// ---------------------------------------------------------------------------
// Object-safe wrapper
// ---------------------------------------------------------------------------

/// Object-safe version of [`StepExecutor`] with boxed futures.
///
/// Exists solely to enable dynamic dispatch; a blanket implementation
/// covers every `StepExecutor`.
pub trait StepExecutorDyn: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &ExecutorCapabilities;

    fn execute_boxed<'a>(
        &'a self,
        step: &'a WorkflowStep,
        context: &'a ContextView,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionOutput, ExecutionError>> + Send + 'a>>;
}

impl<T: StepExecutor> StepExecutorDyn for T {
    fn name(&self) -> &str {
        StepExecutor::name(self)
    }

    fn capabilities(&self) -> &ExecutorCapabilities {
        StepExecutor::capabilities(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        step: &'a WorkflowStep,
        context: &'a ContextView,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionOutput, ExecutionError>> + Send + 'a>> {
        Box::pin(self.execute(step, context))
    }
}

/// Type-erased step executor for runtime selection.
///
/// `StepExecutor` uses RPITIT and cannot be a trait object directly;
/// `BoxStepExecutor` wraps any implementation behind [`StepExecutorDyn`]
/// and exposes the same surface.
pub struct BoxStepExecutor {
    inner: Box<dyn StepExecutorDyn + Send + Sync>,
}

impl BoxStepExecutor {
    /// Wrap a concrete executor in a type-erased box.
    pub fn new<T: StepExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    /// Unique executor name.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Advertised capabilities.
    pub fn capabilities(&self) -> &ExecutorCapabilities {
        self.inner.capabilities()
    }

    /// Perform the step's work.
    pub async fn execute(
        &self,
        step: &WorkflowStep,
        context: &ContextView,
    ) -> Result<ExecutionOutput, ExecutionError> {
        self.inner.execute_boxed(step, context).await
    }
}

// ---------------------------------------------------------------------------
// Executor Registry
// ---------------------------------------------------------------------------

/// Holds the executors available to the router.
///
/// Registration order is preserved and is the deterministic tie-break
/// order for semantic matching.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: Vec<BoxStepExecutor>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor. Re-registering a name replaces the executor
    /// in place, keeping its position.
    pub fn register(&mut self, executor: impl StepExecutor + 'static) {
        let boxed = BoxStepExecutor::new(executor);
        tracing::debug!(executor = boxed.name(), "registering step executor");
        if let Some(slot) = self.executors.iter_mut().find(|e| e.name() == boxed.name()) {
            *slot = boxed;
        } else {
            self.executors.push(boxed);
        }
    }

    /// Look up an executor by name.
    pub fn get(&self, name: &str) -> Option<&BoxStepExecutor> {
        self.executors.iter().find(|e| e.name() == name)
    }

    /// All executors, in registration order.
    pub fn executors(&self) -> &[BoxStepExecutor] {
        &self.executors
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.executors.iter().map(|e| e.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use everflow_types::task::TaskSpec;
    use everflow_types::workflow::WorkflowDefinition;

    use crate::context::WorkflowContext;

    struct EchoExecutor {
        name: String,
        capabilities: ExecutorCapabilities,
    }

    impl EchoExecutor {
        fn new(name: &str, tags: &[&str], description: &str) -> Self {
            Self {
                name: name.to_string(),
                capabilities: ExecutorCapabilities::new(tags, description),
            }
        }
    }

    impl StepExecutor for EchoExecutor {
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
            Ok(ExecutionOutput::json(json!({ "echo": step.id })))
        }
    }

    fn view() -> ContextView {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "name": "reg-test",
            "steps": [{ "id": "a", "name": "A", "action": "do a" }]
        }))
        .unwrap();
        ContextView::of(&WorkflowContext::new(&definition), &TaskSpec::new("test"))
    }

    fn step() -> WorkflowStep {
        serde_json::from_value(json!({ "id": "a", "name": "A", "action": "do a" })).unwrap()
    }

    #[test]
    fn register_and_get() {
        let mut registry = ExecutorRegistry::new();
        assert!(registry.is_empty());

        registry.register(EchoExecutor::new("alpha", &["testing"], "runs tests"));
        registry.register(EchoExecutor::new("beta", &["build"], "compiles code"));

        assert_eq!(registry.len(), 2);
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("gamma").is_none());
        assert_eq!(registry.names(), vec!["alpha", "beta"]);
    }

    #[test]
    fn reregistering_keeps_position() {
        let mut registry = ExecutorRegistry::new();
        registry.register(EchoExecutor::new("alpha", &["testing"], "runs tests"));
        registry.register(EchoExecutor::new("beta", &["build"], "compiles code"));
        registry.register(EchoExecutor::new("alpha", &["deploy"], "ships releases"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["alpha", "beta"]);
        assert_eq!(
            registry.get("alpha").unwrap().capabilities().tags,
            vec!["deploy"]
        );
    }

    #[tokio::test]
    async fn boxed_executor_delegates() {
        let boxed = BoxStepExecutor::new(EchoExecutor::new("alpha", &["testing"], "runs tests"));
        assert_eq!(boxed.name(), "alpha");

        let output = boxed.execute(&step(), &view()).await.unwrap();
        assert_eq!(output.output, json!({ "echo": "a" }));
        assert_eq!(output.cost, 0.0);
    }
}
