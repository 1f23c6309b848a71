//! Checkpoint capture, validated restore, and the storage contract.
//!
//! A checkpoint is a self-contained snapshot of a `WorkflowContext`. The
//! engine defines its shape and validation rules; the storage medium is a
//! collaborator behind `CheckpointStore`. Restoring never guesses: an
//! unrecognized state name or an undecodable payload returns `None`
//! rather than a partially reconstructed context.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use everflow_types::error::StoreError;
use everflow_types::workflow::{Checkpoint, StepState, WorkflowState};

use crate::context::WorkflowContext;

// ---------------------------------------------------------------------------
// Capture & Restore
// ---------------------------------------------------------------------------

/// Serialize a context into a checkpoint record.
pub fn capture(context: &WorkflowContext) -> Result<Checkpoint, StoreError> {
    let variables = serde_json::to_value(&context.variables)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let steps = serde_json::to_value(&context.steps)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(Checkpoint {
        workflow_state: context.state.name().to_string(),
        workflow_id: context.workflow_id,
        workflow_name: context.workflow_name.clone(),
        current_step_index: context.current_step_index,
        variables,
        steps,
    })
}

/// Reconstruct a context from a checkpoint, re-validating everything.
///
/// Fails closed: an unknown workflow state name, an undecodable variables
/// or steps payload, or an out-of-range step index all return `None`.
/// History and timestamps are not part of the snapshot and come back empty.
pub fn restore(checkpoint: &Checkpoint) -> Option<WorkflowContext> {
    let state = WorkflowState::from_name(&checkpoint.workflow_state)?;

    let variables: HashMap<String, serde_json::Value> =
        serde_json::from_value(checkpoint.variables.clone()).ok()?;
    let steps: Vec<StepState> = serde_json::from_value(checkpoint.steps.clone()).ok()?;

    if checkpoint.current_step_index > steps.len() {
        return None;
    }

    Some(WorkflowContext {
        workflow_id: checkpoint.workflow_id,
        workflow_name: checkpoint.workflow_name.clone(),
        variables,
        steps,
        current_step_index: checkpoint.current_step_index,
        history: Vec::new(),
        state,
        error: None,
        started_at: None,
        paused_at: None,
        completed_at: None,
    })
}

// ---------------------------------------------------------------------------
// Storage Contract
// ---------------------------------------------------------------------------

/// External storage collaborator for checkpoints.
///
/// One checkpoint per workflow id; `save` overwrites. Implementations own
/// the medium (database, filesystem, memory); the engine only depends on
/// this contract.
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint, replacing any previous one for the workflow.
    fn save(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Fetch the checkpoint for a workflow, if one exists.
    fn load(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, StoreError>> + Send;
}

/// In-memory checkpoint store for tests and embedded use.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    checkpoints: Arc<DashMap<Uuid, Checkpoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

impl CheckpointStore for MemoryStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.checkpoints
            .insert(checkpoint.workflow_id, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &Uuid) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self
            .checkpoints
            .get(workflow_id)
            .map(|entry| entry.value().clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use everflow_types::workflow::{StepStatus, WorkflowDefinition};

    use crate::state::WorkflowEvent;

    fn executing_context() -> WorkflowContext {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "name": "cp-test",
            "steps": [
                { "id": "a", "name": "A", "action": "do a" },
                { "id": "b", "name": "B", "action": "do b", "depends_on": ["a"] },
            ]
        }))
        .unwrap();
        WorkflowContext::new(&definition)
            .apply(WorkflowEvent::Start)
            .and_then(|c| c.apply(WorkflowEvent::Parse))
            .and_then(|c| c.apply(WorkflowEvent::Validate))
            .unwrap()
    }

    #[test]
    fn round_trip_restores_equivalent_context() {
        let ctx = executing_context()
            .set_variable("branch", json!("main"))
            .step_completed("a", HashMap::from([("out".to_string(), json!(42))]))
            .unwrap();

        let checkpoint = capture(&ctx).unwrap();
        assert_eq!(checkpoint.workflow_state, "executing");
        assert_eq!(checkpoint.current_step_index, 1);

        let restored = restore(&checkpoint).unwrap();
        assert_eq!(restored.state, ctx.state);
        assert_eq!(restored.workflow_id, ctx.workflow_id);
        assert_eq!(restored.workflow_name, ctx.workflow_name);
        assert_eq!(restored.current_step_index, ctx.current_step_index);
        assert_eq!(restored.variables, ctx.variables);
        assert_eq!(restored.steps, ctx.steps);
        assert_eq!(restored.step("a").unwrap().status, StepStatus::Completed);
        assert_eq!(restored.step("a").unwrap().result["out"], json!(42));
    }

    #[test]
    fn unknown_state_name_fails_closed() {
        let ctx = executing_context();
        let mut checkpoint = capture(&ctx).unwrap();
        checkpoint.workflow_state = "transcending".to_string();
        assert!(restore(&checkpoint).is_none());
    }

    #[test]
    fn corrupt_steps_payload_fails_closed() {
        let ctx = executing_context();
        let mut checkpoint = capture(&ctx).unwrap();
        checkpoint.steps = json!({"not": "a list"});
        assert!(restore(&checkpoint).is_none());

        let mut checkpoint = capture(&ctx).unwrap();
        checkpoint.variables = json!(["not", "a", "map"]);
        assert!(restore(&checkpoint).is_none());
    }

    #[test]
    fn out_of_range_cursor_fails_closed() {
        let ctx = executing_context();
        let mut checkpoint = capture(&ctx).unwrap();
        checkpoint.current_step_index = 99;
        assert!(restore(&checkpoint).is_none());
    }

    #[tokio::test]
    async fn memory_store_saves_and_loads() {
        let store = MemoryStore::new();
        let ctx = executing_context();
        let checkpoint = capture(&ctx).unwrap();

        store.save(&checkpoint).await.unwrap();
        assert_eq!(store.len(), 1);

        let loaded = store.load(&ctx.workflow_id).await.unwrap().unwrap();
        assert_eq!(loaded.workflow_state, "executing");
        assert_eq!(loaded.workflow_name, "cp-test");

        let missing = store.load(&Uuid::now_v7()).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn memory_store_save_overwrites() {
        let store = MemoryStore::new();
        let ctx = executing_context();

        store.save(&capture(&ctx).unwrap()).await.unwrap();
        let paused = ctx.apply(WorkflowEvent::Pause).unwrap();
        store.save(&capture(&paused).unwrap()).await.unwrap();

        assert_eq!(store.len(), 1);
        let loaded = store.load(&ctx.workflow_id).await.unwrap().unwrap();
        assert_eq!(loaded.workflow_state, "paused");
    }
}
