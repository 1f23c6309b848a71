//! The workflow state machine.
//!
//! A small, formally constrained transition table over `WorkflowContext`.
//! Transitions are copy-on-write: `apply` returns a new context and never
//! mutates its input, so an illegal event trivially leaves the caller's
//! context unchanged. Rejections are values, not panics; the caller decides
//! whether a rejection is fatal.

use chrono::Utc;
use thiserror::Error;

use everflow_types::workflow::WorkflowState;

use crate::context::WorkflowContext;

/// An event driving the workflow state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    /// idle -> parsing.
    Start,
    /// parsing -> validating.
    Parse,
    /// validating -> executing.
    Validate,
    /// No-op confirmation inside executing; marks progress, changes nothing.
    Execute,
    /// executing -> paused.
    Pause,
    /// paused -> executing.
    Resume,
    /// executing -> completed.
    Complete,
    /// Any non-terminal state -> cancelled.
    Cancel,
    /// Any non-terminal state -> failed, carrying the error into context.
    Fail(String),
}

impl WorkflowEvent {
    /// Stable name for logs and rejections.
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::Start => "start",
            WorkflowEvent::Parse => "parse",
            WorkflowEvent::Validate => "validate",
            WorkflowEvent::Execute => "execute",
            WorkflowEvent::Pause => "pause",
            WorkflowEvent::Resume => "resume",
            WorkflowEvent::Complete => "complete",
            WorkflowEvent::Cancel => "cancel",
            WorkflowEvent::Fail(_) => "fail",
        }
    }
}

/// The event is not legal in the current state. The context is unchanged.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("event '{event}' is not legal in state '{state}'")]
pub struct TransitionRejected {
    /// State the workflow was in when the event arrived.
    pub state: WorkflowState,
    /// Name of the rejected event.
    pub event: &'static str,
}

impl WorkflowContext {
    /// Apply a state-machine event, returning the resulting context.
    ///
    /// Successful transitions push the previous state onto `history` and
    /// stamp the relevant timestamp; the `execute` confirmation returns an
    /// identical context and records nothing.
    pub fn apply(&self, event: WorkflowEvent) -> Result<WorkflowContext, TransitionRejected> {
        use WorkflowEvent as E;
        use WorkflowState as S;

        let next_state = match (self.state, &event) {
            (S::Idle, E::Start) => S::Parsing,
            (S::Parsing, E::Parse) => S::Validating,
            (S::Validating, E::Validate) => S::Executing,
            (S::Executing, E::Execute) => return Ok(self.clone()),
            (S::Executing, E::Pause) => S::Paused,
            (S::Paused, E::Resume) => S::Executing,
            (S::Executing, E::Complete) => S::Completed,
            (state, E::Cancel) if !state.is_terminal() => S::Cancelled,
            (state, E::Fail(_)) if !state.is_terminal() => S::Failed,
            (state, event) => {
                tracing::debug!(
                    workflow_id = %self.workflow_id,
                    state = %state,
                    event = event.name(),
                    "transition rejected"
                );
                return Err(TransitionRejected {
                    state,
                    event: event.name(),
                });
            }
        };

        let mut next = self.clone();
        next.history.push(self.state);
        next.state = next_state;

        match &event {
            E::Start => next.started_at = Some(Utc::now()),
            E::Pause => next.paused_at = Some(Utc::now()),
            E::Resume => next.paused_at = None,
            E::Complete | E::Cancel => next.completed_at = Some(Utc::now()),
            E::Fail(error) => {
                next.completed_at = Some(Utc::now());
                next.error = Some(error.clone());
            }
            E::Parse | E::Validate | E::Execute => {}
        }

        tracing::debug!(
            workflow_id = %self.workflow_id,
            from = %self.state,
            to = %next.state,
            event = event.name(),
            "workflow transition"
        );
        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use everflow_types::workflow::WorkflowDefinition;

    fn context() -> WorkflowContext {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "name": "sm-test",
            "steps": [{ "id": "a", "name": "A", "action": "do a" }]
        }))
        .unwrap();
        WorkflowContext::new(&definition)
    }

    /// Drive a context through start, parse, validate.
    fn executing_context() -> WorkflowContext {
        context()
            .apply(WorkflowEvent::Start)
            .and_then(|c| c.apply(WorkflowEvent::Parse))
            .and_then(|c| c.apply(WorkflowEvent::Validate))
            .unwrap()
    }

    #[test]
    fn happy_path_reaches_completed() {
        let ctx = executing_context();
        assert_eq!(ctx.state, WorkflowState::Executing);
        assert!(ctx.started_at.is_some());

        let ctx = ctx.apply(WorkflowEvent::Execute).unwrap();
        assert_eq!(ctx.state, WorkflowState::Executing);

        let ctx = ctx.apply(WorkflowEvent::Complete).unwrap();
        assert_eq!(ctx.state, WorkflowState::Completed);
        assert!(ctx.state.is_terminal());
        assert!(ctx.completed_at.is_some());
        assert_eq!(
            ctx.history,
            vec![
                WorkflowState::Idle,
                WorkflowState::Parsing,
                WorkflowState::Validating,
                WorkflowState::Executing,
            ]
        );
    }

    #[test]
    fn illegal_event_is_rejected_without_mutation() {
        let ctx = context();
        let before = ctx.clone();

        let err = ctx.apply(WorkflowEvent::Complete).unwrap_err();
        assert_eq!(
            err,
            TransitionRejected {
                state: WorkflowState::Idle,
                event: "complete",
            }
        );
        assert_eq!(
            err.to_string(),
            "event 'complete' is not legal in state 'idle'"
        );
        // The input context is exactly what it was.
        assert_eq!(ctx, before);
    }

    #[test]
    fn execute_confirmation_changes_nothing() {
        let ctx = executing_context();
        let next = ctx.apply(WorkflowEvent::Execute).unwrap();
        assert_eq!(next, ctx);
    }

    #[test]
    fn pause_and_resume_round_trip() {
        let ctx = executing_context();
        let paused = ctx.apply(WorkflowEvent::Pause).unwrap();
        assert_eq!(paused.state, WorkflowState::Paused);
        assert!(paused.paused_at.is_some());

        let resumed = paused.apply(WorkflowEvent::Resume).unwrap();
        assert_eq!(resumed.state, WorkflowState::Executing);
        assert!(resumed.paused_at.is_none());
        assert_eq!(
            resumed.history.last(),
            Some(&WorkflowState::Paused)
        );
    }

    #[test]
    fn pause_outside_executing_is_rejected() {
        let ctx = context();
        assert!(ctx.apply(WorkflowEvent::Pause).is_err());

        let paused = executing_context().apply(WorkflowEvent::Pause).unwrap();
        assert!(paused.apply(WorkflowEvent::Pause).is_err());
    }

    #[test]
    fn cancel_is_legal_from_any_non_terminal_state() {
        let idle = context();
        assert_eq!(
            idle.apply(WorkflowEvent::Cancel).unwrap().state,
            WorkflowState::Cancelled
        );

        let executing = executing_context();
        assert_eq!(
            executing.apply(WorkflowEvent::Cancel).unwrap().state,
            WorkflowState::Cancelled
        );

        let paused = executing_context().apply(WorkflowEvent::Pause).unwrap();
        assert_eq!(
            paused.apply(WorkflowEvent::Cancel).unwrap().state,
            WorkflowState::Cancelled
        );
    }

    #[test]
    fn cancel_from_terminal_state_is_rejected() {
        let completed = executing_context().apply(WorkflowEvent::Complete).unwrap();
        let err = completed.apply(WorkflowEvent::Cancel).unwrap_err();
        assert_eq!(err.state, WorkflowState::Completed);
    }

    #[test]
    fn fail_carries_error_into_context() {
        let ctx = executing_context();
        let failed = ctx
            .apply(WorkflowEvent::Fail("step 'a' exploded".to_string()))
            .unwrap();
        assert_eq!(failed.state, WorkflowState::Failed);
        assert_eq!(failed.error.as_deref(), Some("step 'a' exploded"));
        assert!(failed.completed_at.is_some());
    }

    #[test]
    fn fail_from_terminal_state_is_rejected() {
        let cancelled = context().apply(WorkflowEvent::Cancel).unwrap();
        assert!(
            cancelled
                .apply(WorkflowEvent::Fail("late".to_string()))
                .is_err()
        );
    }

    #[test]
    fn start_only_legal_from_idle() {
        let executing = executing_context();
        let err = executing.apply(WorkflowEvent::Start).unwrap_err();
        assert_eq!(err.event, "start");
        assert_eq!(err.state, WorkflowState::Executing);
    }
}
