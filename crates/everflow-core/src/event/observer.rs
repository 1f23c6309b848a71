//! Logging observer that drains engine events into `tracing`.
//!
//! The observer is a plain subscriber: it holds one broadcast receiver and
//! turns each event into a structured log line. Embedders that want richer
//! rendering subscribe to the bus themselves instead of going through here.

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use everflow_types::event::EngineEvent;

use super::bus::EventBus;

/// Spawn a background task that logs every event published on `bus`.
///
/// The task exits once all senders are dropped. A lagged receiver skips
/// the missed events and keeps draining.
pub fn spawn_log_observer(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event observer lagged, skipping missed events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::WorkflowStarted {
            workflow_id,
            workflow_name,
        } => {
            info!(workflow_id = %workflow_id, workflow = %workflow_name, "workflow started");
        }
        EngineEvent::WorkflowCompleted {
            workflow_id,
            duration_ms,
        } => {
            info!(workflow_id = %workflow_id, duration_ms, "workflow completed");
        }
        EngineEvent::WorkflowFailed { workflow_id, error } => {
            warn!(workflow_id = %workflow_id, error = %error, "workflow failed");
        }
        EngineEvent::WorkflowPaused { workflow_id } => {
            info!(workflow_id = %workflow_id, "workflow paused");
        }
        EngineEvent::WorkflowResumed { workflow_id } => {
            info!(workflow_id = %workflow_id, "workflow resumed");
        }
        EngineEvent::WorkflowCancelled { workflow_id } => {
            info!(workflow_id = %workflow_id, "workflow cancelled");
        }
        EngineEvent::StepStarted {
            workflow_id,
            step_id,
            executor,
            tier,
            confidence,
        } => {
            debug!(
                workflow_id = %workflow_id,
                step_id = %step_id,
                executor = %executor,
                tier = %tier,
                confidence,
                "step started"
            );
        }
        EngineEvent::StepCompleted {
            workflow_id,
            step_id,
            duration_ms,
        } => {
            debug!(workflow_id = %workflow_id, step_id = %step_id, duration_ms, "step completed");
        }
        EngineEvent::StepFailed {
            workflow_id,
            step_id,
            error,
            will_retry,
        } => {
            warn!(
                workflow_id = %workflow_id,
                step_id = %step_id,
                error = %error,
                will_retry,
                "step failed"
            );
        }
        EngineEvent::StepSkipped {
            workflow_id,
            step_id,
        } => {
            debug!(workflow_id = %workflow_id, step_id = %step_id, "step skipped");
        }
        EngineEvent::RetryScheduled {
            workflow_id,
            step_id,
            attempt,
            delay_ms,
        } => {
            debug!(
                workflow_id = %workflow_id,
                step_id = %step_id,
                attempt,
                delay_ms,
                "retry scheduled"
            );
        }
        EngineEvent::CheckpointSaved { workflow_id, state } => {
            debug!(workflow_id = %workflow_id, state = %state, "checkpoint saved");
        }
        EngineEvent::IterationStarted {
            workflow_id,
            iteration,
            strategy,
        } => {
            info!(
                workflow_id = %workflow_id,
                iteration,
                strategy = strategy.as_deref().unwrap_or("none"),
                "iteration started"
            );
        }
        EngineEvent::IterationFinished {
            workflow_id,
            iteration,
            success,
            duration_ms,
            success_rate,
            eta_ms,
        } => {
            info!(
                workflow_id = %workflow_id,
                iteration,
                success,
                duration_ms,
                success_rate,
                eta_ms,
                "iteration finished"
            );
        }
        EngineEvent::StrategySelected {
            workflow_id,
            strategy,
            priority,
            estimate,
        } => {
            info!(
                workflow_id = %workflow_id,
                strategy = %strategy,
                priority,
                estimate,
                "recovery strategy selected"
            );
        }
        EngineEvent::CostWarning {
            workflow_id,
            cost,
            limit,
        } => {
            warn!(workflow_id = %workflow_id, cost, limit, "cost approaching limit");
        }
        EngineEvent::SafetyAbort {
            workflow_id,
            reason,
        } => {
            warn!(workflow_id = %workflow_id, reason = %reason, "safety limit breached");
        }
    }
}
