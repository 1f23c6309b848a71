//! Classified retry with bounded exponential backoff.
//!
//! Failures are split into retryable (timeout, rate limit, transient
//! network) and non-retryable categories. Retryable failures re-execute
//! under the step's `RetryPolicy` with exponentially growing delays;
//! non-retryable failures propagate after the first attempt. Every
//! executor invocation is recorded as a `StepAttempt`.

use std::time::{Duration, Instant};

use uuid::Uuid;

use everflow_types::error::ExecutionError;
use everflow_types::event::EngineEvent;
use everflow_types::workflow::{RetryPolicy, StepAttempt, WorkflowStep};

use crate::context::ContextView;
use crate::event::EventBus;
use crate::executor::ExecutionOutput;
use crate::router::RouteDecision;

// ---------------------------------------------------------------------------
// RetryPlanner
// ---------------------------------------------------------------------------

/// Stateless retry decisions.
///
/// No internal state; all logic is in associated functions that take the
/// policy and the failed attempt as parameters.
pub struct RetryPlanner;

impl RetryPlanner {
    /// Whether the step should be re-executed after a failed attempt.
    ///
    /// `attempt` is 1-based. With `max_retries = N`, attempts 1..=N may
    /// retry, so the step runs at most N+1 times. Non-retryable errors
    /// never retry regardless of the policy.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, error: &ExecutionError) -> bool {
        error.is_retryable() && attempt <= policy.max_retries
    }

    /// Backoff delay after failed attempt number `attempt` (1-based).
    ///
    /// The first retry waits `initial_delay_ms`; each further retry grows
    /// by `multiplier`, capped at `max_delay_ms`.
    pub fn delay_ms(policy: &RetryPolicy, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let raw = policy.initial_delay_ms as f64 * policy.multiplier.powi(exponent as i32);
        raw.min(policy.max_delay_ms as f64) as u64
    }
}

/// The policy governing a step: its own, or a zero-retry default.
pub fn effective_policy(step: &WorkflowStep) -> RetryPolicy {
    step.retry.unwrap_or(RetryPolicy {
        max_retries: 0,
        ..RetryPolicy::default()
    })
}

// ---------------------------------------------------------------------------
// Retry driver
// ---------------------------------------------------------------------------

/// Final result of a step plus the record of every attempt that ran.
pub struct RetryOutcome {
    pub result: Result<ExecutionOutput, ExecutionError>,
    pub attempts: Vec<StepAttempt>,
}

/// Execute a routed step, retrying per `policy`.
///
/// Each attempt runs under `timeout_ms`; an elapsed timeout is reported as
/// `ExecutionError::Timeout`, which is retryable. Publishes `StepFailed`
/// for every failed attempt and `RetryScheduled` before each backoff
/// sleep.
pub async fn run_with_retry(
    decision: &RouteDecision<'_>,
    step: &WorkflowStep,
    view: &ContextView,
    policy: &RetryPolicy,
    timeout_ms: u64,
    workflow_id: Uuid,
    events: &EventBus,
) -> RetryOutcome {
    let executor = decision.executor;
    let mut attempts = Vec::new();
    let mut attempt: u32 = 1;

    loop {
        let started = Instant::now();
        let result = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            executor.execute(step, view),
        )
        .await
        {
            Ok(inner) => inner,
            Err(_elapsed) => Err(ExecutionError::Timeout { timeout_ms }),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                attempts.push(record(step, decision, attempt, duration_ms, None));
                return RetryOutcome {
                    result: Ok(output),
                    attempts,
                };
            }
            Err(error) => {
                let will_retry = RetryPlanner::should_retry(policy, attempt, &error);
                tracing::debug!(
                    step_id = %step.id,
                    attempt,
                    error = %error,
                    kind = error.kind(),
                    will_retry,
                    "step attempt failed"
                );
                attempts.push(record(
                    step,
                    decision,
                    attempt,
                    duration_ms,
                    Some(error.to_string()),
                ));
                events.publish(EngineEvent::StepFailed {
                    workflow_id,
                    step_id: step.id.clone(),
                    error: error.to_string(),
                    will_retry,
                });

                if !will_retry {
                    return RetryOutcome {
                        result: Err(error),
                        attempts,
                    };
                }

                let delay_ms = RetryPlanner::delay_ms(policy, attempt);
                events.publish(EngineEvent::RetryScheduled {
                    workflow_id,
                    step_id: step.id.clone(),
                    attempt,
                    delay_ms,
                });
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
        }
    }
}

fn record(
    step: &WorkflowStep,
    decision: &RouteDecision<'_>,
    attempt: u32,
    duration_ms: u64,
    error: Option<String>,
) -> StepAttempt {
    StepAttempt {
        step_id: step.id.clone(),
        attempt,
        executor: decision.executor.name().to_string(),
        tier: decision.tier.name().to_string(),
        confidence: decision.confidence,
        duration_ms,
        error,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
