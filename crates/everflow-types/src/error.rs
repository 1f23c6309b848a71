//! Error types shared across Everflow crates.
//!
//! `ExecutionError` is the failure surface of the executor contract;
//! `StoreError` is the failure surface of the checkpoint storage
//! collaborator. Engine-internal errors live next to the code that raises
//! them in `everflow-core`.

use thiserror::Error;

/// Failure reported by a step executor, or imposed by the engine's per-step
/// timeout.
///
/// The retryable categories are `Timeout`, `RateLimited`, and
/// `TransientNetwork`; the engine retries those according to the step's
/// `RetryPolicy`. Every other category propagates after a single attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    /// The step did not finish within its time budget.
    #[error("step timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The executor's backend throttled the request.
    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    /// The executor is not allowed to perform the step's work.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A connection-level failure that is expected to clear on its own.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// The step's configuration or input could not be understood.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Anything the executor could not classify.
    #[error("executor error: {0}")]
    Unknown(String),
}

impl ExecutionError {
    /// True for the categories the engine may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionError::Timeout { .. }
                | ExecutionError::RateLimited { .. }
                | ExecutionError::TransientNetwork(_)
        )
    }

    /// Stable snake_case category name for logs and attempt records.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Timeout { .. } => "timeout",
            ExecutionError::RateLimited { .. } => "rate_limited",
            ExecutionError::PermissionDenied(_) => "permission_denied",
            ExecutionError::TransientNetwork(_) => "transient_network",
            ExecutionError::MalformedInput(_) => "malformed_input",
            ExecutionError::Unknown(_) => "unknown",
        }
    }
}

/// Error surface of the checkpoint storage collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing medium rejected the operation.
    #[error("checkpoint store backend error: {0}")]
    Backend(String),

    /// The checkpoint payload could not be encoded or decoded.
    #[error("checkpoint serialization error: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
