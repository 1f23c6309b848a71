//! Failure classification types for the adaptive iteration loop.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse classification of why a workflow attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RateLimit,
    ApiError,
    Permission,
    Complexity,
    Unknown,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::ApiError => "api_error",
            FailureKind::Permission => "permission",
            FailureKind::Complexity => "complexity",
            FailureKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// What the failure analyzer observed leading into an iteration decision.
///
/// Built fresh from the attempt history before each strategy selection;
/// never persisted across process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    /// Dominant failure classification of the most recent attempt.
    pub kind: FailureKind,
    /// Failed attempts in a row, including the most recent one.
    pub consecutive_failures: u32,
    /// Mean attempt latency in milliseconds, when history exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_latency_ms: Option<u64>,
}

impl FailurePattern {
    /// Pattern for a first failure of the given kind, with no latency data.
    pub fn first(kind: FailureKind) -> Self {
        Self {
            kind,
            consecutive_failures: 1,
            average_latency_ms: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
