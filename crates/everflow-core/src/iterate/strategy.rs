//! Recovery strategy catalog.
//!
//! Each strategy inspects the current `FailurePattern` and, when it
//! applies, rewrites the `TaskSpec` for the next attempt. The selector
//! picks the highest-priority applicable strategy; the success estimate
//! only breaks ties between equal priorities and carries no statistical
//! meaning.

use std::sync::atomic::{AtomicUsize, Ordering};

use everflow_types::failure::{FailureKind, FailurePattern};
use everflow_types::task::{TaskComplexity, TaskSpec};

use crate::runner::{DEFAULT_CONCURRENCY, DEFAULT_STEP_TIMEOUT_MS};

// ---------------------------------------------------------------------------
// Tuning constants
// ---------------------------------------------------------------------------

/// Base delay installed by the backoff strategies, in milliseconds.
pub const BACKOFF_INITIAL_MS: u64 = 1_000;

/// Growth factor per consecutive failure.
pub const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Ceiling for any installed inter-attempt delay, in milliseconds.
pub const BACKOFF_CAP_MS: u64 = 60_000;

/// Mean attempt latency above which parallelism is considered starved.
pub const HIGH_LATENCY_THRESHOLD_MS: u64 = 10_000;

/// Ceiling for concurrency raises.
pub const MAX_CONCURRENCY: usize = 16;

/// Timeout growth factor for gradual relaxation.
pub const RELAXATION_FACTOR: f64 = 1.5;

/// Ceiling for relaxed step timeouts, in milliseconds.
pub const TIMEOUT_CAP_MS: u64 = 600_000;

/// Description length a simplified task is cut down to, in characters.
pub const SIMPLIFIED_DESCRIPTION_CHARS: usize = 200;

/// Pause installed by the circuit breaker, in milliseconds.
pub const CIRCUIT_COOL_DOWN_MS: u64 = 60_000;

/// Providers the rotation strategies cycle through when the caller does
/// not supply a list.
pub const DEFAULT_PROVIDERS: &[&str] = &["openai", "anthropic", "google"];

/// `initial * multiplier^consecutive`, capped.
pub fn backoff_delay_ms(consecutive_failures: u32) -> u64 {
    let raw = BACKOFF_INITIAL_MS as f64 * BACKOFF_MULTIPLIER.powi(consecutive_failures as i32);
    raw.min(BACKOFF_CAP_MS as f64) as u64
}

// ---------------------------------------------------------------------------
// RecoveryStrategy
// ---------------------------------------------------------------------------

/// One recovery tactic the iteration loop can apply between attempts.
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Higher wins among applicable strategies.
    fn priority(&self) -> u8;

    fn is_applicable(&self, pattern: &FailurePattern, task: &TaskSpec) -> bool;

    /// The task spec for the next attempt.
    fn apply(&self, task: &TaskSpec, pattern: &FailurePattern) -> TaskSpec;

    /// Tie-break between equal priorities only.
    fn estimate_success(&self, pattern: &FailurePattern) -> f64;
}

/// Estimates decay as failures stack up, staying above a small floor.
fn fade(base: f64, pattern: &FailurePattern) -> f64 {
    (base - 0.05 * pattern.consecutive_failures.saturating_sub(1) as f64).max(0.05)
}

fn simplified_description(description: &str) -> String {
    if description.chars().count() > SIMPLIFIED_DESCRIPTION_CHARS {
        description.chars().take(SIMPLIFIED_DESCRIPTION_CHARS).collect()
    } else {
        description.to_string()
    }
}

/// Round-robin name rotation shared by the executor and provider switching
/// strategies. The cursor advances on every pick and is internal state, so
/// rotation order is stable per strategy instance, not per task.
struct Rotation {
    names: Vec<String>,
    cursor: AtomicUsize,
}

impl Rotation {
    fn new(names: Vec<String>) -> Self {
        Self {
            names,
            cursor: AtomicUsize::new(0),
        }
    }

    fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Next name in rotation, skipping `avoid` when an alternative exists.
    fn next(&self, avoid: Option<&str>) -> Option<String> {
        for _ in 0..self.names.len() {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.names.len();
            let candidate = &self.names[idx];
            if avoid != Some(candidate.as_str()) {
                return Some(candidate.clone());
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// The catalog
// ---------------------------------------------------------------------------

/// Try again unchanged. Only worth it on a first, unclassified failure.
pub struct SimpleRetry;

impl RecoveryStrategy for SimpleRetry {
    fn name(&self) -> &'static str {
        "simple-retry"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn is_applicable(&self, pattern: &FailurePattern, _task: &TaskSpec) -> bool {
        pattern.consecutive_failures == 1 && pattern.kind == FailureKind::Unknown
    }

    fn apply(&self, task: &TaskSpec, _pattern: &FailurePattern) -> TaskSpec {
        task.clone()
    }

    fn estimate_success(&self, pattern: &FailurePattern) -> f64 {
        fade(0.6, pattern)
    }
}

/// Wait longer between attempts when the service is slow or throttling.
pub struct ExponentialBackoff;

impl RecoveryStrategy for ExponentialBackoff {
    fn name(&self) -> &'static str {
        "exponential-backoff"
    }

    fn priority(&self) -> u8 {
        2
    }

    fn is_applicable(&self, pattern: &FailurePattern, _task: &TaskSpec) -> bool {
        matches!(pattern.kind, FailureKind::Timeout | FailureKind::RateLimit)
    }

    fn apply(&self, task: &TaskSpec, pattern: &FailurePattern) -> TaskSpec {
        let mut next = task.clone();
        next.next_delay_ms = Some(backoff_delay_ms(pattern.consecutive_failures));
        next
    }

    fn estimate_success(&self, pattern: &FailurePattern) -> f64 {
        fade(0.55, pattern)
    }
}

/// Permission problems follow the executor, so hand the work to the next
/// registered one.
pub struct DifferentAgent {
    agents: Rotation,
}

impl DifferentAgent {
    pub fn new(agents: Vec<String>) -> Self {
        Self {
            agents: Rotation::new(agents),
        }
    }
}

impl RecoveryStrategy for DifferentAgent {
    fn name(&self) -> &'static str {
        "different-agent"
    }

    fn priority(&self) -> u8 {
        3
    }

    fn is_applicable(&self, pattern: &FailurePattern, _task: &TaskSpec) -> bool {
        pattern.kind == FailureKind::Permission && !self.agents.is_empty()
    }

    fn apply(&self, task: &TaskSpec, _pattern: &FailurePattern) -> TaskSpec {
        let mut next = task.clone();
        if let Some(agent) = self.agents.next(task.executor_override.as_deref()) {
            next.executor_override = Some(agent);
        }
        next
    }

    fn estimate_success(&self, pattern: &FailurePattern) -> f64 {
        fade(0.5, pattern)
    }
}

/// Rotate the upstream provider when the current one throttles or errors.
pub struct DifferentProvider {
    providers: Rotation,
}

impl DifferentProvider {
    pub fn new(providers: Vec<String>) -> Self {
        Self {
            providers: Rotation::new(providers),
        }
    }
}

impl RecoveryStrategy for DifferentProvider {
    fn name(&self) -> &'static str {
        "different-provider"
    }

    fn priority(&self) -> u8 {
        4
    }

    fn is_applicable(&self, pattern: &FailurePattern, _task: &TaskSpec) -> bool {
        matches!(pattern.kind, FailureKind::ApiError | FailureKind::RateLimit)
            && !self.providers.is_empty()
    }

    fn apply(&self, task: &TaskSpec, _pattern: &FailurePattern) -> TaskSpec {
        let mut next = task.clone();
        if let Some(provider) = self.providers.next(task.provider.as_deref()) {
            next.provider = Some(provider);
        }
        next
    }

    fn estimate_success(&self, pattern: &FailurePattern) -> f64 {
        fade(0.5, pattern)
    }
}

/// Hard tasks that keep failing get rebuilt piece by piece on earlier
/// results instead of from scratch.
pub struct IncrementalRetry;

impl RecoveryStrategy for IncrementalRetry {
    fn name(&self) -> &'static str {
        "incremental-retry"
    }

    fn priority(&self) -> u8 {
        5
    }

    fn is_applicable(&self, pattern: &FailurePattern, task: &TaskSpec) -> bool {
        task.complexity >= TaskComplexity::High && pattern.consecutive_failures >= 2
    }

    fn apply(&self, task: &TaskSpec, _pattern: &FailurePattern) -> TaskSpec {
        let mut next = task.clone();
        next.incremental = true;
        next
    }

    fn estimate_success(&self, pattern: &FailurePattern) -> f64 {
        fade(0.45, pattern)
    }
}

/// Tune concurrency to the observed pressure: back off under rate limits,
/// widen when attempts crawl.
pub struct AdaptiveParallelism;

impl AdaptiveParallelism {
    fn slow(pattern: &FailurePattern) -> bool {
        pattern
            .average_latency_ms
            .is_some_and(|ms| ms > HIGH_LATENCY_THRESHOLD_MS)
    }
}

impl RecoveryStrategy for AdaptiveParallelism {
    fn name(&self) -> &'static str {
        "adaptive-parallelism"
    }

    fn priority(&self) -> u8 {
        6
    }

    fn is_applicable(&self, pattern: &FailurePattern, _task: &TaskSpec) -> bool {
        pattern.kind == FailureKind::RateLimit || Self::slow(pattern)
    }

    fn apply(&self, task: &TaskSpec, pattern: &FailurePattern) -> TaskSpec {
        let mut next = task.clone();
        let current = task.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
        next.concurrency = Some(if pattern.kind == FailureKind::RateLimit {
            (current / 2).max(1)
        } else {
            (current * 2).min(MAX_CONCURRENCY)
        });
        next
    }

    fn estimate_success(&self, pattern: &FailurePattern) -> f64 {
        fade(0.4, pattern)
    }
}

/// Step the task's complexity down one level and trim the description.
pub struct SimplifyTask;

impl RecoveryStrategy for SimplifyTask {
    fn name(&self) -> &'static str {
        "simplify-task"
    }

    fn priority(&self) -> u8 {
        7
    }

    fn is_applicable(&self, pattern: &FailurePattern, task: &TaskSpec) -> bool {
        pattern.kind == FailureKind::Complexity
            || (pattern.consecutive_failures >= 3 && task.complexity > TaskComplexity::Trivial)
    }

    fn apply(&self, task: &TaskSpec, _pattern: &FailurePattern) -> TaskSpec {
        let mut next = task.clone();
        next.complexity = task.complexity.step_down();
        next.description = simplified_description(&task.description);
        next
    }

    fn estimate_success(&self, pattern: &FailurePattern) -> f64 {
        fade(0.4, pattern)
    }
}

/// Give timing out steps more room instead of giving up on them.
pub struct GradualRelaxation;

impl RecoveryStrategy for GradualRelaxation {
    fn name(&self) -> &'static str {
        "gradual-relaxation"
    }

    fn priority(&self) -> u8 {
        8
    }

    fn is_applicable(&self, pattern: &FailurePattern, _task: &TaskSpec) -> bool {
        pattern.kind == FailureKind::Timeout
    }

    fn apply(&self, task: &TaskSpec, _pattern: &FailurePattern) -> TaskSpec {
        let mut next = task.clone();
        let current = task.timeout_ms.unwrap_or(DEFAULT_STEP_TIMEOUT_MS);
        next.timeout_ms = Some(((current as f64 * RELAXATION_FACTOR) as u64).min(TIMEOUT_CAP_MS));
        next
    }

    fn estimate_success(&self, pattern: &FailurePattern) -> f64 {
        fade(0.45, pattern)
    }
}

/// After a long failure streak, stop hammering and cool down before the
/// next attempt.
pub struct CircuitBreaker;

impl RecoveryStrategy for CircuitBreaker {
    fn name(&self) -> &'static str {
        "circuit-breaker"
    }

    fn priority(&self) -> u8 {
        9
    }

    fn is_applicable(&self, pattern: &FailurePattern, _task: &TaskSpec) -> bool {
        pattern.consecutive_failures >= 5
    }

    fn apply(&self, task: &TaskSpec, _pattern: &FailurePattern) -> TaskSpec {
        let mut next = task.clone();
        next.cool_down_ms = Some(CIRCUIT_COOL_DOWN_MS);
        next
    }

    fn estimate_success(&self, pattern: &FailurePattern) -> f64 {
        fade(0.3, pattern)
    }
}

/// Last resort: simplify, back off, and switch executors all at once.
pub struct HybridApproach {
    agents: Rotation,
}

impl HybridApproach {
    pub fn new(agents: Vec<String>) -> Self {
        Self {
            agents: Rotation::new(agents),
        }
    }
}

impl RecoveryStrategy for HybridApproach {
    fn name(&self) -> &'static str {
        "hybrid-approach"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn is_applicable(&self, pattern: &FailurePattern, _task: &TaskSpec) -> bool {
        pattern.consecutive_failures >= 4
    }

    fn apply(&self, task: &TaskSpec, pattern: &FailurePattern) -> TaskSpec {
        let mut next = task.clone();
        next.complexity = task.complexity.step_down();
        next.description = simplified_description(&task.description);
        next.next_delay_ms = Some(backoff_delay_ms(pattern.consecutive_failures));
        if let Some(agent) = self.agents.next(task.executor_override.as_deref()) {
            next.executor_override = Some(agent);
        }
        next
    }

    fn estimate_success(&self, pattern: &FailurePattern) -> f64 {
        fade(0.35, pattern)
    }
}

// ---------------------------------------------------------------------------
// StrategySelector
// ---------------------------------------------------------------------------

/// Picks one strategy per failed attempt from an injected catalog.
pub struct StrategySelector {
    catalog: Vec<Box<dyn RecoveryStrategy>>,
}

impl StrategySelector {
    pub fn new(catalog: Vec<Box<dyn RecoveryStrategy>>) -> Self {
        Self { catalog }
    }

    /// The full ten-strategy catalog, rotating executor switches through
    /// `executors` and provider switches through `providers`.
    pub fn default_catalog(executors: Vec<String>, providers: Vec<String>) -> Self {
        Self::new(vec![
            Box::new(SimpleRetry),
            Box::new(ExponentialBackoff),
            Box::new(DifferentAgent::new(executors.clone())),
            Box::new(DifferentProvider::new(providers)),
            Box::new(IncrementalRetry),
            Box::new(AdaptiveParallelism),
            Box::new(SimplifyTask),
            Box::new(GradualRelaxation),
            Box::new(CircuitBreaker),
            Box::new(HybridApproach::new(executors)),
        ])
    }

    /// Highest-priority applicable strategy, ties broken by the higher
    /// success estimate. None when nothing in the catalog applies.
    pub fn select(
        &self,
        pattern: &FailurePattern,
        task: &TaskSpec,
    ) -> Option<&dyn RecoveryStrategy> {
        self.catalog
            .iter()
            .filter(|strategy| strategy.is_applicable(pattern, task))
            .max_by(|a, b| {
                a.priority().cmp(&b.priority()).then_with(|| {
                    a.estimate_success(pattern)
                        .total_cmp(&b.estimate_success(pattern))
                })
            })
            .map(|strategy| strategy.as_ref())
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
