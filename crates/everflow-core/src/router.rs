//! Tiered step-to-executor routing.
//!
//! For each ready step the router selects an executor in three tiers,
//! tried in order, first match wins:
//!
//! 1. Explicit -- the step (or the current task) names a live executor.
//! 2. Type-inferred -- a pluggable keyword matcher derives a coarse step
//!    kind and matches executors advertising that capability tag.
//! 3. Semantic -- token-overlap similarity against executor capability
//!    descriptions; always matches when at least one executor exists.
//!
//! The type matcher is deliberately behind a trait: it is a heuristic, and
//! isolating it keeps the heuristic swappable and independently testable.

use std::collections::HashSet;

use thiserror::Error;

use everflow_types::workflow::WorkflowStep;

use crate::executor::{BoxStepExecutor, ExecutorRegistry};

/// Confidence reported for an explicit target match.
pub const EXPLICIT_CONFIDENCE: f64 = 0.9;
/// Confidence reported for a type-inferred match.
pub const TYPE_CONFIDENCE: f64 = 0.7;
/// Confidence reported for a semantic fallback match.
pub const SEMANTIC_CONFIDENCE: f64 = 0.6;

/// Routing failure. With at least one executor registered, routing always
/// succeeds via the semantic tier.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouterError {
    #[error("no executors registered")]
    NoExecutors,
}

/// Which tier produced a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteTier {
    Explicit,
    TypeInferred,
    Semantic,
}

impl RouteTier {
    /// Stable name for logs, events, and attempt records.
    pub fn name(&self) -> &'static str {
        match self {
            RouteTier::Explicit => "explicit",
            RouteTier::TypeInferred => "type_inferred",
            RouteTier::Semantic => "semantic",
        }
    }
}

/// The selected executor plus how and how confidently it was chosen.
pub struct RouteDecision<'a> {
    pub executor: &'a BoxStepExecutor,
    pub tier: RouteTier,
    pub confidence: f64,
}

impl std::fmt::Debug for RouteDecision<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteDecision")
            .field("executor", &self.executor.name())
            .field("tier", &self.tier)
            .field("confidence", &self.confidence)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Type inference (tier 2)
// ---------------------------------------------------------------------------

/// Coarse step categories recognized by tier-2 routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Testing,
    Build,
    Deploy,
    Analysis,
    Docs,
}

impl StepKind {
    /// The capability tag executors advertise for this kind.
    pub fn tag(&self) -> &'static str {
        match self {
            StepKind::Testing => "testing",
            StepKind::Build => "build",
            StepKind::Deploy => "deploy",
            StepKind::Analysis => "analysis",
            StepKind::Docs => "docs",
        }
    }
}

/// Pluggable heuristic deriving a step kind from a step's text.
pub trait TypeMatcher: Send + Sync {
    /// The inferred kind, or `None` when the heuristic has no opinion.
    fn infer(&self, step: &WorkflowStep) -> Option<StepKind>;
}

/// Default keyword table over the step's action and name.
///
/// First matching category wins; matching is case-insensitive substring
/// search, so "run integration tests" hits "test".
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordTypeMatcher;

const KEYWORD_TABLE: &[(StepKind, &[&str])] = &[
    (StepKind::Testing, &["test", "verify", "qa"]),
    (StepKind::Build, &["build", "compile", "package"]),
    (StepKind::Deploy, &["deploy", "release", "ship", "rollout"]),
    (StepKind::Analysis, &["analyze", "analyse", "review", "audit", "lint"]),
    (StepKind::Docs, &["document", "docs", "readme"]),
];

impl TypeMatcher for KeywordTypeMatcher {
    fn infer(&self, step: &WorkflowStep) -> Option<StepKind> {
        let text = format!("{} {}", step.action, step.name).to_lowercase();
        KEYWORD_TABLE
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|kw| text.contains(kw)))
            .map(|(kind, _)| *kind)
    }
}

// ---------------------------------------------------------------------------
// Semantic scoring (tier 3)
// ---------------------------------------------------------------------------

const STOPWORDS: &[&str] = &["the", "and", "with", "for", "that", "this"];

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3 && !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

/// Jaccard overlap between the step's text and an executor's advertised
/// capabilities, in [0, 1].
fn semantic_score(step_tokens: &HashSet<String>, executor: &BoxStepExecutor) -> f64 {
    let capabilities = executor.capabilities();
    let executor_text = format!(
        "{} {} {}",
        executor.name(),
        capabilities.tags.join(" "),
        capabilities.description
    );
    let executor_tokens = tokenize(&executor_text);

    let intersection = step_tokens.intersection(&executor_tokens).count();
    let union = step_tokens.union(&executor_tokens).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

// ---------------------------------------------------------------------------
// Step Router
// ---------------------------------------------------------------------------

/// Routes steps to executors through the three tiers.
pub struct StepRouter {
    registry: ExecutorRegistry,
    matcher: Box<dyn TypeMatcher>,
}

impl StepRouter {
    /// A router over `registry` with the default keyword matcher.
    pub fn new(registry: ExecutorRegistry) -> Self {
        Self::with_matcher(registry, KeywordTypeMatcher)
    }

    /// A router with a custom tier-2 matcher.
    pub fn with_matcher(registry: ExecutorRegistry, matcher: impl TypeMatcher + 'static) -> Self {
        Self {
            registry,
            matcher: Box::new(matcher),
        }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Select an executor for a step.
    ///
    /// `executor_override` comes from the current task (installed by
    /// recovery strategies) and takes precedence over the step's own
    /// target; both count as explicit matches. A named executor that is
    /// not registered falls through to the lower tiers.
    pub fn route(
        &self,
        step: &WorkflowStep,
        executor_override: Option<&str>,
    ) -> Result<RouteDecision<'_>, RouterError> {
        if self.registry.is_empty() {
            return Err(RouterError::NoExecutors);
        }

        // Tier 1: explicit target, task override first.
        for target in [executor_override, step.target.as_deref()].into_iter().flatten() {
            if let Some(executor) = self.registry.get(target) {
                tracing::debug!(
                    step_id = %step.id,
                    executor = executor.name(),
                    tier = RouteTier::Explicit.name(),
                    "routed step"
                );
                return Ok(RouteDecision {
                    executor,
                    tier: RouteTier::Explicit,
                    confidence: EXPLICIT_CONFIDENCE,
                });
            }
        }

        // Tier 2: inferred kind against advertised tags.
        if let Some(kind) = self.matcher.infer(step) {
            let tagged = self.registry.executors().iter().find(|executor| {
                executor
                    .capabilities()
                    .tags
                    .iter()
                    .any(|tag| tag.eq_ignore_ascii_case(kind.tag()))
            });
            if let Some(executor) = tagged {
                tracing::debug!(
                    step_id = %step.id,
                    executor = executor.name(),
                    tier = RouteTier::TypeInferred.name(),
                    kind = kind.tag(),
                    "routed step"
                );
                return Ok(RouteDecision {
                    executor,
                    tier: RouteTier::TypeInferred,
                    confidence: TYPE_CONFIDENCE,
                });
            }
        }

        // Tier 3: best token overlap; registration order breaks ties, so
        // this always matches some executor.
        let step_tokens = tokenize(&format!("{} {}", step.action, step.name));
        let mut best: Option<(&BoxStepExecutor, f64)> = None;
        for executor in self.registry.executors() {
            let score = semantic_score(&step_tokens, executor);
            if best.is_none_or(|(_, best_score)| score > best_score) {
                best = Some((executor, score));
            }
        }

        let Some((executor, score)) = best else {
            return Err(RouterError::NoExecutors);
        };
        tracing::debug!(
            step_id = %step.id,
            executor = executor.name(),
            tier = RouteTier::Semantic.name(),
            score,
            "routed step"
        );
        Ok(RouteDecision {
            executor,
            tier: RouteTier::Semantic,
            confidence: SEMANTIC_CONFIDENCE,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use everflow_types::error::ExecutionError;

    use crate::context::ContextView;
    use crate::executor::{ExecutionOutput, ExecutorCapabilities, StepExecutor};

    struct NamedExecutor {
        name: String,
        capabilities: ExecutorCapabilities,
    }

    impl NamedExecutor {
        fn new(name: &str, tags: &[&str], description: &str) -> Self {
            Self {
                name: name.to_string(),
                capabilities: ExecutorCapabilities::new(tags, description),
            }
        }
    }

    impl StepExecutor for NamedExecutor {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> &ExecutorCapabilities {
            &self.capabilities
        }

        async fn execute(
            &self,
            _step: &WorkflowStep,
            _context: &ContextView,
        ) -> Result<ExecutionOutput, ExecutionError> {
            Ok(ExecutionOutput::json(json!(null)))
        }
    }

    fn step(action: &str, target: Option<&str>) -> WorkflowStep {
        WorkflowStep {
            id: "s1".to_string(),
            name: "Step One".to_string(),
            target: target.map(|t| t.to_string()),
            action: action.to_string(),
            config: Default::default(),
            depends_on: vec![],
            retry: None,
            timeout_ms: None,
            estimated_duration_ms: None,
        }
    }

    fn router(executors: Vec<NamedExecutor>) -> StepRouter {
        let mut registry = ExecutorRegistry::new();
        for executor in executors {
            registry.register(executor);
        }
        StepRouter::new(registry)
    }

    #[test]
    fn empty_registry_cannot_route() {
        let router = router(vec![]);
        let err = router.route(&step("do anything", None), None).unwrap_err();
        assert_eq!(err, RouterError::NoExecutors);
    }

    #[test]
    fn explicit_target_wins_over_better_semantic_match() {
        // "wordsmith" would win tier 3 outright for this action.
        let router = router(vec![
            NamedExecutor::new("generalist", &[], "handles misc chores"),
            NamedExecutor::new(
                "wordsmith",
                &[],
                "writes summarize release announcement paragraphs",
            ),
        ]);
        let step = step("summarize release announcement paragraphs", Some("generalist"));

        let decision = router.route(&step, None).unwrap();
        assert_eq!(decision.executor.name(), "generalist");
        assert_eq!(decision.tier, RouteTier::Explicit);
        assert_eq!(decision.confidence, EXPLICIT_CONFIDENCE);
    }

    #[test]
    fn task_override_beats_step_target() {
        let router = router(vec![
            NamedExecutor::new("primary", &[], "main agent"),
            NamedExecutor::new("backup", &[], "fallback agent"),
        ]);
        let step = step("do the work", Some("primary"));

        let decision = router.route(&step, Some("backup")).unwrap();
        assert_eq!(decision.executor.name(), "backup");
        assert_eq!(decision.tier, RouteTier::Explicit);
    }

    #[test]
    fn dead_target_falls_through_to_type_tier() {
        let router = router(vec![NamedExecutor::new(
            "tester",
            &["testing"],
            "runs test suites",
        )]);
        let step = step("run the unit tests", Some("retired-bot"));

        let decision = router.route(&step, None).unwrap();
        assert_eq!(decision.executor.name(), "tester");
        assert_eq!(decision.tier, RouteTier::TypeInferred);
        assert_eq!(decision.confidence, TYPE_CONFIDENCE);
    }

    #[test]
    fn type_tier_requires_matching_tag() {
        // Action says "test" but nobody advertises the testing tag, so the
        // decision falls to the semantic tier.
        let router = router(vec![NamedExecutor::new(
            "deployer",
            &["deploy"],
            "ships releases to production",
        )]);
        let step = step("run the unit tests", None);

        let decision = router.route(&step, None).unwrap();
        assert_eq!(decision.tier, RouteTier::Semantic);
        assert_eq!(decision.confidence, SEMANTIC_CONFIDENCE);
    }

    #[test]
    fn semantic_tier_prefers_best_overlap() {
        let router = router(vec![
            NamedExecutor::new("db-bot", &[], "database schema migration expert"),
            NamedExecutor::new("web-bot", &[], "frontend rendering specialist"),
        ]);
        let step = step("migrate the database schema", None);

        let decision = router.route(&step, None).unwrap();
        assert_eq!(decision.executor.name(), "db-bot");
        assert_eq!(decision.tier, RouteTier::Semantic);
    }

    #[test]
    fn semantic_tier_matches_even_with_zero_overlap() {
        let router = router(vec![
            NamedExecutor::new("first", &[], "alpha"),
            NamedExecutor::new("second", &[], "beta"),
        ]);
        let step = step("completely unrelated work", None);

        // Zero overlap everywhere: registration order breaks the tie.
        let decision = router.route(&step, None).unwrap();
        assert_eq!(decision.executor.name(), "first");
        assert_eq!(decision.tier, RouteTier::Semantic);
    }

    #[test]
    fn route_decision_debug_names_executor_and_tier() {
        let router = router(vec![NamedExecutor::new(
            "tester",
            &["testing"],
            "runs test suites",
        )]);

        let decision = router.route(&step("run the unit tests", None), None).unwrap();

        let rendered = format!("{decision:?}");
        assert!(rendered.contains("tester"));
        assert!(rendered.contains("TypeInferred"));
    }

    #[test]
    fn custom_matcher_replaces_keyword_heuristic() {
        struct NoOpinion;
        impl TypeMatcher for NoOpinion {
            fn infer(&self, _step: &WorkflowStep) -> Option<StepKind> {
                None
            }
        }

        let mut registry = ExecutorRegistry::new();
        registry.register(NamedExecutor::new("tester", &["testing"], "runs test suites"));
        let router = StepRouter::with_matcher(registry, NoOpinion);

        // Without the keyword heuristic a "test" action skips tier 2.
        let decision = router.route(&step("run the unit tests", None), None).unwrap();
        assert_eq!(decision.tier, RouteTier::Semantic);
    }

    #[test]
    fn keyword_table_covers_the_expected_kinds() {
        let matcher = KeywordTypeMatcher;
        let cases = [
            ("run integration tests", Some(StepKind::Testing)),
            ("compile the workspace", Some(StepKind::Build)),
            ("deploy to staging", Some(StepKind::Deploy)),
            ("review the diff", Some(StepKind::Analysis)),
            ("update the readme", Some(StepKind::Docs)),
            ("water the plants", None),
        ];
        for (action, expected) in cases {
            assert_eq!(matcher.infer(&step(action, None)), expected, "{action}");
        }
    }
}
