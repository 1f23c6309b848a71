//! Adaptive iteration: run, diagnose, adjust, run again.
//!
//! - [`analyzer`]: classifies attempt failures into coarse kinds
//! - [`strategy`]: the recovery catalog and the selector that picks from it
//! - [`safety`]: hard ceilings on iterations, wall clock, and cost
//! - [`progress`]: per-attempt history and derived observability numbers
//! - [`engine`]: the sequential loop wiring all of the above to the runner

pub mod analyzer;
pub mod engine;
pub mod progress;
pub mod safety;
pub mod strategy;

pub use analyzer::FailureAnalyzer;
pub use engine::{EngineError, IterationEngine};
pub use progress::ProgressTracker;
pub use safety::{SafetyEvaluator, SafetyLimitExceeded, SafetyLimits};
pub use strategy::{RecoveryStrategy, StrategySelector};
