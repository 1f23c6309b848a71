//! The Everflow orchestration engine.
//!
//! Parses workflow definitions into a dependency graph, routes steps to
//! registered executors, runs them wave-parallel with retries and
//! checkpointing, and wraps failed attempts in an adaptive iteration loop
//! that picks a recovery strategy between attempts. Depends only on
//! `everflow-types` for the shared data model; executors are supplied by
//! the caller through the [`executor::StepExecutor`] trait.

pub mod checkpoint;
pub mod context;
pub mod event;
pub mod executor;
pub mod graph;
pub mod iterate;
pub mod retry;
pub mod router;
pub mod runner;
pub mod state;

pub use checkpoint::{CheckpointStore, MemoryStore};
pub use context::WorkflowContext;
pub use event::EventBus;
pub use executor::{ExecutorRegistry, StepExecutor};
pub use graph::StepGraph;
pub use iterate::{IterationEngine, SafetyLimits, StrategySelector};
pub use router::StepRouter;
pub use runner::{RunnerError, WorkflowRunner};
