//! Shared domain types for Everflow.
//!
//! This crate contains the types that cross the engine's boundaries: the
//! workflow definition shape, execution state and checkpoints, the executor
//! error taxonomy, failure patterns, task specifications, and progress
//! events.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod error;
pub mod event;
pub mod failure;
pub mod task;
pub mod workflow;
