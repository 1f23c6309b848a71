//! Engine event distribution.
//!
//! - `bus`: broadcast channel fanning `EngineEvent` out to subscribers
//! - `observer`: background task draining a subscription into `tracing`
//!
//! Events are observability only. Nothing in the engine blocks on a
//! subscriber, and publishing without subscribers is a silent no-op.

pub mod bus;
pub mod observer;

pub use bus::EventBus;
pub use observer::spawn_log_observer;
