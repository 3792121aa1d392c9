//! Replay of queued writes.
//!
//! [`SyncOrchestrator`] drains the durable queue; [`SyncRegistry`] plays the
//! platform's deferred-sync facility and decides when a drain is worth trying.

mod orchestrator;
mod registry;

pub use orchestrator::{SyncOrchestrator, SyncState};
pub use registry::{SyncDispatcher, SyncRegistry};
