//! Versioned response cache and the read strategies built on it.
//!
//! This module provides:
//! - Named namespaces of full HTTP response snapshots, keyed by request identity
//! - One precache and one runtime namespace per version, older ones deleted at activation
//! - Stale-while-revalidate and network-first read disciplines with offline fallback

mod layer;
mod names;
mod storage;
mod types;

pub use layer::CacheLayer;
pub use names::CacheNames;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use types::RequestKey;
