//! Durable queue of writes that failed to reach the upstream.
//!
//! Records survive restarts. The write interceptor appends, the sync
//! orchestrator reads and deletes; replay order is capture order.

mod record;
mod store;

pub use record::{field_value, FormPayload, QueuedWriteRecord};
pub use store::{QueueStore, SqliteQueue};
