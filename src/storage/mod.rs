//! Storage backends.
//!
//! - [`traits`]: `BacklogStore`, `StreamBus`, `QuotaStore`
//! - [`sql`]: backlog rows in MySQL or SQLite via sqlx `Any`
//! - [`redis`]: stream bus and quota counters on Redis
//! - [`memory`]: in-process versions of all three

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;

pub use traits::{BacklogStore, Claim, Delivery, QuotaStore, StorageError, StreamBus};
