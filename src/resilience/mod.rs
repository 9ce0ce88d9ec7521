//! Retry helpers for connecting, publishing and requeue backoff.

pub mod retry;

pub use retry::{requeue_delay, retry, RetryConfig};
