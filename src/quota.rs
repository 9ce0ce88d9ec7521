// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-shop, per-engine daily quota.
//!
//! Counters live in a [`QuotaStore`] under `quota:{shop}:{engine}:{YYYY-MM-DD}` (UTC)
//! and expire two days after first use, so the window rolls over at midnight UTC
//! without any reset job. Reservation is the only write: a worker asks for `n` units
//! and receives however many are left, atomically.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::model::Engine;
use crate::storage::traits::{QuotaStore, StorageError};

/// Counter lifetime; one full day of slack past the window.
pub const QUOTA_KEY_TTL: Duration = Duration::from_secs(2 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota store unavailable: {0}")]
    Store(#[from] StorageError),
}

/// UTC day label for an epoch-millisecond instant.
pub fn day_label(now_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(now_ms)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}

#[derive(Clone)]
pub struct QuotaTracker {
    store: Arc<dyn QuotaStore>,
    prefix: String,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn QuotaStore>, prefix: Option<&str>) -> Self {
        Self {
            store,
            prefix: prefix.unwrap_or("").to_string(),
        }
    }

    pub fn key(&self, shop: &str, engine: Engine, now_ms: i64) -> String {
        format!("{}quota:{}:{}:{}", self.prefix, shop, engine, day_label(now_ms))
    }

    pub async fn used(&self, shop: &str, engine: Engine, now_ms: i64) -> Result<u32, QuotaError> {
        Ok(self.store.used(&self.key(shop, engine, now_ms)).await?)
    }

    /// Units left today. Advisory only: another worker may take them first.
    pub async fn remaining(&self, shop: &str, engine: Engine, limit: u32, now_ms: i64) -> Result<u32, QuotaError> {
        Ok(limit.saturating_sub(self.used(shop, engine, now_ms).await?))
    }

    /// Atomically reserve up to `n` units; returns the number granted.
    pub async fn reserve(
        &self,
        shop: &str,
        engine: Engine,
        limit: u32,
        n: u32,
        now_ms: i64,
    ) -> Result<u32, QuotaError> {
        let key = self.key(shop, engine, now_ms);
        let granted = self.store.reserve_up_to(&key, limit, n, QUOTA_KEY_TTL).await?;
        if granted < n {
            debug!(shop, engine = %engine, requested = n, granted, limit, "Quota partially exhausted");
        }
        Ok(granted)
    }
}
