use async_trait::async_trait;
use crate::model::{IndexAction, ShopProfile, UrlEntry};
use crate::transition::Resolution;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt row for '{key}': {reason}")]
    Corruption {
        key: String,
        reason: String,
    },
}

/// Parameters of an atomic claim (PENDING or stale PROCESSING → PROCESSING).
#[derive(Debug, Clone)]
pub struct Claim {
    /// Batch id that will hold the lease
    pub token: String,
    pub now: i64,
    /// PROCESSING rows older than this are considered abandoned
    pub lease_ms: i64,
    /// Attempts are incremented on claim but never past this value
    pub max_attempts: u32,
}

/// Persistent backlog of URL entries and shop profiles.
///
/// Every state change is a compare-and-swap. Implementations must make `try_claim`
/// and `resolve` atomic per `(shop, url)`; nothing else is assumed about concurrency.
#[async_trait]
pub trait BacklogStore: Send + Sync {
    /// Webhook write contract: upsert the row to PENDING, reset attempts and clear
    /// any lease. Supersedes whatever cycle was in flight.
    async fn record_event(
        &self,
        shop: &str,
        url: &str,
        action: IndexAction,
        event_at: i64,
    ) -> Result<(), StorageError>;

    /// Shops with at least one claimable entry.
    async fn pending_shops(&self, now: i64, lease_ms: i64) -> Result<Vec<String>, StorageError>;

    /// Up to `limit` claimable entries for a shop, oldest `last_event_at` first.
    async fn load_claimable(
        &self,
        shop: &str,
        now: i64,
        lease_ms: i64,
        limit: usize,
    ) -> Result<Vec<UrlEntry>, StorageError>;

    /// Claim `entry` as loaded. Fails (returns false) if another worker claimed it
    /// first or a newer event replaced it since it was loaded.
    async fn try_claim(&self, entry: &UrlEntry, claim: &Claim) -> Result<bool, StorageError>;

    async fn get_entry(&self, shop: &str, url: &str) -> Result<Option<UrlEntry>, StorageError>;

    /// Apply a resolution if the row is still PROCESSING under `token`.
    /// Returns false when the outcome has been superseded.
    async fn resolve(
        &self,
        shop: &str,
        url: &str,
        token: &str,
        resolution: &Resolution,
        now: i64,
    ) -> Result<bool, StorageError>;

    async fn shop_profile(&self, shop: &str) -> Result<Option<ShopProfile>, StorageError>;

    async fn upsert_shop(&self, profile: &ShopProfile) -> Result<(), StorageError>;

    /// Claim each entry in turn; returns the ones this caller won.
    /// Default implementation falls back to sequential claims.
    async fn try_claim_all(
        &self,
        entries: &[UrlEntry],
        claim: &Claim,
    ) -> Result<Vec<UrlEntry>, StorageError> {
        let mut won = Vec::with_capacity(entries.len());
        for entry in entries {
            if self.try_claim(entry, claim).await? {
                won.push(entry.clone());
            }
        }
        Ok(won)
    }
}

/// A message handed to a consumer-group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    /// `None` when the entry lacks a payload field
    pub payload: Option<String>,
    /// How many times the group has delivered this message, this one included
    pub deliveries: u64,
}

/// Durable at-least-once streams with consumer groups.
#[async_trait]
pub trait StreamBus: Send + Sync {
    /// Create the group (and the stream) if missing. Existing groups are left alone.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StorageError>;

    /// Append a payload; returns the message id.
    async fn publish(&self, stream: &str, payload: &str) -> Result<String, StorageError>;

    /// Read up to `count` never-delivered messages, blocking up to `block`.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, StorageError>;

    /// Take over messages another consumer left unacknowledged for at least `min_idle`.
    async fn reclaim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>, StorageError>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StorageError>;

    /// Pending plus not-yet-delivered messages for the group.
    async fn backlog(&self, stream: &str, group: &str) -> Result<u64, StorageError>;
}

/// Atomic counters backing the daily quota.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Atomically grant `min(n, limit - used)` units and return the grant.
    /// The key expires after `ttl` once created.
    async fn reserve_up_to(
        &self,
        key: &str,
        limit: u32,
        n: u32,
        ttl: Duration,
    ) -> Result<u32, StorageError>;

    async fn used(&self, key: &str) -> Result<u32, StorageError>;
}
