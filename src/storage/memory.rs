//! In-memory backends.
//!
//! Used by the test suite and for single-process dry runs. Each store honours the
//! same atomicity contract as its durable counterpart: DashMap shard locks for
//! per-row CAS, a single mutex for stream and quota state.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::traits::{BacklogStore, Claim, Delivery, QuotaStore, StorageError, StreamBus};
use crate::model::{IndexAction, ShopProfile, UrlEntry, UrlStatus};
use crate::transition::Resolution;

// ═══════════════════════════════════════════════════════════════════════════
// Backlog
// ═══════════════════════════════════════════════════════════════════════════

pub struct InMemoryBacklog {
    entries: DashMap<(String, String), UrlEntry>,
    shops: DashMap<String, ShopProfile>,
}

impl InMemoryBacklog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            shops: DashMap::new(),
        }
    }

    /// Insert or replace a row verbatim (test fixtures).
    pub fn insert_entry(&self, entry: UrlEntry) {
        self.entries.insert((entry.shop.clone(), entry.url.clone()), entry);
    }

    /// All rows for a shop, ordered by URL.
    pub fn entries_for(&self, shop: &str) -> Vec<UrlEntry> {
        let mut rows: Vec<UrlEntry> = self
            .entries
            .iter()
            .filter(|r| r.key().0 == shop)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| a.url.cmp(&b.url));
        rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemoryBacklog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BacklogStore for InMemoryBacklog {
    async fn record_event(
        &self,
        shop: &str,
        url: &str,
        action: IndexAction,
        event_at: i64,
    ) -> Result<(), StorageError> {
        let key = (shop.to_string(), url.to_string());
        self.entries
            .entry(key)
            .and_modify(|e| {
                e.index_action = action;
                e.status = UrlStatus::Pending;
                e.attempts = 0;
                e.last_event_at = event_at;
                e.claimed_at = None;
                e.claim_token = None;
                e.retry_after = None;
                e.skip_attempt = false;
            })
            .or_insert_with(|| UrlEntry::pending(shop, url, action, event_at));
        Ok(())
    }

    async fn pending_shops(&self, now: i64, lease_ms: i64) -> Result<Vec<String>, StorageError> {
        let mut shops: Vec<String> = self
            .entries
            .iter()
            .filter(|r| r.value().is_claimable(now, lease_ms))
            .map(|r| r.key().0.clone())
            .collect();
        shops.sort();
        shops.dedup();
        Ok(shops)
    }

    async fn load_claimable(
        &self,
        shop: &str,
        now: i64,
        lease_ms: i64,
        limit: usize,
    ) -> Result<Vec<UrlEntry>, StorageError> {
        let mut rows: Vec<UrlEntry> = self
            .entries
            .iter()
            .filter(|r| r.key().0 == shop && r.value().is_claimable(now, lease_ms))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| a.last_event_at.cmp(&b.last_event_at).then_with(|| a.url.cmp(&b.url)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn try_claim(&self, entry: &UrlEntry, claim: &Claim) -> Result<bool, StorageError> {
        let key = (entry.shop.clone(), entry.url.clone());
        let Some(mut row) = self.entries.get_mut(&key) else {
            return Ok(false);
        };
        if row.last_event_at != entry.last_event_at
            || row.index_action != entry.index_action
            || !row.is_claimable(claim.now, claim.lease_ms)
        {
            return Ok(false);
        }
        row.status = UrlStatus::Processing;
        row.claimed_at = Some(claim.now);
        row.claim_token = Some(claim.token.clone());
        row.retry_after = None;
        row.attempts = row.attempts_after_claim(claim.max_attempts);
        row.skip_attempt = false;
        Ok(true)
    }

    async fn get_entry(&self, shop: &str, url: &str) -> Result<Option<UrlEntry>, StorageError> {
        Ok(self
            .entries
            .get(&(shop.to_string(), url.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn resolve(
        &self,
        shop: &str,
        url: &str,
        token: &str,
        resolution: &Resolution,
        now: i64,
    ) -> Result<bool, StorageError> {
        let key = (shop.to_string(), url.to_string());
        let Some(mut row) = self.entries.get_mut(&key) else {
            return Ok(false);
        };
        if row.status != UrlStatus::Processing || row.claim_token.as_deref() != Some(token) {
            return Ok(false);
        }
        row.claimed_at = None;
        row.claim_token = None;
        row.skip_attempt = false;
        match resolution {
            Resolution::Complete => {
                row.status = UrlStatus::Completed;
                row.last_indexed_at = Some(now);
                row.last_error = None;
                row.retry_after = None;
            }
            Resolution::Fail { reason } => {
                row.status = UrlStatus::Failed;
                row.last_error = Some(reason.clone());
                row.retry_after = None;
            }
            Resolution::Requeue { retry_after, reason, counted } => {
                row.status = UrlStatus::Pending;
                row.last_error = Some(reason.clone());
                row.retry_after = Some(*retry_after);
                row.skip_attempt = !counted;
            }
        }
        Ok(true)
    }

    async fn shop_profile(&self, shop: &str) -> Result<Option<ShopProfile>, StorageError> {
        Ok(self.shops.get(shop).map(|r| r.value().clone()))
    }

    async fn upsert_shop(&self, profile: &ShopProfile) -> Result<(), StorageError> {
        self.shops.insert(profile.shop.clone(), profile.clone());
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Streams
// ═══════════════════════════════════════════════════════════════════════════

struct PendingMessage {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingMessage>,
}

#[derive(Default)]
struct StreamState {
    next_seq: u64,
    messages: BTreeMap<u64, Option<String>>,
    groups: HashMap<String, GroupState>,
}

fn message_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_id(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

/// Consumer-group semantics over in-process maps.
pub struct InMemoryStreamBus {
    streams: Mutex<HashMap<String, StreamState>>,
    notify: Notify,
}

impl InMemoryStreamBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Append an entry without a payload field (exercises poison handling).
    pub fn publish_raw(&self, stream: &str, payload: Option<&str>) -> String {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.messages.insert(seq, payload.map(str::to_string));
        drop(streams);
        self.notify.notify_waiters();
        message_id(seq)
    }

    /// Every payload ever appended to `stream`, oldest first.
    pub fn payloads(&self, stream: &str) -> Vec<String> {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.messages.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Unacknowledged deliveries for a group.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    fn take_new(&self, stream: &str, group: &str, consumer: &str, count: usize) -> Result<Vec<Delivery>, StorageError> {
        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| StorageError::Backend(format!("NOGROUP no such stream '{}'", stream)))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| StorageError::Backend(format!("NOGROUP no group '{}' on '{}'", group, stream)))?;

        let now = Instant::now();
        let fresh: Vec<(u64, Option<String>)> = state
            .messages
            .range(group_state.last_delivered + 1..)
            .take(count)
            .map(|(seq, payload)| (*seq, payload.clone()))
            .collect();

        let mut out = Vec::with_capacity(fresh.len());
        for (seq, payload) in fresh {
            group_state.last_delivered = seq;
            group_state.pending.insert(
                seq,
                PendingMessage { consumer: consumer.to_string(), delivered_at: now, deliveries: 1 },
            );
            out.push(Delivery { id: message_id(seq), payload, deliveries: 1 });
        }
        Ok(out)
    }
}

impl Default for InMemoryStreamBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamBus for InMemoryStreamBus {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StorageError> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        // New groups start at the stream tail, like `XGROUP CREATE ... $`
        let tail = state.next_seq;
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState { last_delivered: tail, pending: BTreeMap::new() });
        Ok(())
    }

    async fn publish(&self, stream: &str, payload: &str) -> Result<String, StorageError> {
        Ok(self.publish_raw(stream, Some(payload)))
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, StorageError> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.notify.notified();
            let batch = self.take_new(stream, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            // Bounded wait; a publish between take_new and here is caught next loop
            let _ = tokio::time::timeout(remaining.min(Duration::from_millis(20)), notified).await;
        }
    }

    async fn reclaim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>, StorageError> {
        let mut streams = self.streams.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut out = Vec::new();
        for (seq, pending) in group_state.pending.iter_mut() {
            if out.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.deliveries += 1;
            let payload = state.messages.get(seq).cloned().flatten();
            out.push(Delivery { id: message_id(*seq), payload, deliveries: pending.deliveries });
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StorageError> {
        let seq = parse_id(id).ok_or_else(|| StorageError::Backend(format!("invalid stream id '{}'", id)))?;
        if let Some(g) = self.streams.lock().get_mut(stream).and_then(|s| s.groups.get_mut(group)) {
            g.pending.remove(&seq);
        }
        Ok(())
    }

    async fn backlog(&self, stream: &str, group: &str) -> Result<u64, StorageError> {
        let streams = self.streams.lock();
        let Some(state) = streams.get(stream) else {
            return Ok(0);
        };
        let Some(g) = state.groups.get(group) else {
            return Ok(state.messages.len() as u64);
        };
        let lag = state.messages.range(g.last_delivered + 1..).count();
        Ok((g.pending.len() + lag) as u64)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Quota
// ═══════════════════════════════════════════════════════════════════════════

/// Mutex-guarded counters. TTLs are not enforced; keys embed the day.
pub struct InMemoryQuotaStore {
    counters: Mutex<HashMap<String, u32>>,
}

impl InMemoryQuotaStore {
    #[must_use]
    pub fn new() -> Self {
        Self { counters: Mutex::new(HashMap::new()) }
    }

    /// Force a counter value (test fixtures).
    pub fn set_used(&self, key: &str, used: u32) {
        self.counters.lock().insert(key.to_string(), used);
    }
}

impl Default for InMemoryQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn reserve_up_to(&self, key: &str, limit: u32, n: u32, _ttl: Duration) -> Result<u32, StorageError> {
        let mut counters = self.counters.lock();
        let used = counters.entry(key.to_string()).or_insert(0);
        let granted = n.min(limit.saturating_sub(*used));
        *used += granted;
        Ok(granted)
    }

    async fn used(&self, key: &str) -> Result<u32, StorageError> {
        Ok(self.counters.lock().get(key).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(token: &str, now: i64) -> Claim {
        Claim { token: token.to_string(), now, lease_ms: 1_000, max_attempts: 5 }
    }

    #[tokio::test]
    async fn test_record_event_resets_cycle() {
        let store = InMemoryBacklog::new();
        store.record_event("s", "https://s/a", IndexAction::Index, 10).await.unwrap();
        let entry = store.get_entry("s", "https://s/a").await.unwrap().unwrap();
        assert!(store.try_claim(&entry, &claim("b1", 20)).await.unwrap());

        store.record_event("s", "https://s/a", IndexAction::Delete, 30).await.unwrap();
        let entry = store.get_entry("s", "https://s/a").await.unwrap().unwrap();
        assert_eq!(entry.status, UrlStatus::Pending);
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.index_action, IndexAction::Delete);
        assert!(entry.claim_token.is_none());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemoryBacklog::new();
        store.record_event("s", "https://s/a", IndexAction::Index, 10).await.unwrap();
        let entry = store.get_entry("s", "https://s/a").await.unwrap().unwrap();

        assert!(store.try_claim(&entry, &claim("b1", 20)).await.unwrap());
        assert!(!store.try_claim(&entry, &claim("b2", 21)).await.unwrap());

        let row = store.get_entry("s", "https://s/a").await.unwrap().unwrap();
        assert_eq!(row.claim_token.as_deref(), Some("b1"));
        assert_eq!(row.attempts, 1);
    }

    #[tokio::test]
    async fn test_claim_rejects_superseded_snapshot() {
        let store = InMemoryBacklog::new();
        store.record_event("s", "https://s/a", IndexAction::Index, 10).await.unwrap();
        let stale = store.get_entry("s", "https://s/a").await.unwrap().unwrap();
        store.record_event("s", "https://s/a", IndexAction::Index, 11).await.unwrap();

        assert!(!store.try_claim(&stale, &claim("b1", 20)).await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_requires_matching_token() {
        let store = InMemoryBacklog::new();
        store.record_event("s", "https://s/a", IndexAction::Index, 10).await.unwrap();
        let entry = store.get_entry("s", "https://s/a").await.unwrap().unwrap();
        store.try_claim(&entry, &claim("b1", 20)).await.unwrap();

        assert!(!store.resolve("s", "https://s/a", "b0", &Resolution::Complete, 30).await.unwrap());
        assert!(store.resolve("s", "https://s/a", "b1", &Resolution::Complete, 30).await.unwrap());
        // Second apply is a no-op
        assert!(!store.resolve("s", "https://s/a", "b1", &Resolution::Complete, 31).await.unwrap());

        let row = store.get_entry("s", "https://s/a").await.unwrap().unwrap();
        assert_eq!(row.status, UrlStatus::Completed);
        assert_eq!(row.last_indexed_at, Some(30));
    }

    #[tokio::test]
    async fn test_load_claimable_orders_oldest_first() {
        let store = InMemoryBacklog::new();
        store.record_event("s", "https://s/new", IndexAction::Index, 30).await.unwrap();
        store.record_event("s", "https://s/old", IndexAction::Index, 10).await.unwrap();
        store.record_event("s", "https://s/skip", IndexAction::Ignore, 5).await.unwrap();
        store.record_event("t", "https://t/x", IndexAction::Index, 1).await.unwrap();

        let rows = store.load_claimable("s", 100, 1_000, 10).await.unwrap();
        let urls: Vec<_> = rows.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://s/old", "https://s/new"]);

        assert_eq!(store.pending_shops(100, 1_000).await.unwrap(), vec!["s", "t"]);
    }

    #[tokio::test]
    async fn test_stream_group_delivery_and_ack() {
        let bus = InMemoryStreamBus::new();
        bus.ensure_group("jobs", "g").await.unwrap();
        bus.publish("jobs", "a").await.unwrap();
        bus.publish("jobs", "b").await.unwrap();

        let first = bus.read_group("jobs", "g", "c1", 1, Duration::ZERO).await.unwrap();
        assert_eq!(first[0].payload.as_deref(), Some("a"));
        let second = bus.read_group("jobs", "g", "c2", 10, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload.as_deref(), Some("b"));

        assert_eq!(bus.backlog("jobs", "g").await.unwrap(), 2);
        bus.ack("jobs", "g", &first[0].id).await.unwrap();
        assert_eq!(bus.backlog("jobs", "g").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_group_starts_at_tail() {
        let bus = InMemoryStreamBus::new();
        bus.publish("jobs", "before").await.unwrap();
        bus.ensure_group("jobs", "g").await.unwrap();
        bus.ensure_group("jobs", "g").await.unwrap();
        bus.publish("jobs", "after").await.unwrap();

        let got = bus.read_group("jobs", "g", "c", 10, Duration::ZERO).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn test_reclaim_idle_counts_deliveries() {
        let bus = InMemoryStreamBus::new();
        bus.ensure_group("jobs", "g").await.unwrap();
        bus.publish("jobs", "a").await.unwrap();
        bus.read_group("jobs", "g", "dead", 1, Duration::ZERO).await.unwrap();

        assert!(bus.reclaim_idle("jobs", "g", "live", Duration::from_secs(60), 10).await.unwrap().is_empty());
        let taken = bus.reclaim_idle("jobs", "g", "live", Duration::ZERO, 10).await.unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].deliveries, 2);
    }

    #[tokio::test]
    async fn test_read_group_without_group_errors() {
        let bus = InMemoryStreamBus::new();
        assert!(bus.read_group("jobs", "missing", "c", 1, Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn test_quota_reserve_caps_at_limit() {
        let quota = InMemoryQuotaStore::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(quota.reserve_up_to("k", 10, 7, ttl).await.unwrap(), 7);
        assert_eq!(quota.reserve_up_to("k", 10, 7, ttl).await.unwrap(), 3);
        assert_eq!(quota.reserve_up_to("k", 10, 1, ttl).await.unwrap(), 0);
        assert_eq!(quota.used("k").await.unwrap(), 10);
    }
}
