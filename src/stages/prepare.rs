//! L1: turn a shop job into claimed, engine-specific batches.
//!
//! For each job the stage loads the shop's claimable entries, routes every entry to
//! the first engine (in the shop's preference order) that supports its action and
//! still has budget today, claims each chunk under a fresh batch id and publishes it.
//! Entries no usable engine can take are left untouched.
//!
//! Routing partitions the backlog: a URL goes to one engine per claim, never to
//! Google and Bing both. An entry carries a single status, claim token and attempt
//! count, so two engines' results could not be recorded independently. A shop
//! that prefers both engines therefore spreads its URLs across them instead of
//! submitting each URL twice. Per-engine tracking would need one backlog row per
//! (url, engine).

use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{MessageHandler, Stage, StageError};
use crate::backpressure::BackpressureLevel;
use crate::cipher::Cipher;
use crate::messages::{Batch, Job, Stream, StreamMessage, MAX_BATCH_URLS};
use crate::model::{now_millis, Engine, IndexAction, ShopProfile, UrlEntry};
use crate::quota::QuotaTracker;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::{BacklogStore, Claim, StreamBus};

#[derive(Debug, Clone)]
pub struct PrepareSettings {
    pub key_prefix: Option<String>,
    pub load_limit: usize,
    pub claim_lease_ms: i64,
    pub max_attempts: u32,
    pub batches_backlog_threshold: u64,
}

impl From<&crate::config::PipelineConfig> for PrepareSettings {
    fn from(config: &crate::config::PipelineConfig) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            load_limit: config.prepare_load_limit,
            claim_lease_ms: config.claim_lease_ms(),
            max_attempts: config.max_attempts,
            batches_backlog_threshold: config.batches_backlog_threshold,
        }
    }
}

/// What one job produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrepareReport {
    pub loaded: usize,
    pub claimed: usize,
    /// Lost to a concurrent claim or a newer event
    pub conflicts: usize,
    /// Left PENDING: no engine with budget supports the action
    pub unrouted: usize,
    pub batches: Vec<Batch>,
}

/// An engine this shop can use right now, with today's remaining budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineBudget {
    pub engine: Engine,
    pub remaining: u32,
}

/// Route each entry to the first engine that supports its action and has budget.
///
/// Returns the groups in first-seen order plus the number of entries left over.
/// Budgets are decremented in place.
pub fn route(
    entries: Vec<UrlEntry>,
    budgets: &mut [EngineBudget],
) -> (Vec<(Engine, IndexAction, Vec<UrlEntry>)>, usize) {
    let mut groups: Vec<(Engine, IndexAction, Vec<UrlEntry>)> = Vec::new();
    let mut unrouted = 0;

    for entry in entries {
        let action = entry.index_action;
        let Some(slot) = budgets
            .iter_mut()
            .find(|b| b.remaining > 0 && b.engine.supports(action))
        else {
            unrouted += 1;
            continue;
        };
        slot.remaining -= 1;
        let engine = slot.engine;

        match groups.iter_mut().find(|(e, a, _)| *e == engine && *a == action) {
            Some((_, _, group)) => group.push(entry),
            None => groups.push((engine, action, vec![entry])),
        }
    }

    (groups, unrouted)
}

pub struct PrepareStage {
    backlog: Arc<dyn BacklogStore>,
    bus: Arc<dyn StreamBus>,
    quota: QuotaTracker,
    cipher: Arc<Cipher>,
    settings: PrepareSettings,
    batches_stream: String,
    last_level: AtomicU8,
}

impl PrepareStage {
    pub fn new(
        backlog: Arc<dyn BacklogStore>,
        bus: Arc<dyn StreamBus>,
        quota: QuotaTracker,
        cipher: Arc<Cipher>,
        settings: PrepareSettings,
    ) -> Self {
        let batches_stream = Stream::Batches.key(settings.key_prefix.as_deref());
        Self {
            backlog,
            bus,
            quota,
            cipher,
            settings,
            batches_stream,
            last_level: AtomicU8::new(BackpressureLevel::Normal as u8),
        }
    }

    /// Current backpressure from the indexing group's backlog.
    pub async fn backpressure(&self) -> Result<BackpressureLevel, StageError> {
        let backlog = self.bus.backlog(&self.batches_stream, Stage::Index.group()).await?;
        let level = BackpressureLevel::from_backlog(backlog, self.settings.batches_backlog_threshold);

        crate::metrics::set_batch_backlog(backlog);
        crate::metrics::set_backpressure_level(level as u8);
        let previous = self.last_level.swap(level as u8, Ordering::Relaxed);
        if previous != level as u8 {
            info!(backlog, level = %level, "{}", level.description());
        }
        Ok(level)
    }

    /// Engines with a credential that decrypts, in preference order, with budgets.
    async fn usable_engines(&self, profile: &ShopProfile, now: i64) -> Result<Vec<EngineBudget>, StageError> {
        let mut usable: Vec<EngineBudget> = Vec::new();
        for &engine in &profile.engines {
            if usable.iter().any(|b| b.engine == engine) {
                continue;
            }
            let Some(blob) = profile.credential(engine) else {
                continue;
            };
            if let Err(e) = self.cipher.decrypt(blob) {
                warn!(shop = %profile.shop, engine = %engine, error = %e, "Skipping engine with unreadable credential");
                continue;
            }
            let remaining = self
                .quota
                .remaining(&profile.shop, engine, profile.daily_limit(engine), now)
                .await?;
            usable.push(EngineBudget { engine, remaining });
        }
        Ok(usable)
    }

    /// Prepare one shop. Safe to repeat: entries already claimed are not claimable.
    #[tracing::instrument(skip(self, job), fields(shop = %job.shop))]
    pub async fn prepare(&self, job: &Job) -> Result<PrepareReport, StageError> {
        let mut report = PrepareReport::default();

        let Some(profile) = self.backlog.shop_profile(&job.shop).await? else {
            warn!("No profile for shop, dropping job");
            return Ok(report);
        };
        if !profile.active {
            debug!("Shop inactive, nothing to prepare");
            return Ok(report);
        }

        let now = now_millis();
        let mut budgets = self.usable_engines(&profile, now).await?;
        if budgets.is_empty() {
            debug!("No usable engine credentials");
            return Ok(report);
        }
        if budgets.iter().all(|b| b.remaining == 0) {
            debug!("Daily quota exhausted on every engine");
            return Ok(report);
        }

        let entries = self
            .backlog
            .load_claimable(&job.shop, now, self.settings.claim_lease_ms, self.settings.load_limit)
            .await?;
        report.loaded = entries.len();

        let (groups, unrouted) = route(entries, &mut budgets);
        report.unrouted = unrouted;

        for (engine, action, group) in groups {
            let limit = engine.batch_limit().clamp(1, MAX_BATCH_URLS);
            for chunk in group.chunks(limit) {
                if let Some(batch) = self.claim_and_publish(&job.shop, engine, action, chunk, now, &mut report).await? {
                    report.batches.push(batch);
                }
            }
        }

        info!(
            loaded = report.loaded,
            claimed = report.claimed,
            conflicts = report.conflicts,
            unrouted = report.unrouted,
            batches = report.batches.len(),
            "Shop prepared"
        );
        Ok(report)
    }

    async fn claim_and_publish(
        &self,
        shop: &str,
        engine: Engine,
        action: IndexAction,
        chunk: &[UrlEntry],
        now: i64,
        report: &mut PrepareReport,
    ) -> Result<Option<Batch>, StageError> {
        let claim = Claim {
            token: uuid::Uuid::new_v4().to_string(),
            now,
            lease_ms: self.settings.claim_lease_ms,
            max_attempts: self.settings.max_attempts,
        };

        let won = self.backlog.try_claim_all(chunk, &claim).await?;
        let conflicts = chunk.len() - won.len();
        report.conflicts += conflicts;
        if conflicts > 0 {
            debug!(engine = %engine, conflicts, "Entries claimed elsewhere or superseded");
            crate::metrics::record_claim_conflicts(conflicts);
        }
        if won.is_empty() {
            return Ok(None);
        }

        let attempts_so_far = won
            .iter()
            .map(|e| e.attempts_after_claim(self.settings.max_attempts))
            .max()
            .unwrap_or(1);

        let batch = Batch {
            batch_id: claim.token,
            shop: shop.to_string(),
            engine,
            action,
            urls: won.into_iter().map(|e| e.url).collect(),
            attempts_so_far,
        };
        let payload = StreamMessage::from(batch.clone()).encode()?;

        // On failure the claims expire with the lease and the entries are retried
        retry("publish_batch", &RetryConfig::publish(), || {
            self.bus.publish(&self.batches_stream, &payload)
        })
        .await?;

        report.claimed += batch.urls.len();
        crate::metrics::record_entries_claimed(engine.as_str(), batch.urls.len());
        crate::metrics::record_batch_published(engine.as_str(), batch.urls.len());
        debug!(batch_id = %batch.batch_id, engine = %engine, action = %action, urls = batch.urls.len(), "Batch published");
        Ok(Some(batch))
    }
}

#[async_trait]
impl MessageHandler for PrepareStage {
    fn stage(&self) -> Stage {
        Stage::Prepare
    }

    async fn admit(&self, requested: usize) -> Result<usize, StageError> {
        Ok(self.backpressure().await?.read_count(requested))
    }

    async fn handle(&self, message: StreamMessage) -> Result<(), StageError> {
        let job = Job::try_from(message)?;
        self.prepare(&job).await.map(|_| ())
    }
}
