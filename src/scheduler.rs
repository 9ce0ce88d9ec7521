//! Periodic job scheduler.
//!
//! Every tick publishes one [`Job`] per shop that has claimable work. The scheduler
//! holds no state that matters for correctness: a lost tick (or a crashed scheduler)
//! only delays work until the next one, and duplicate jobs are harmless because L1
//! claims entries with a compare-and-swap.
//!
//! Optional per-shop spacing and daily caps are kept in memory and reset on restart.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::messages::{Job, Stream, StreamMessage};
use crate::model::now_millis;
use crate::quota::day_label;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::{BacklogStore, StorageError, StreamBus};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub key_prefix: Option<String>,
    pub interval: Duration,
    pub claim_lease_ms: i64,
    /// Zero disables spacing
    pub min_shop_interval: Duration,
    /// Zero disables the cap
    pub max_jobs_per_shop_per_day: u32,
}

impl From<&crate::config::PipelineConfig> for SchedulerSettings {
    fn from(config: &crate::config::PipelineConfig) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            interval: config.schedule_interval(),
            claim_lease_ms: config.claim_lease_ms(),
            min_shop_interval: Duration::from_secs(config.min_shop_interval_secs),
            max_jobs_per_shop_per_day: config.max_jobs_per_shop_per_day,
        }
    }
}

/// Result of one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScheduleReport {
    pub scheduled: usize,
    /// Held back by spacing or the daily cap
    pub skipped: usize,
    /// Publish failed after retries
    pub failed: usize,
}

#[derive(Debug, Clone)]
struct ShopHistory {
    last_job_at: i64,
    day: String,
    jobs_today: u32,
}

/// Wakes a running scheduler early (e.g. after a webhook burst).
#[derive(Clone)]
pub struct SchedulerHandle {
    wake: Arc<Notify>,
}

impl SchedulerHandle {
    pub fn trigger(&self) {
        self.wake.notify_one();
    }
}

pub struct Scheduler {
    backlog: Arc<dyn BacklogStore>,
    bus: Arc<dyn StreamBus>,
    settings: SchedulerSettings,
    jobs_stream: String,
    history: DashMap<String, ShopHistory>,
    wake: Arc<Notify>,
}

impl Scheduler {
    pub fn new(backlog: Arc<dyn BacklogStore>, bus: Arc<dyn StreamBus>, settings: SchedulerSettings) -> Self {
        let jobs_stream = Stream::Jobs.key(settings.key_prefix.as_deref());
        Self {
            backlog,
            bus,
            settings,
            jobs_stream,
            history: DashMap::new(),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle { wake: self.wake.clone() }
    }

    /// Whether spacing and the daily cap allow another job for `shop` at `now`.
    fn allowed(&self, shop: &str, now: i64) -> bool {
        let Some(history) = self.history.get(shop) else {
            return true;
        };
        let spacing = self.settings.min_shop_interval.as_millis() as i64;
        if spacing > 0 && now - history.last_job_at < spacing {
            return false;
        }
        let cap = self.settings.max_jobs_per_shop_per_day;
        !(cap > 0 && history.day == day_label(now) && history.jobs_today >= cap)
    }

    fn remember(&self, shop: &str, now: i64) {
        let today = day_label(now);
        self.history
            .entry(shop.to_string())
            .and_modify(|h| {
                if h.day != today {
                    h.day = today.clone();
                    h.jobs_today = 0;
                }
                h.jobs_today += 1;
                h.last_job_at = now;
            })
            .or_insert_with(|| ShopHistory { last_job_at: now, day: today.clone(), jobs_today: 1 });
    }

    async fn publish_job(&self, shop: &str, now: i64) -> Result<String, StorageError> {
        let job = Job { shop: shop.to_string(), triggered_at: now };
        let payload = StreamMessage::from(job)
            .encode()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        retry("publish_job", &RetryConfig::publish(), || {
            self.bus.publish(&self.jobs_stream, &payload)
        })
        .await
    }

    /// Publish jobs for every shop with claimable entries.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self, now: i64) -> Result<ScheduleReport, StorageError> {
        let shops = self.backlog.pending_shops(now, self.settings.claim_lease_ms).await?;
        let mut report = ScheduleReport::default();

        for shop in shops {
            if !self.allowed(&shop, now) {
                debug!(shop = %shop, "Shop held back by spacing or daily cap");
                report.skipped += 1;
                continue;
            }
            match self.publish_job(&shop, now).await {
                Ok(_) => {
                    self.remember(&shop, now);
                    report.scheduled += 1;
                }
                Err(e) => {
                    warn!(shop = %shop, error = %e, "Job publish failed, retrying next tick");
                    report.failed += 1;
                }
            }
        }

        crate::metrics::record_jobs_scheduled("scheduled", report.scheduled);
        crate::metrics::record_jobs_scheduled("skipped", report.skipped);
        crate::metrics::record_jobs_scheduled("failed", report.failed);
        if report.scheduled > 0 || report.failed > 0 {
            info!(scheduled = report.scheduled, skipped = report.skipped, failed = report.failed, "Tick complete");
        }
        Ok(report)
    }

    /// Publish a job for one shop now, bypassing spacing and caps.
    pub async fn trigger_shop(&self, shop: &str) -> Result<String, StorageError> {
        let now = now_millis();
        let id = self.publish_job(shop, now).await?;
        self.remember(shop, now);
        crate::metrics::record_jobs_scheduled("scheduled", 1);
        info!(shop, message_id = %id, "Job triggered");
        Ok(id)
    }

    /// Tick on the interval and whenever a [`SchedulerHandle`] fires, until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.interval.max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.settings.interval, "Scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => debug!("Scheduler woken early"),
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(e) = self.tick(now_millis()).await {
                warn!(error = %e, "Tick failed, backlog unavailable");
                crate::metrics::record_stage_error("scheduler", "backlog");
            }
        }

        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IndexAction, UrlEntry, UrlStatus};
    use crate::storage::memory::{InMemoryBacklog, InMemoryStreamBus};

    const NOW: i64 = 1_740_000_000_000;

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            key_prefix: Some("t:".into()),
            interval: Duration::from_secs(60),
            claim_lease_ms: 1_000,
            min_shop_interval: Duration::ZERO,
            max_jobs_per_shop_per_day: 0,
        }
    }

    fn setup(settings: SchedulerSettings) -> (Arc<InMemoryBacklog>, Arc<InMemoryStreamBus>, Scheduler) {
        let backlog = Arc::new(InMemoryBacklog::new());
        let bus = Arc::new(InMemoryStreamBus::new());
        let scheduler = Scheduler::new(backlog.clone(), bus.clone(), settings);
        (backlog, bus, scheduler)
    }

    fn jobs(bus: &InMemoryStreamBus) -> Vec<Job> {
        bus.payloads("t:jobs")
            .iter()
            .map(|p| Job::try_from(StreamMessage::decode(p).unwrap()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_one_job_per_shop_with_claimable_work() {
        let (backlog, bus, scheduler) = setup(settings());
        backlog.insert_entry(UrlEntry::pending("a", "https://a/1", IndexAction::Index, 1));
        backlog.insert_entry(UrlEntry::pending("a", "https://a/2", IndexAction::Index, 1));
        backlog.insert_entry(UrlEntry::pending("b", "https://b/1", IndexAction::Delete, 1));
        backlog.insert_entry(UrlEntry::pending("c", "https://c/1", IndexAction::Ignore, 1));
        let mut done = UrlEntry::pending("d", "https://d/1", IndexAction::Index, 1);
        done.status = UrlStatus::Completed;
        backlog.insert_entry(done);

        let report = scheduler.tick(NOW).await.unwrap();
        assert_eq!(report, ScheduleReport { scheduled: 2, skipped: 0, failed: 0 });

        let shops: Vec<String> = jobs(&bus).into_iter().map(|j| j.shop).collect();
        assert_eq!(shops, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_spacing_holds_back_repeat_jobs() {
        let (backlog, _bus, scheduler) = setup(SchedulerSettings {
            min_shop_interval: Duration::from_secs(30),
            ..settings()
        });
        backlog.insert_entry(UrlEntry::pending("a", "https://a/1", IndexAction::Index, 1));

        assert_eq!(scheduler.tick(NOW).await.unwrap().scheduled, 1);
        assert_eq!(scheduler.tick(NOW + 10_000).await.unwrap().skipped, 1);
        assert_eq!(scheduler.tick(NOW + 30_000).await.unwrap().scheduled, 1);
    }

    #[tokio::test]
    async fn test_daily_cap_resets_next_day() {
        let (backlog, _bus, scheduler) = setup(SchedulerSettings {
            max_jobs_per_shop_per_day: 2,
            ..settings()
        });
        backlog.insert_entry(UrlEntry::pending("a", "https://a/1", IndexAction::Index, 1));

        assert_eq!(scheduler.tick(NOW).await.unwrap().scheduled, 1);
        assert_eq!(scheduler.tick(NOW + 1).await.unwrap().scheduled, 1);
        assert_eq!(scheduler.tick(NOW + 2).await.unwrap().skipped, 1);
        assert_eq!(scheduler.tick(NOW + 86_400_000).await.unwrap().scheduled, 1);
    }

    #[tokio::test]
    async fn test_handle_wakes_running_scheduler() {
        let (backlog, bus, scheduler) = setup(SchedulerSettings {
            interval: Duration::from_secs(3600),
            ..settings()
        });
        let scheduler = Arc::new(scheduler);
        let handle = scheduler.handle();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(scheduler.clone().run(rx));

        // The first interval tick fires immediately, before any work exists
        tokio::time::sleep(Duration::from_millis(50)).await;
        backlog.record_event("a", "https://a/1", IndexAction::Index, 1).await.unwrap();
        handle.trigger();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(jobs(&bus).len(), 1);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_trigger_shop_publishes_directly() {
        let (_backlog, bus, scheduler) = setup(settings());
        scheduler.trigger_shop("manual").await.unwrap();
        assert_eq!(jobs(&bus)[0].shop, "manual");
    }
}
