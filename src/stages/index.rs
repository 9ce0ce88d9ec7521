// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! L2: submit a batch to its engine and publish one outcome per URL.
//!
//! The stage never writes the backlog. Every URL of a batch yields exactly one
//! [`Outcome`]:
//!
//! | Situation                           | Result              | Quota used |
//! |-------------------------------------|---------------------|------------|
//! | shop missing or inactive            | `INVALID`           | no         |
//! | credential missing or unusable      | `PERMISSION_DENIED` | no         |
//! | URL not absolute http(s)            | `INVALID`           | no         |
//! | claim superseded or released        | none (skipped)      | no         |
//! | daily quota already spent           | `RATE_LIMITED`      | no         |
//! | submitted                           | classified response | yes        |
//!
//! A URL whose entry is no longer PROCESSING under this batch's token (a newer
//! event reset it, or another batch reclaimed it) is dropped without an outcome.
//!
//! Quota is reserved per API call, right before the call, so concurrent workers
//! can never submit more than the daily limit between them.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{MessageHandler, Stage, StageError};
use crate::cipher::Cipher;
use crate::engines::{ApiResponse, EngineConnector, IndexingApi};
use crate::messages::{Batch, Outcome, OutcomeResult, Stream, StreamMessage};
use crate::model::{now_millis, ShopProfile};
use crate::quota::QuotaTracker;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::{BacklogStore, StreamBus};
use crate::transition::SHOP_INACTIVE;

pub const QUOTA_EXHAUSTED: &str = "daily quota exhausted";

/// Whether the indexing APIs can accept `url` at all.
pub fn is_submittable(url: &str) -> bool {
    match url::Url::parse(url.trim()) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some(),
        Err(_) => false,
    }
}

/// Per-batch counters, mostly for tests and logs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexReport {
    pub submitted: usize,
    pub quota_rejected: usize,
    pub invalid: usize,
    pub superseded: usize,
    pub outcomes: usize,
}

pub struct IndexStage {
    backlog: Arc<dyn BacklogStore>,
    bus: Arc<dyn StreamBus>,
    quota: QuotaTracker,
    cipher: Arc<Cipher>,
    connector: Arc<dyn EngineConnector>,
    outcomes_stream: String,
}

impl IndexStage {
    pub fn new(
        backlog: Arc<dyn BacklogStore>,
        bus: Arc<dyn StreamBus>,
        quota: QuotaTracker,
        cipher: Arc<Cipher>,
        connector: Arc<dyn EngineConnector>,
        key_prefix: Option<&str>,
    ) -> Self {
        Self {
            backlog,
            bus,
            quota,
            cipher,
            connector,
            outcomes_stream: Stream::Outcomes.key(key_prefix),
        }
    }

    fn client_for(&self, profile: &ShopProfile, batch: &Batch) -> Result<Arc<dyn IndexingApi>, String> {
        let blob = profile
            .credential(batch.engine)
            .ok_or_else(|| format!("no {} credential configured", batch.engine))?;
        let credential = self.cipher.decrypt(blob).map_err(|e| format!("credential unreadable: {}", e))?;
        self.connector
            .connect(batch.engine, &credential, &profile.site_url())
            .map_err(|e| e.to_string())
    }

    #[tracing::instrument(skip(self, batch), fields(batch_id = %batch.batch_id, shop = %batch.shop, engine = %batch.engine))]
    pub async fn index(&self, batch: &Batch) -> Result<IndexReport, StageError> {
        let mut report = IndexReport::default();

        let profile = self.backlog.shop_profile(&batch.shop).await?.filter(|p| p.active);
        let Some(profile) = profile else {
            info!(urls = batch.urls.len(), "Shop inactive, rejecting batch");
            let outcomes = local_outcomes(batch, &batch.urls, OutcomeResult::Invalid, SHOP_INACTIVE);
            report.invalid = outcomes.len();
            report.outcomes += self.publish_outcomes(outcomes).await?;
            return Ok(report);
        };

        let api = match self.client_for(&profile, batch) {
            Ok(api) => api,
            Err(reason) => {
                warn!(reason = %reason, "Cannot build engine client");
                let outcomes = local_outcomes(batch, &batch.urls, OutcomeResult::PermissionDenied, &reason);
                report.outcomes += self.publish_outcomes(outcomes).await?;
                return Ok(report);
            }
        };

        let (valid, malformed): (Vec<String>, Vec<String>) =
            batch.urls.iter().cloned().partition(|u| is_submittable(u));
        if !malformed.is_empty() {
            debug!(count = malformed.len(), "Rejecting malformed urls");
            let outcomes = local_outcomes(batch, &malformed, OutcomeResult::Invalid, "malformed url");
            report.invalid += outcomes.len();
            report.outcomes += self.publish_outcomes(outcomes).await?;
        }

        let live = self.still_claimed(batch, valid).await?;
        report.superseded = batch.urls.len() - report.invalid - live.len();
        if report.superseded > 0 {
            debug!(count = report.superseded, "Skipping urls no longer claimed by this batch");
            crate::metrics::record_stale_urls_skipped(batch.engine.as_str(), report.superseded);
        }

        let limit = profile.daily_limit(batch.engine);
        for chunk in live.chunks(api.batch_limit().max(1)) {
            let granted = self
                .quota
                .reserve(&batch.shop, batch.engine, limit, chunk.len() as u32, now_millis())
                .await? as usize;
            let (accepted, refused) = chunk.split_at(granted.min(chunk.len()));

            let mut outcomes = Vec::with_capacity(chunk.len());
            if !accepted.is_empty() {
                let started = Instant::now();
                let responses = api.submit_batch(accepted, batch.action).await;
                crate::metrics::record_api_call(batch.engine.as_str(), accepted.len(), started.elapsed());
                outcomes.extend(align(accepted, responses).into_iter().map(|r| outcome_from(batch, r)));
                report.submitted += accepted.len();
            }
            if !refused.is_empty() {
                crate::metrics::record_quota_rejections(batch.engine.as_str(), refused.len());
                outcomes.extend(local_outcomes(batch, refused, OutcomeResult::RateLimited, QUOTA_EXHAUSTED));
                report.quota_rejected += refused.len();
            }
            report.outcomes += self.publish_outcomes(outcomes).await?;
        }

        info!(
            submitted = report.submitted,
            quota_rejected = report.quota_rejected,
            invalid = report.invalid,
            superseded = report.superseded,
            "Batch indexed"
        );
        Ok(report)
    }

    /// Keep the URLs whose entry is still claimed by this batch.
    async fn still_claimed(&self, batch: &Batch, urls: Vec<String>) -> Result<Vec<String>, StageError> {
        let mut live = Vec::with_capacity(urls.len());
        for url in urls {
            let entry = self.backlog.get_entry(&batch.shop, &url).await?;
            if entry.is_some_and(|e| e.is_held_by(&batch.batch_id)) {
                live.push(url);
            }
        }
        Ok(live)
    }

    async fn publish_outcomes(&self, outcomes: Vec<Outcome>) -> Result<usize, StageError> {
        let count = outcomes.len();
        for outcome in outcomes {
            crate::metrics::record_url_result(outcome.engine.as_str(), outcome.result.as_str());
            let payload = StreamMessage::from(outcome).encode()?;
            retry("publish_outcome", &RetryConfig::publish(), || {
                self.bus.publish(&self.outcomes_stream, &payload)
            })
            .await?;
        }
        Ok(count)
    }
}

/// Pair responses with the URLs sent, filling gaps left by a short reply.
fn align(sent: &[String], responses: Vec<ApiResponse>) -> Vec<ApiResponse> {
    let mut responses = responses.into_iter();
    sent.iter()
        .map(|url| {
            responses
                .next()
                .unwrap_or_else(|| ApiResponse::local(url, OutcomeResult::TransientError, "no response for url"))
        })
        .collect()
}

fn outcome_from(batch: &Batch, response: ApiResponse) -> Outcome {
    Outcome {
        batch_id: batch.batch_id.clone(),
        shop: batch.shop.clone(),
        url: response.url,
        engine: batch.engine,
        result: response.result,
        http_status: response.http_status,
        message: response.message,
    }
}

fn local_outcomes(batch: &Batch, urls: &[String], result: OutcomeResult, message: &str) -> Vec<Outcome> {
    urls.iter()
        .map(|url| outcome_from(batch, ApiResponse::local(url, result, message)))
        .collect()
}

#[async_trait]
impl MessageHandler for IndexStage {
    fn stage(&self) -> Stage {
        Stage::Index
    }

    async fn handle(&self, message: StreamMessage) -> Result<(), StageError> {
        let batch = Batch::try_from(message)?;
        self.index(&batch).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::ApiError;
    use crate::model::{Engine, IndexAction, UrlEntry, UrlStatus};
    use crate::storage::memory::{InMemoryBacklog, InMemoryQuotaStore, InMemoryStreamBus};
    use crate::storage::traits::QuotaStore;
    use parking_lot::Mutex;

    const KEY: [u8; 32] = [3u8; 32];

    /// Answers every URL with a fixed status and remembers what it was sent.
    struct FixedApi {
        status: u16,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl IndexingApi for FixedApi {
        fn engine(&self) -> Engine {
            Engine::Google
        }

        fn batch_limit(&self) -> usize {
            2
        }

        async fn submit_batch(&self, urls: &[String], _action: IndexAction) -> Vec<ApiResponse> {
            self.calls.lock().push(urls.to_vec());
            urls.iter().map(|u| ApiResponse::from_status(u, Some(self.status), "")).collect()
        }
    }

    struct FixedConnector(Arc<FixedApi>);

    impl EngineConnector for FixedConnector {
        fn connect(&self, engine: Engine, credential: &str, _site: &str) -> Result<Arc<dyn IndexingApi>, ApiError> {
            if credential != "secret" {
                return Err(ApiError::Credential { engine, reason: "wrong secret".into() });
            }
            Ok(self.0.clone())
        }
    }

    struct Fixture {
        backlog: Arc<InMemoryBacklog>,
        bus: Arc<InMemoryStreamBus>,
        quota: Arc<InMemoryQuotaStore>,
        api: Arc<FixedApi>,
        stage: IndexStage,
    }

    async fn fixture(profile: Option<ShopProfile>, status: u16) -> Fixture {
        let backlog = Arc::new(InMemoryBacklog::new());
        if let Some(p) = profile {
            backlog.upsert_shop(&p).await.unwrap();
        }
        let bus = Arc::new(InMemoryStreamBus::new());
        let quota = Arc::new(InMemoryQuotaStore::new());
        let api = Arc::new(FixedApi { status, calls: Mutex::new(Vec::new()) });
        let stage = IndexStage::new(
            backlog.clone(),
            bus.clone(),
            QuotaTracker::new(quota.clone(), None),
            Arc::new(Cipher::new(KEY)),
            Arc::new(FixedConnector(api.clone())),
            None,
        );
        Fixture { backlog, bus, quota, api, stage }
    }

    impl Fixture {
        /// A batch whose entries are all claimed under its token.
        fn claimed(&self, urls: &[&str]) -> Batch {
            let batch = batch(urls);
            for url in urls {
                let mut entry = UrlEntry::pending("s", url, IndexAction::Index, 1);
                entry.status = UrlStatus::Processing;
                entry.claimed_at = Some(now_millis());
                entry.claim_token = Some(batch.batch_id.clone());
                entry.attempts = 1;
                self.backlog.insert_entry(entry);
            }
            batch
        }
    }

    fn profile(limit: u32) -> ShopProfile {
        let mut p = ShopProfile::new("s");
        p.google_credential = Some(Cipher::new(KEY).encrypt("secret").unwrap());
        p.google_daily_limit = Some(limit);
        p
    }

    fn batch(urls: &[&str]) -> Batch {
        Batch {
            batch_id: "b-1".into(),
            shop: "s".into(),
            engine: Engine::Google,
            action: IndexAction::Index,
            urls: urls.iter().map(|u| u.to_string()).collect(),
            attempts_so_far: 1,
        }
    }

    fn outcomes(bus: &InMemoryStreamBus) -> Vec<Outcome> {
        bus.payloads("outcomes")
            .iter()
            .map(|p| Outcome::try_from(StreamMessage::decode(p).unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn test_is_submittable() {
        assert!(is_submittable("https://shop.example/p/1"));
        assert!(is_submittable("http://shop.example"));
        assert!(!is_submittable("ftp://shop.example/file"));
        assert!(!is_submittable("/relative/path"));
        assert!(!is_submittable("not a url"));
    }

    #[tokio::test]
    async fn test_submits_in_api_sized_chunks() {
        let f = fixture(Some(profile(100)), 200).await;
        let report = f
            .stage
            .index(&f.claimed(&["https://s/a", "https://s/b", "https://s/c"]))
            .await
            .unwrap();

        assert_eq!(report.submitted, 3);
        assert_eq!(f.api.calls.lock().len(), 2);
        let out = outcomes(&f.bus);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|o| o.result == OutcomeResult::Success && o.batch_id == "b-1"));
    }

    #[tokio::test]
    async fn test_quota_shortfall_is_rate_limited_without_a_call() {
        let f = fixture(Some(profile(3)), 200).await;
        let key = QuotaTracker::new(f.quota.clone(), None).key("s", Engine::Google, now_millis());
        f.quota.set_used(&key, 2);

        let report = f
            .stage
            .index(&f.claimed(&["https://s/a", "https://s/b", "https://s/c"]))
            .await
            .unwrap();

        assert_eq!(report.submitted, 1);
        assert_eq!(report.quota_rejected, 2);
        let calls = f.api.calls.lock().clone();
        assert_eq!(calls, vec![vec!["https://s/a".to_string()]]);

        let out = outcomes(&f.bus);
        assert_eq!(out.iter().filter(|o| o.result == OutcomeResult::RateLimited).count(), 2);
        assert_eq!(f.quota.used(&key).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_inactive_shop_yields_invalid() {
        let mut p = profile(100);
        p.active = false;
        let f = fixture(Some(p), 200).await;

        f.stage.index(&batch(&["https://s/a"])).await.unwrap();
        let out = outcomes(&f.bus);
        assert_eq!(out[0].result, OutcomeResult::Invalid);
        assert_eq!(out[0].message, SHOP_INACTIVE);
        assert!(f.api.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_bad_credential_yields_permission_denied() {
        let mut p = profile(100);
        p.google_credential = Some(Cipher::new(KEY).encrypt("wrong").unwrap());
        let f = fixture(Some(p), 200).await;

        f.stage.index(&batch(&["https://s/a", "https://s/b"])).await.unwrap();
        let out = outcomes(&f.bus);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|o| o.result == OutcomeResult::PermissionDenied));
    }

    #[tokio::test]
    async fn test_malformed_urls_skip_quota() {
        let f = fixture(Some(profile(100)), 200).await;
        let report = f.stage.index(&f.claimed(&["nope", "https://s/a"])).await.unwrap();

        assert_eq!(report.invalid, 1);
        assert_eq!(report.submitted, 1);
        let key = QuotaTracker::new(f.quota.clone(), None).key("s", Engine::Google, now_millis());
        assert_eq!(f.quota.used(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_superseded_urls_are_not_submitted() {
        let f = fixture(Some(profile(100)), 200).await;
        let batch = f.claimed(&["https://s/a", "https://s/b", "https://s/c"]);
        // A newer event resets one entry, another batch took over a second
        f.backlog
            .record_event("s", "https://s/b", IndexAction::Index, now_millis())
            .await
            .unwrap();
        let mut taken = f.backlog.get_entry("s", "https://s/c").await.unwrap().unwrap();
        taken.claim_token = Some("b-2".into());
        f.backlog.insert_entry(taken);

        let report = f.stage.index(&batch).await.unwrap();

        assert_eq!(report.submitted, 1);
        assert_eq!(report.superseded, 2);
        assert_eq!(f.api.calls.lock().clone(), vec![vec!["https://s/a".to_string()]]);
        let key = QuotaTracker::new(f.quota.clone(), None).key("s", Engine::Google, now_millis());
        assert_eq!(f.quota.used(&key).await.unwrap(), 1);
        let out = outcomes(&f.bus);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].url, "https://s/a");
    }

    #[test]
    fn test_align_fills_missing_responses() {
        let sent = vec!["https://s/a".to_string(), "https://s/b".to_string()];
        let aligned = align(&sent, vec![ApiResponse::from_status("https://s/a", Some(200), "")]);
        assert_eq!(aligned.len(), 2);
        assert_eq!(aligned[1].result, OutcomeResult::TransientError);
        assert_eq!(aligned[1].url, "https://s/b");
    }
}
