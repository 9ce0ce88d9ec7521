//! L3: apply outcomes to the backlog.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{MessageHandler, Stage, StageError};
use crate::messages::{Outcome, StreamMessage};
use crate::model::now_millis;
use crate::storage::traits::BacklogStore;
use crate::transition::{self, Resolution, TransitionPolicy};

/// What happened to one outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveDisposition {
    Applied(Resolution),
    /// The entry moved on (new event, new claim, or already resolved)
    Superseded,
}

pub struct SaveStage {
    backlog: Arc<dyn BacklogStore>,
    policy: TransitionPolicy,
}

impl SaveStage {
    pub fn new(backlog: Arc<dyn BacklogStore>, policy: TransitionPolicy) -> Self {
        Self { backlog, policy }
    }

    #[tracing::instrument(skip(self, outcome), fields(batch_id = %outcome.batch_id, url = %outcome.url))]
    pub async fn apply(&self, outcome: &Outcome) -> Result<SaveDisposition, StageError> {
        let entry = self.backlog.get_entry(&outcome.shop, &outcome.url).await?;
        let Some(entry) = entry.filter(|e| e.is_held_by(&outcome.batch_id)) else {
            debug!("Outcome superseded");
            crate::metrics::record_outcome_superseded();
            return Ok(SaveDisposition::Superseded);
        };

        let active = self
            .backlog
            .shop_profile(&outcome.shop)
            .await?
            .is_some_and(|p| p.active);

        let now = now_millis();
        let resolution = transition::for_outcome(&entry, outcome, active, &self.policy, now);

        // The read above is advisory; this CAS decides
        if !self
            .backlog
            .resolve(&outcome.shop, &outcome.url, &outcome.batch_id, &resolution, now)
            .await?
        {
            debug!("Outcome superseded during apply");
            crate::metrics::record_outcome_superseded();
            return Ok(SaveDisposition::Superseded);
        }

        debug!(result = %outcome.result, resolution = resolution.label(), "Outcome applied");
        crate::metrics::record_outcome_applied(resolution.label());
        Ok(SaveDisposition::Applied(resolution))
    }
}

#[async_trait]
impl MessageHandler for SaveStage {
    fn stage(&self) -> Stage {
        Stage::Save
    }

    async fn handle(&self, message: StreamMessage) -> Result<(), StageError> {
        let outcome = Outcome::try_from(message)?;
        self.apply(&outcome).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::OutcomeResult;
    use crate::model::{Engine, IndexAction, ShopProfile, UrlEntry, UrlStatus};
    use crate::storage::memory::InMemoryBacklog;
    use crate::transition::SHOP_INACTIVE;

    fn processing(url: &str, token: &str, attempts: u32) -> UrlEntry {
        let mut e = UrlEntry::pending("s", url, IndexAction::Index, 1);
        e.status = UrlStatus::Processing;
        e.claim_token = Some(token.into());
        e.claimed_at = Some(now_millis());
        e.attempts = attempts;
        e
    }

    fn outcome(url: &str, token: &str, result: OutcomeResult, status: Option<u16>) -> Outcome {
        Outcome {
            batch_id: token.into(),
            shop: "s".into(),
            url: url.into(),
            engine: Engine::Google,
            result,
            http_status: status,
            message: String::new(),
        }
    }

    async fn stage() -> (Arc<InMemoryBacklog>, SaveStage) {
        let backlog = Arc::new(InMemoryBacklog::new());
        backlog.upsert_shop(&ShopProfile::new("s")).await.unwrap();
        (backlog.clone(), SaveStage::new(backlog, TransitionPolicy::default()))
    }

    #[tokio::test]
    async fn test_success_completes_entry() {
        let (backlog, stage) = stage().await;
        backlog.insert_entry(processing("https://s/a", "b-1", 1));

        let d = stage.apply(&outcome("https://s/a", "b-1", OutcomeResult::Success, Some(200))).await.unwrap();
        assert_eq!(d, SaveDisposition::Applied(Resolution::Complete));

        let e = backlog.get_entry("s", "https://s/a").await.unwrap().unwrap();
        assert_eq!(e.status, UrlStatus::Completed);
        assert_eq!(e.attempts, 1);
        assert!(e.last_indexed_at.is_some());
        assert!(e.claim_token.is_none());
    }

    #[tokio::test]
    async fn test_stale_token_and_replay_are_superseded() {
        let (backlog, stage) = stage().await;
        backlog.insert_entry(processing("https://s/a", "b-2", 2));

        let stale = outcome("https://s/a", "b-1", OutcomeResult::Success, Some(200));
        assert_eq!(stage.apply(&stale).await.unwrap(), SaveDisposition::Superseded);

        let fresh = outcome("https://s/a", "b-2", OutcomeResult::PermissionDenied, Some(403));
        assert!(matches!(stage.apply(&fresh).await.unwrap(), SaveDisposition::Applied(_)));
        // Redelivery of the same outcome changes nothing
        assert_eq!(stage.apply(&fresh).await.unwrap(), SaveDisposition::Superseded);

        let e = backlog.get_entry("s", "https://s/a").await.unwrap().unwrap();
        assert_eq!(e.status, UrlStatus::Failed);
        assert_eq!(e.last_error.as_deref(), Some("PERMISSION_DENIED (403)"));
    }

    #[tokio::test]
    async fn test_new_event_supersedes_in_flight_outcome() {
        let (backlog, stage) = stage().await;
        backlog.insert_entry(processing("https://s/a", "b-1", 1));
        backlog.record_event("s", "https://s/a", IndexAction::Delete, 99).await.unwrap();

        let o = outcome("https://s/a", "b-1", OutcomeResult::Success, Some(200));
        assert_eq!(stage.apply(&o).await.unwrap(), SaveDisposition::Superseded);

        let e = backlog.get_entry("s", "https://s/a").await.unwrap().unwrap();
        assert_eq!(e.status, UrlStatus::Pending);
        assert_eq!(e.index_action, IndexAction::Delete);
    }

    #[tokio::test]
    async fn test_inactive_shop_fails_entry() {
        let (backlog, stage) = stage().await;
        let mut profile = ShopProfile::new("s");
        profile.active = false;
        backlog.upsert_shop(&profile).await.unwrap();
        backlog.insert_entry(processing("https://s/a", "b-1", 1));

        stage.apply(&outcome("https://s/a", "b-1", OutcomeResult::Success, Some(200))).await.unwrap();
        let e = backlog.get_entry("s", "https://s/a").await.unwrap().unwrap();
        assert_eq!(e.status, UrlStatus::Failed);
        assert_eq!(e.last_error.as_deref(), Some(SHOP_INACTIVE));
    }

    #[tokio::test]
    async fn test_transient_at_max_attempts_fails() {
        let (backlog, stage) = stage().await;
        backlog.insert_entry(processing("https://s/a", "b-1", 5));
        backlog.insert_entry(processing("https://s/b", "b-1", 2));

        stage.apply(&outcome("https://s/a", "b-1", OutcomeResult::TransientError, Some(503))).await.unwrap();
        stage.apply(&outcome("https://s/b", "b-1", OutcomeResult::TransientError, Some(503))).await.unwrap();

        let a = backlog.get_entry("s", "https://s/a").await.unwrap().unwrap();
        let b = backlog.get_entry("s", "https://s/b").await.unwrap().unwrap();
        assert_eq!(a.status, UrlStatus::Failed);
        assert_eq!(b.status, UrlStatus::Pending);
        assert!(b.retry_after.is_some());
        assert_eq!(b.attempts, 2);
    }
}
