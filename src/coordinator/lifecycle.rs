//! Pipeline lifecycle: connect, start, shutdown.

use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use super::{IndexingPipeline, PipelineComponents, PipelineError, PipelineState};
use crate::cipher::Cipher;
use crate::engines::{HttpConnector, HttpSettings};
use crate::scheduler::ScheduleReport;
use crate::stages::{
    consumer_name, IndexStage, MessageHandler, PrepareStage, SaveStage, Stage, StageWorker, WorkerSettings,
};
use crate::stages::prepare::PrepareSettings;
use crate::storage::redis::{RedisQuotaStore, RedisStreamBus};
use crate::storage::sql::SqlBacklogStore;
use crate::transition::TransitionPolicy;

fn node_name(configured: Option<&str>) -> String {
    configured
        .map(str::to_string)
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string())
}

impl IndexingPipeline {
    /// Connect to Redis and SQL and build the engine connector.
    ///
    /// Startup flow:
    /// 1. Validate config (fails before any network I/O)
    /// 2. Load the credential cipher
    /// 3. Connect to SQL (backlog) and create tables if missing
    /// 4. Connect to Redis once; streams and quota share the connection
    #[tracing::instrument(skip(self))]
    pub async fn connect(&mut self) -> Result<(), PipelineError> {
        if self.components.is_some() {
            return Ok(());
        }
        self.set_state(PipelineState::Connecting);
        let started = Instant::now();

        self.config.validate()?;
        let key = self.config.encryption_key.as_deref().ok_or(PipelineError::Missing("encryption_key"))?;
        let sql_url = self.config.sql_url.clone().ok_or(PipelineError::Missing("sql_url"))?;
        let redis_url = self.config.redis_url.clone().ok_or(PipelineError::Missing("redis_url"))?;
        let cipher = Arc::new(Cipher::from_hex(key)?);

        info!("Connecting to SQL backlog...");
        let backlog = SqlBacklogStore::new(&sql_url).await.map_err(|e| {
            error!(error = %e, "SQL connection required for startup");
            e
        })?;

        info!(prefix = ?self.config.key_prefix, "Connecting to Redis...");
        let connection = crate::storage::redis::connect(&redis_url).await?;
        let bus = RedisStreamBus::with_connection(connection.clone(), self.config.stream_max_len);
        let quota = RedisQuotaStore::with_connection(connection);

        let connector = HttpConnector::new(HttpSettings::from(&self.config))?;

        self.install(PipelineComponents {
            backlog: Arc::new(backlog),
            bus: Arc::new(bus),
            quota: Arc::new(quota),
            cipher,
            connector: Arc::new(connector),
        });
        info!(elapsed = ?started.elapsed(), "Backends connected");
        Ok(())
    }

    fn components_or_err(&self, action: &'static str) -> Result<PipelineComponents, PipelineError> {
        self.components
            .clone()
            .ok_or(PipelineError::InvalidState { action, state: self.state() })
    }

    fn handler_for(&self, stage: Stage, components: &PipelineComponents) -> Arc<dyn MessageHandler> {
        let quota = crate::quota::QuotaTracker::new(components.quota.clone(), self.config.key_prefix());
        match stage {
            Stage::Prepare => Arc::new(PrepareStage::new(
                components.backlog.clone(),
                components.bus.clone(),
                quota,
                components.cipher.clone(),
                PrepareSettings::from(&self.config),
            )),
            Stage::Index => Arc::new(IndexStage::new(
                components.backlog.clone(),
                components.bus.clone(),
                quota,
                components.cipher.clone(),
                components.connector.clone(),
                self.config.key_prefix(),
            )),
            Stage::Save => Arc::new(SaveStage::new(
                components.backlog.clone(),
                TransitionPolicy::from(&self.config),
            )),
        }
    }

    /// Groups start at the stream tail, so they must exist before anything is published.
    async fn ensure_groups(&self) -> Result<PipelineComponents, PipelineError> {
        let components = self.components_or_err("prepare streams")?;
        for stage in Stage::ALL {
            let stream = stage.input().key(self.config.key_prefix());
            components.bus.ensure_group(&stream, stage.group()).await?;
        }
        Ok(components)
    }

    fn pool_size(&self, stage: Stage) -> usize {
        match stage {
            Stage::Prepare => self.config.prepare_workers,
            Stage::Index => self.config.index_workers,
            Stage::Save => self.config.save_workers,
        }
    }

    /// Connect if needed, create consumer groups, spawn worker pools and the scheduler.
    #[tracing::instrument(skip(self))]
    pub async fn start(&mut self) -> Result<(), PipelineError> {
        let state = self.state();
        if !matches!(state, PipelineState::Created | PipelineState::Connecting) {
            return Err(PipelineError::InvalidState { action: "start", state });
        }
        self.connect().await?;
        let components = self.ensure_groups().await?;
        let node = node_name(self.config.node_id.as_deref());
        let settings = WorkerSettings::from(&self.config);

        for stage in Stage::ALL {
            let handler = self.handler_for(stage, &components);
            let size = self.pool_size(stage);
            for n in 0..size {
                let worker = StageWorker::new(
                    components.bus.clone(),
                    handler.clone(),
                    settings.clone(),
                    consumer_name(&node, stage, n),
                );
                let label = worker.consumer().to_string();
                let shutdown = self.shutdown_tx.subscribe();
                let handle = tokio::spawn(async move {
                    if let Err(e) = worker.run(shutdown).await {
                        error!(stage = %stage, error = %e, "Stage worker exited with error");
                    }
                });
                self.tasks.push((label, handle));
            }
            crate::metrics::set_workers_running(stage.name(), size);
            info!(stage = %stage, workers = size, "Worker pool started");
        }

        if let Some(ref scheduler) = self.scheduler {
            let handle = tokio::spawn(scheduler.clone().run(self.shutdown_tx.subscribe()));
            self.tasks.push(("scheduler".to_string(), handle));
        }

        self.set_state(PipelineState::Running);
        info!(node = %node, tasks = self.tasks.len(), "Indexing pipeline running");
        Ok(())
    }

    /// One scheduler tick without starting workers (`schedule-once`).
    pub async fn schedule_once(&mut self) -> Result<ScheduleReport, PipelineError> {
        self.connect().await?;
        let scheduler = self
            .scheduler
            .clone()
            .ok_or(PipelineError::InvalidState { action: "schedule", state: self.state() })?;
        self.ensure_groups().await?;
        Ok(scheduler.tick(crate::model::now_millis()).await?)
    }

    /// Publish a job for one shop immediately (`trigger --shop`).
    pub async fn trigger_shop(&mut self, shop: &str) -> Result<String, PipelineError> {
        self.connect().await?;
        let scheduler = self
            .scheduler
            .clone()
            .ok_or(PipelineError::InvalidState { action: "trigger", state: self.state() })?;
        self.ensure_groups().await?;
        Ok(scheduler.trigger_shop(shop).await?)
    }

    /// Signal shutdown and join every task, abandoning stragglers after the timeout.
    ///
    /// Workers finish the message in hand; anything unacknowledged is redelivered
    /// to another consumer after the claim lease.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&mut self) {
        if matches!(self.state(), PipelineState::Stopped) {
            return;
        }
        let started = Instant::now();
        info!(tasks = self.tasks.len(), "Initiating pipeline shutdown...");
        self.set_state(PipelineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout();
        for (label, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = %label, error = %e, "Task panicked during shutdown"),
                Err(_) => {
                    warn!(task = %label, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        for stage in Stage::ALL {
            crate::metrics::set_workers_running(stage.name(), 0);
        }
        self.set_state(PipelineState::Stopped);
        info!(elapsed = ?started.elapsed(), "Pipeline shutdown complete");
    }
}
