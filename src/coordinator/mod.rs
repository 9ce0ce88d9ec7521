// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pipeline coordinator.
//!
//! The [`IndexingPipeline`] owns the shared components (backlog, stream bus, quota
//! store, cipher, engine connector), spawns the worker pools and the scheduler, and
//! drives graceful shutdown.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use indexing_pipeline::{IndexingPipeline, PipelineConfig, PipelineState};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = PipelineConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     sql_url: Some("sqlite:indexer.db".into()),
//!     encryption_key: Some("00".repeat(32)),
//!     ..Default::default()
//! };
//!
//! let mut pipeline = IndexingPipeline::new(config);
//! assert_eq!(pipeline.state(), PipelineState::Created);
//!
//! // pipeline.start().await.expect("start failed");
//! // tokio::signal::ctrl_c().await.ok();
//! // pipeline.shutdown().await;
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{PipelineError, PipelineState, PipelineStatus};

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cipher::Cipher;
use crate::config::PipelineConfig;
use crate::engines::EngineConnector;
use crate::messages::Stream;
use crate::quota::QuotaTracker;
use crate::scheduler::{Scheduler, SchedulerHandle, SchedulerSettings};
use crate::stages::Stage;
use crate::storage::traits::{BacklogStore, QuotaStore, StreamBus};

/// Everything the stages share. Built by [`IndexingPipeline::start()`] from config,
/// or supplied directly (in-memory stores, scripted engines).
#[derive(Clone)]
pub struct PipelineComponents {
    pub backlog: Arc<dyn BacklogStore>,
    pub bus: Arc<dyn StreamBus>,
    pub quota: Arc<dyn QuotaStore>,
    pub cipher: Arc<Cipher>,
    pub connector: Arc<dyn EngineConnector>,
}

/// Main pipeline coordinator.
pub struct IndexingPipeline {
    pub(super) config: PipelineConfig,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<PipelineState>,
    pub(super) state_rx: watch::Receiver<PipelineState>,

    /// Shared backends, set by `connect()` or `with_components()`
    pub(super) components: Option<PipelineComponents>,

    /// Scheduler, available once components exist
    pub(super) scheduler: Option<Arc<Scheduler>>,

    /// Broadcasts `true` once to every worker and the scheduler
    pub(super) shutdown_tx: watch::Sender<bool>,

    /// Spawned worker and scheduler tasks, labelled for logs
    pub(super) tasks: Vec<(String, JoinHandle<()>)>,
}

impl IndexingPipeline {
    /// Create a pipeline that will connect to the configured backends on start.
    pub fn new(config: PipelineConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(PipelineState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            state: state_tx,
            state_rx,
            components: None,
            scheduler: None,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Create a pipeline over pre-built components; `start()` skips connecting.
    pub fn with_components(config: PipelineConfig, components: PipelineComponents) -> Self {
        let mut pipeline = Self::new(config);
        pipeline.install(components);
        pipeline
    }

    pub(super) fn install(&mut self, components: PipelineComponents) {
        let scheduler = Scheduler::new(
            components.backlog.clone(),
            components.bus.clone(),
            SchedulerSettings::from(&self.config),
        );
        self.scheduler = Some(Arc::new(scheduler));
        self.components = Some(components);
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }

    pub(super) fn set_state(&self, state: PipelineState) {
        let _ = self.state.send(state);
        crate::metrics::set_pipeline_state(state.as_str());
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn components(&self) -> Option<&PipelineComponents> {
        self.components.as_ref()
    }

    /// Handle for waking the scheduler early; `None` before components exist.
    #[must_use]
    pub fn scheduler_handle(&self) -> Option<SchedulerHandle> {
        self.scheduler.as_ref().map(|s| s.handle())
    }

    #[must_use]
    pub fn quota_tracker(&self) -> Option<QuotaTracker> {
        self.components
            .as_ref()
            .map(|c| QuotaTracker::new(c.quota.clone(), self.config.key_prefix()))
    }

    /// Snapshot of state, live tasks and stream backlogs.
    pub async fn status(&self) -> PipelineStatus {
        let tasks_running = self.tasks.iter().filter(|(_, h)| !h.is_finished()).count();
        let mut backlogs = [None, None, None];
        if let Some(ref components) = self.components {
            for (slot, stage) in backlogs.iter_mut().zip(Stage::ALL) {
                let stream = stage.input().key(self.config.key_prefix());
                *slot = components.bus.backlog(&stream, stage.group()).await.ok();
            }
        }
        let [jobs_backlog, batches_backlog, outcomes_backlog] = backlogs;
        PipelineStatus {
            state: self.state(),
            tasks_running,
            jobs_backlog,
            batches_backlog,
            outcomes_backlog,
        }
    }

    /// Stream key for this pipeline's prefix.
    #[must_use]
    pub fn stream_key(&self, stream: Stream) -> String {
        stream.key(self.config.key_prefix())
    }
}
