// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stage workers.
//!
//! Every stage is the same loop around a different [`MessageHandler`]:
//!
//! ```text
//!            ┌──────────────────────────────────────────────────────────┐
//!            │ StageWorker (one consumer in the stage's group)          │
//!            │                                                          │
//!  stream ──►│ reclaim idle (XPENDING/XCLAIM) ─┐                        │
//!            │ admit? ─► read new (XREADGROUP) ─┼─► decode ─► handle ───┼─► XACK
//!            │                                  │      │          │     │
//!            │                                  │      ▼          ▼     │
//!            │                                  │  dead-letter  infra   │
//!            │                                  │   + XACK     error:   │
//!            │                                  │              no ack   │
//!            └──────────────────────────────────────────────────────────┘
//! ```
//!
//! - A message is acknowledged only after its handler finished (or it was
//!   dead-lettered), so a crash mid-handle means redelivery, never loss.
//! - Poison messages (undecodable, failing validation, delivered more than
//!   `max_deliveries` times, or rejected permanently by the handler) go to the
//!   dead-letter stream with their source and delivery count, then are acked.
//! - Infrastructure failures leave the message pending. Another consumer reclaims
//!   it after the claim lease.

pub mod index;
pub mod prepare;
pub mod save;

pub use index::IndexStage;
pub use prepare::PrepareStage;
pub use save::SaveStage;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::messages::{DeadLetter, MessageError, Stream, StreamMessage};
use crate::model::now_millis;
use crate::quota::QuotaError;
use crate::storage::traits::{Delivery, StorageError, StreamBus};

#[derive(Debug, Error)]
pub enum StageError {
    #[error("invalid message: {0}")]
    Message(#[from] MessageError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("quota error: {0}")]
    Quota(#[from] QuotaError),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl StageError {
    /// Permanent errors dead-letter the message; the rest leave it for redelivery.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Message(_) | Self::Rejected(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Storage(_) => "storage",
            Self::Quota(_) => "quota",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// The three pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Prepare,
    Index,
    Save,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Prepare, Stage::Index, Stage::Save];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Index => "index",
            Self::Save => "save",
        }
    }

    pub fn input(&self) -> Stream {
        match self {
            Self::Prepare => Stream::Jobs,
            Self::Index => Stream::Batches,
            Self::Save => Stream::Outcomes,
        }
    }

    pub fn group(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare-workers",
            Self::Index => "index-workers",
            Self::Save => "save-workers",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Stage-specific processing of one decoded message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    /// How many new messages to read this round; 0 pauses reading.
    /// Reclaimed deliveries are processed regardless.
    async fn admit(&self, requested: usize) -> Result<usize, StageError> {
        Ok(requested)
    }

    async fn handle(&self, message: StreamMessage) -> Result<(), StageError>;
}

/// Loop settings shared by all stages.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub key_prefix: Option<String>,
    pub read_count: usize,
    pub read_block: Duration,
    /// Minimum idle time before another consumer may reclaim a delivery
    pub claim_lease: Duration,
    pub max_deliveries: u64,
    pub max_consecutive_errors: u32,
    /// Sleep after a failed or paused round
    pub idle_backoff: Duration,
}

impl From<&crate::config::PipelineConfig> for WorkerSettings {
    fn from(config: &crate::config::PipelineConfig) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            read_count: config.read_count,
            read_block: config.read_block(),
            claim_lease: config.claim_lease(),
            max_deliveries: config.max_deliveries,
            max_consecutive_errors: config.max_consecutive_errors,
            idle_backoff: Duration::from_secs(1),
        }
    }
}

/// What one polling round did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub reclaimed: usize,
    pub read: usize,
    pub acked: usize,
    pub dead_lettered: usize,
    /// Left unacknowledged after an infrastructure error
    pub retried: usize,
    pub paused: bool,
}

impl PollReport {
    fn absorb(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Acked => self.acked += 1,
            Disposition::DeadLettered => self.dead_lettered += 1,
            Disposition::Retry => self.retried += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Acked,
    DeadLettered,
    Retry,
}

/// Build a consumer name unique across restarts: `{node}-{stage}-{n}-{uuid8}`.
pub fn consumer_name(node: &str, stage: Stage, n: usize) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}-{}", node, stage.name(), n, &suffix[..8])
}

/// One member of a stage's consumer group.
pub struct StageWorker {
    bus: Arc<dyn StreamBus>,
    handler: Arc<dyn MessageHandler>,
    settings: WorkerSettings,
    consumer: String,
    stream: String,
    dead_letters: String,
}

impl StageWorker {
    pub fn new(
        bus: Arc<dyn StreamBus>,
        handler: Arc<dyn MessageHandler>,
        settings: WorkerSettings,
        consumer: String,
    ) -> Self {
        let prefix = settings.key_prefix.as_deref();
        let stream = handler.stage().input().key(prefix);
        let dead_letters = Stream::DeadLetters.key(prefix);
        Self { bus, handler, settings, consumer, stream, dead_letters }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    fn stage(&self) -> Stage {
        self.handler.stage()
    }

    /// Create the consumer group if needed.
    pub async fn prepare(&self) -> Result<(), StorageError> {
        self.bus.ensure_group(&self.stream, self.stage().group()).await
    }

    /// Reclaim and process deliveries abandoned past the claim lease.
    pub async fn reclaim(&self) -> Result<PollReport, StorageError> {
        let stage = self.stage();
        let deliveries = self
            .bus
            .reclaim_idle(
                &self.stream,
                stage.group(),
                &self.consumer,
                self.settings.claim_lease,
                self.settings.read_count.max(1),
            )
            .await?;

        let mut report = PollReport { reclaimed: deliveries.len(), ..Default::default() };
        if !deliveries.is_empty() {
            info!(stage = %stage, consumer = %self.consumer, count = deliveries.len(), "Reclaimed idle messages");
            crate::metrics::record_reclaimed(stage.name(), deliveries.len());
        }
        for delivery in deliveries {
            report.absorb(self.process(delivery).await);
        }
        Ok(report)
    }

    /// Read and process new messages, subject to the handler's admission.
    pub async fn read(&self) -> Result<PollReport, StageError> {
        let stage = self.stage();
        let count = self.handler.admit(self.settings.read_count.max(1)).await?;
        if count == 0 {
            return Ok(PollReport { paused: true, ..Default::default() });
        }

        let deliveries = self
            .bus
            .read_group(&self.stream, stage.group(), &self.consumer, count, self.settings.read_block)
            .await?;

        let mut report = PollReport { read: deliveries.len(), ..Default::default() };
        for delivery in deliveries {
            report.absorb(self.process(delivery).await);
        }
        Ok(report)
    }

    /// One full round: reclaim, then read.
    pub async fn poll_once(&self) -> Result<PollReport, StageError> {
        let reclaimed = self.reclaim().await?;
        let mut report = self.read().await?;
        report.reclaimed = reclaimed.reclaimed;
        report.acked += reclaimed.acked;
        report.dead_lettered += reclaimed.dead_lettered;
        report.retried += reclaimed.retried;
        Ok(report)
    }

    async fn process(&self, delivery: Delivery) -> Disposition {
        let stage = self.stage();
        let _timer = crate::metrics::LatencyTimer::new(stage.name());

        let Some(payload) = delivery.payload.as_deref() else {
            return self.dead_letter(&delivery, "missing payload field", "malformed").await;
        };

        if delivery.deliveries > self.settings.max_deliveries {
            let reason = format!("exceeded {} deliveries", self.settings.max_deliveries);
            return self.dead_letter(&delivery, &reason, "max_deliveries").await;
        }

        let message = match StreamMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => return self.dead_letter(&delivery, &e.to_string(), "malformed").await,
        };

        match self.handler.handle(message).await {
            Ok(()) => self.ack(&delivery).await,
            Err(e) if e.is_permanent() => self.dead_letter(&delivery, &e.to_string(), e.kind()).await,
            Err(e) => {
                warn!(
                    stage = %stage,
                    message_id = %delivery.id,
                    deliveries = delivery.deliveries,
                    error = %e,
                    "Handler failed, leaving message for redelivery"
                );
                crate::metrics::record_stage_error(stage.name(), e.kind());
                crate::metrics::record_message(stage.name(), "retry");
                Disposition::Retry
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Disposition {
        let stage = self.stage();
        match self.bus.ack(&self.stream, stage.group(), &delivery.id).await {
            Ok(()) => {
                crate::metrics::record_message(stage.name(), "acked");
                Disposition::Acked
            }
            Err(e) => {
                // Handler work is idempotent; redelivery will redo it
                warn!(stage = %stage, message_id = %delivery.id, error = %e, "Ack failed");
                crate::metrics::record_stage_error(stage.name(), "ack");
                Disposition::Retry
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str, kind: &str) -> Disposition {
        let stage = self.stage();
        let letter = DeadLetter {
            source_stream: self.stream.clone(),
            message_id: delivery.id.clone(),
            deliveries: delivery.deliveries,
            reason: reason.to_string(),
            payload: delivery.payload.clone().unwrap_or_default(),
            dead_at: now_millis(),
        };
        let encoded = match serde_json::to_string(&letter) {
            Ok(s) => s,
            Err(e) => {
                error!(stage = %stage, error = %e, "Failed to encode dead letter");
                return Disposition::Retry;
            }
        };

        if let Err(e) = self.bus.publish(&self.dead_letters, &encoded).await {
            warn!(stage = %stage, message_id = %delivery.id, error = %e, "Dead-letter publish failed");
            crate::metrics::record_stage_error(stage.name(), "dead_letter");
            return Disposition::Retry;
        }

        warn!(
            stage = %stage,
            message_id = %delivery.id,
            deliveries = delivery.deliveries,
            reason,
            "Message dead-lettered"
        );
        crate::metrics::record_dead_letter(stage.name(), kind);
        match self.ack(delivery).await {
            Disposition::Acked => Disposition::DeadLettered,
            other => other,
        }
    }

    /// Run until shutdown is signalled or too many consecutive read failures.
    ///
    /// The current message always finishes before the loop observes shutdown.
    #[tracing::instrument(skip(self, shutdown), fields(stage = %self.stage(), consumer = %self.consumer))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), StageError> {
        let stage = self.stage();
        crate::resilience::retry::retry("ensure_group", &crate::resilience::retry::RetryConfig::startup(), || {
            self.prepare()
        })
        .await?;
        info!("Stage worker started");

        let reclaim_every = (self.settings.claim_lease / 4).max(Duration::from_secs(1));
        let mut last_reclaim: Option<Instant> = None;
        let mut consecutive_errors = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut round = PollReport::default();
            let mut failure: Option<StageError> = None;

            if last_reclaim.map_or(true, |t| t.elapsed() >= reclaim_every) {
                last_reclaim = Some(Instant::now());
                match self.reclaim().await {
                    Ok(r) => round = r,
                    Err(e) => failure = Some(e.into()),
                }
            }

            if failure.is_none() {
                match self.read().await {
                    Ok(r) => {
                        round.read = r.read;
                        round.paused = r.paused;
                        round.retried += r.retried;
                    }
                    Err(e) => failure = Some(e),
                }
            }

            let backoff = match failure {
                Some(e) => {
                    consecutive_errors += 1;
                    crate::metrics::record_stage_error(stage.name(), "read");
                    warn!(error = %e, consecutive_errors, "Stream round failed");
                    if consecutive_errors >= self.settings.max_consecutive_errors {
                        error!(consecutive_errors, "Too many consecutive errors, stopping worker");
                        return Err(e);
                    }
                    true
                }
                None => {
                    consecutive_errors = 0;
                    if round.paused {
                        debug!("Reading paused by backpressure");
                    }
                    round.paused || round.retried > 0
                }
            };

            if backoff {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.idle_backoff) => {}
                    _ = shutdown.changed() => {}
                }
            } else if round.read == 0 {
                // Non-blocking reads return immediately when the stream is empty
                tokio::task::yield_now().await;
            }
        }

        info!("Stage worker stopped");
        Ok(())
    }
}
