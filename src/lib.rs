//! # Indexing Pipeline
//!
//! A quota-aware, crash-safe pipeline that submits changed shop URLs to search-engine
//! indexing APIs (Google Indexing API, Bing Webmaster).
//!
//! ## Architecture
//!
//! Three stages connected by Redis streams, each consumed by a pool of workers in its
//! own consumer group. The SQL backlog is the only durable state about URLs.
//!
//! ```text
//!   webhook ──record_event──► ┌─────────────────────────────┐
//!                             │   SQL backlog (url_entries)  │◄──────────────┐
//!                             └─────────────────────────────┘               │
//!                                 │ pending_shops    ▲ claim (CAS)          │ resolve (CAS)
//!                                 ▼                  │                      │
//! ┌───────────┐   jobs    ┌───────────────────┐  batches  ┌──────────────────┐  outcomes  ┌──────────────┐
//! │ Scheduler │──────────►│ L1: prepare       │──────────►│ L2: index        │───────────►│ L3: save     │
//! │ (interval │           │ • route by engine │           │ • reserve quota  │            │ • transition │
//! │  + wake)  │           │ • chunk ≤ 100     │           │ • call Google /  │            │ • supersede  │
//! └───────────┘           │ • backpressure    │           │   Bing           │            │   guard      │
//!                         └───────────────────┘           └──────────────────┘            └──────────────┘
//!                                                                  │
//!                                                     quota:{shop}:{engine}:{day}
//!                                                        (Redis, Lua reserve)
//! ```
//!
//! ## Guarantees
//!
//! - **Liveness**: every claimable entry is eventually claimed, resolved or requeued.
//!   Crashed workers lose nothing: unacked messages are reclaimed and stale claims
//!   expire with their lease.
//! - **Idempotence**: redelivered jobs, batches and outcomes change nothing twice.
//! - **Quota bound**: submissions per `(shop, engine, day)` never exceed the limit.
//! - **Attempt bound**: an entry fails after `max_attempts` transient errors.
//! - **Supersession**: an upstream event always wins over an in-flight outcome.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use indexing_pipeline::{IndexingPipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = PipelineConfig::from_file("pipeline.toml").expect("config");
//!     config.apply_env();
//!
//!     let mut pipeline = IndexingPipeline::new(config);
//!     pipeline.start().await.expect("Failed to start");
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     pipeline.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: [`IndexingPipeline`], worker pools and lifecycle
//! - [`scheduler`]: periodic and on-demand job publishing
//! - [`stages`]: the stage runner and the prepare, index and save handlers
//! - [`engines`]: Google and Bing clients behind [`engines::IndexingApi`]
//! - [`storage`]: backlog (SQL), stream bus and quota counters (Redis), in-memory doubles
//! - [`transition`]: outcome → backlog state machine
//! - [`quota`]: daily per-shop, per-engine quota
//! - [`cipher`]: AES-256-GCM credential blobs
//! - [`backpressure`]: L1 read throttling from the batches backlog

pub mod backpressure;
pub mod cipher;
pub mod config;
pub mod coordinator;
pub mod engines;
pub mod messages;
pub mod metrics;
pub mod model;
pub mod quota;
pub mod resilience;
pub mod scheduler;
pub mod stages;
pub mod storage;
pub mod transition;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use backpressure::BackpressureLevel;
pub use cipher::{Cipher, CipherError};
pub use config::{ConfigError, PipelineConfig};
pub use coordinator::{IndexingPipeline, PipelineComponents, PipelineError, PipelineState, PipelineStatus};
pub use engines::{ApiError, ApiResponse, EngineConnector, HttpConnector, IndexingApi};
pub use messages::{Batch, DeadLetter, Job, MessageError, Outcome, OutcomeResult, Stream, StreamMessage};
pub use metrics::LatencyTimer;
pub use model::{Engine, IndexAction, ShopProfile, UrlEntry, UrlStatus};
pub use quota::{QuotaError, QuotaTracker};
pub use resilience::retry::RetryConfig;
pub use scheduler::{ScheduleReport, Scheduler, SchedulerHandle};
pub use stages::{Stage, StageError, StageWorker};
pub use storage::traits::{BacklogStore, QuotaStore, StorageError, StreamBus};
pub use transition::{Resolution, TransitionPolicy};
