//! Public types for the pipeline coordinator.

use thiserror::Error;

use crate::cipher::CipherError;
use crate::config::ConfigError;
use crate::engines::ApiError;
use crate::storage::traits::StorageError;

/// Pipeline lifecycle state.
///
/// Use [`super::IndexingPipeline::state()`] to check the current state or
/// [`super::IndexingPipeline::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Just created, not yet started
    Created,
    /// Connecting to Redis and SQL
    Connecting,
    /// Workers and scheduler running
    Running,
    /// Waiting for workers to finish their current message
    ShuttingDown,
    /// All tasks joined (or abandoned after the shutdown timeout)
    Stopped,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Connecting => "Connecting",
            Self::Running => "Running",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("engine client error: {0}")]
    Api(#[from] ApiError),
    #[error("missing setting: {0}")]
    Missing(&'static str),
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: PipelineState,
    },
}

/// Point-in-time view for health endpoints and the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStatus {
    pub state: PipelineState,
    /// Worker and scheduler tasks still alive
    pub tasks_running: usize,
    /// Pending + undelivered, per stage input stream (`None` when unreachable)
    pub jobs_backlog: Option<u64>,
    pub batches_backlog: Option<u64>,
    pub outcomes_backlog: Option<u64>,
}

impl PipelineStatus {
    /// Running, with every stream reachable.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == PipelineState::Running
            && self.jobs_backlog.is_some()
            && self.batches_backlog.is_some()
            && self.outcomes_backlog.is_some()
    }
}
