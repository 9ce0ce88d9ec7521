// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stream message contracts.
//!
//! Every stream entry carries a single `payload` field holding the JSON form of a
//! [`StreamMessage`]. The `type` tag selects the variant; each stream accepts exactly
//! one variant, and anything else is rejected at the boundary (and dead-lettered by the
//! stage runner).
//!
//! # Stream Format
//!
//! ```text
//! XADD {prefix}jobs MAXLEN ~ 100000 *
//!   payload '{"type":"job","shop":"demo.myshopify.com","triggered_at":1735776000000}'
//!
//! XADD {prefix}batches MAXLEN ~ 100000 *
//!   payload '{"type":"batch","batch_id":"…","shop":"…","engine":"google",
//!             "action":"INDEX","urls":["https://…"],"attempts_so_far":1}'
//!
//! XADD {prefix}outcomes MAXLEN ~ 100000 *
//!   payload '{"type":"outcome","batch_id":"…","shop":"…","url":"https://…",
//!             "engine":"google","result":"SUCCESS","http_status":200,"message":""}'
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Engine, IndexAction};

/// Field name holding the JSON payload in every stream entry.
pub const PAYLOAD_FIELD: &str = "payload";

/// Hard ceiling on URLs per batch message, independent of engine limits.
pub const MAX_BATCH_URLS: usize = 1_000;

/// The pipeline's streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Jobs,
    Batches,
    Outcomes,
    DeadLetters,
}

impl Stream {
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::Batches => "batches",
            Self::Outcomes => "outcomes",
            Self::DeadLetters => "dead-letters",
        }
    }

    /// Build the full stream key from an optional prefix.
    /// Convention: the prefix includes its trailing colon (e.g. `"indexer:"`).
    pub fn key(&self, prefix: Option<&str>) -> String {
        match prefix {
            Some(p) => format!("{}{}", p, self.suffix()),
            None => self.suffix().to_string(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("expected a {expected} message, got {actual}")]
    WrongKind {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> MessageError {
    MessageError::Invalid { field, reason: reason.into() }
}

/// Request to prepare pending work for one shop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub shop: String,
    pub triggered_at: i64,
}

/// URLs claimed for one engine and one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Also the claim token written to every entry in `urls`
    pub batch_id: String,
    pub shop: String,
    pub engine: Engine,
    pub action: IndexAction,
    pub urls: Vec<String>,
    /// Highest `attempts` value among the claimed entries
    pub attempts_so_far: u32,
}

/// Classified result of one URL submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeResult {
    Success,
    RateLimited,
    PermissionDenied,
    Invalid,
    TransientError,
}

impl OutcomeResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::RateLimited => "RATE_LIMITED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Invalid => "INVALID",
            Self::TransientError => "TRANSIENT_ERROR",
        }
    }

    /// Map an HTTP status from an indexing API. `None` means the request never
    /// produced a response (connect error, timeout).
    ///
    /// ```
    /// use indexing_pipeline::OutcomeResult;
    ///
    /// assert_eq!(OutcomeResult::from_http_status(Some(200)), OutcomeResult::Success);
    /// assert_eq!(OutcomeResult::from_http_status(Some(429)), OutcomeResult::RateLimited);
    /// assert_eq!(OutcomeResult::from_http_status(Some(403)), OutcomeResult::PermissionDenied);
    /// assert_eq!(OutcomeResult::from_http_status(Some(400)), OutcomeResult::Invalid);
    /// assert_eq!(OutcomeResult::from_http_status(Some(503)), OutcomeResult::TransientError);
    /// assert_eq!(OutcomeResult::from_http_status(None), OutcomeResult::TransientError);
    /// ```
    pub fn from_http_status(status: Option<u16>) -> Self {
        match status {
            Some(s) if (200..300).contains(&s) => Self::Success,
            Some(429) => Self::RateLimited,
            Some(401) | Some(403) => Self::PermissionDenied,
            Some(408) => Self::TransientError,
            Some(s) if (400..500).contains(&s) => Self::Invalid,
            _ => Self::TransientError,
        }
    }
}

impl std::fmt::Display for OutcomeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-URL result published by the indexing worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub batch_id: String,
    pub shop: String,
    pub url: String,
    pub engine: Engine,
    pub result: OutcomeResult,
    #[serde(default)]
    pub http_status: Option<u16>,
    #[serde(default)]
    pub message: String,
}

/// Tagged envelope for everything that travels over the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Job(Job),
    Batch(Batch),
    Outcome(Outcome),
}

impl StreamMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Job(_) => "job",
            Self::Batch(_) => "batch",
            Self::Outcome(_) => "outcome",
        }
    }

    /// Serialize for the `payload` field.
    pub fn encode(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Malformed(e.to_string()))
    }

    /// Parse and validate a payload. Shape errors and semantic errors are both
    /// reported; nothing that fails here reaches a stage handler.
    pub fn decode(payload: &str) -> Result<Self, MessageError> {
        let message: StreamMessage = serde_json::from_str(payload)
            .map_err(|e| MessageError::Malformed(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), MessageError> {
        match self {
            Self::Job(job) => {
                check_shop(&job.shop)?;
                if job.triggered_at <= 0 {
                    return Err(invalid("triggered_at", "must be a positive epoch millis"));
                }
            }
            Self::Batch(batch) => {
                check_id(&batch.batch_id)?;
                check_shop(&batch.shop)?;
                if batch.action == IndexAction::Ignore {
                    return Err(invalid("action", "IGNORE entries are never batched"));
                }
                if batch.urls.is_empty() {
                    return Err(invalid("urls", "batch has no urls"));
                }
                if batch.urls.len() > MAX_BATCH_URLS {
                    return Err(invalid("urls", format!("{} urls exceeds {}", batch.urls.len(), MAX_BATCH_URLS)));
                }
                if batch.urls.iter().any(|u| u.trim().is_empty()) {
                    return Err(invalid("urls", "empty url"));
                }
            }
            Self::Outcome(outcome) => {
                check_id(&outcome.batch_id)?;
                check_shop(&outcome.shop)?;
                if outcome.url.trim().is_empty() {
                    return Err(invalid("url", "empty url"));
                }
            }
        }
        Ok(())
    }
}

fn check_shop(shop: &str) -> Result<(), MessageError> {
    if shop.trim().is_empty() {
        return Err(invalid("shop", "empty shop"));
    }
    Ok(())
}

fn check_id(id: &str) -> Result<(), MessageError> {
    if id.trim().is_empty() {
        return Err(invalid("batch_id", "empty batch id"));
    }
    Ok(())
}

impl From<Job> for StreamMessage {
    fn from(job: Job) -> Self {
        Self::Job(job)
    }
}

impl From<Batch> for StreamMessage {
    fn from(batch: Batch) -> Self {
        Self::Batch(batch)
    }
}

impl From<Outcome> for StreamMessage {
    fn from(outcome: Outcome) -> Self {
        Self::Outcome(outcome)
    }
}

impl TryFrom<StreamMessage> for Job {
    type Error = MessageError;

    fn try_from(message: StreamMessage) -> Result<Self, Self::Error> {
        match message {
            StreamMessage::Job(job) => Ok(job),
            other => Err(MessageError::WrongKind { expected: "job", actual: other.kind() }),
        }
    }
}

impl TryFrom<StreamMessage> for Batch {
    type Error = MessageError;

    fn try_from(message: StreamMessage) -> Result<Self, Self::Error> {
        match message {
            StreamMessage::Batch(batch) => Ok(batch),
            other => Err(MessageError::WrongKind { expected: "batch", actual: other.kind() }),
        }
    }
}

impl TryFrom<StreamMessage> for Outcome {
    type Error = MessageError;

    fn try_from(message: StreamMessage) -> Result<Self, Self::Error> {
        match message {
            StreamMessage::Outcome(outcome) => Ok(outcome),
            other => Err(MessageError::WrongKind { expected: "outcome", actual: other.kind() }),
        }
    }
}

/// Entry written to the dead-letter stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub source_stream: String,
    pub message_id: String,
    pub deliveries: u64,
    pub reason: String,
    /// Original payload, verbatim (may be unparseable)
    pub payload: String,
    pub dead_at: i64,
}
