//! Search-engine indexing clients.
//!
//! [`IndexingApi`] is the seam the indexing worker talks to. It never fails as a
//! whole: every submitted URL comes back as an [`ApiResponse`] carrying its own
//! classification, so one bad URL (or one dropped connection) never poisons the
//! rest of the batch.
//!
//! [`EngineConnector`] turns a decrypted credential into a client. The production
//! connector ([`HttpConnector`]) shares one `reqwest::Client` and one Google token
//! cache across all batches.

pub mod bing;
pub mod google;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::messages::OutcomeResult;
use crate::model::{Engine, IndexAction};

pub use bing::BingClient;
pub use google::{GoogleClient, ServiceAccountKey, TokenCache};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid {engine} credential: {reason}")]
    Credential { engine: Engine, reason: String },
    #[error("http client error: {0}")]
    Client(String),
}

/// Classified result for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub url: String,
    pub result: OutcomeResult,
    pub http_status: Option<u16>,
    pub message: String,
}

impl ApiResponse {
    /// Classify by HTTP status (`None` = no response at all).
    pub fn from_status(url: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            result: OutcomeResult::from_http_status(status),
            http_status: status,
            message: message.into(),
        }
    }

    /// A result decided without an HTTP exchange.
    pub fn local(url: &str, result: OutcomeResult, message: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            result,
            http_status: None,
            message: message.into(),
        }
    }
}

/// Trim a response body for storage in `last_error`.
pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 300;
    let body = body.trim();
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

#[async_trait]
pub trait IndexingApi: Send + Sync {
    fn engine(&self) -> Engine;

    /// Maximum URLs per `submit_batch` call.
    fn batch_limit(&self) -> usize;

    /// Submit up to `batch_limit()` URLs. Returns one response per input URL, in order.
    async fn submit_batch(&self, urls: &[String], action: IndexAction) -> Vec<ApiResponse>;

    /// Submit a single URL.
    async fn submit(&self, url: &str, action: IndexAction) -> ApiResponse {
        self.submit_batch(&[url.to_string()], action)
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| ApiResponse::local(url, OutcomeResult::TransientError, "empty response"))
    }
}

/// Builds an engine client from a decrypted credential.
pub trait EngineConnector: Send + Sync {
    fn connect(
        &self,
        engine: Engine,
        credential: &str,
        site_url: &str,
    ) -> Result<Arc<dyn IndexingApi>, ApiError>;
}

/// Endpoints and timeouts for the real APIs.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub google_token_url: String,
    pub google_api_base: String,
    pub bing_api_url: String,
    pub timeout: Duration,
}

impl From<&crate::config::PipelineConfig> for HttpSettings {
    fn from(config: &crate::config::PipelineConfig) -> Self {
        Self {
            google_token_url: config.google_token_url.clone(),
            google_api_base: config.google_api_base.clone(),
            bing_api_url: config.bing_api_url.clone(),
            timeout: config.api_timeout(),
        }
    }
}

pub struct HttpConnector {
    client: reqwest::Client,
    settings: HttpSettings,
    tokens: Arc<TokenCache>,
}

impl HttpConnector {
    pub fn new(settings: HttpSettings) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;
        Ok(Self {
            client,
            settings,
            tokens: Arc::new(TokenCache::default()),
        })
    }
}

impl EngineConnector for HttpConnector {
    fn connect(
        &self,
        engine: Engine,
        credential: &str,
        site_url: &str,
    ) -> Result<Arc<dyn IndexingApi>, ApiError> {
        match engine {
            Engine::Google => {
                let key = ServiceAccountKey::parse(credential)?;
                Ok(Arc::new(GoogleClient::new(
                    self.client.clone(),
                    key,
                    &self.settings.google_token_url,
                    &self.settings.google_api_base,
                    self.tokens.clone(),
                )))
            }
            Engine::Bing => {
                let api_key = credential.trim();
                if api_key.is_empty() {
                    return Err(ApiError::Credential { engine, reason: "empty API key".into() });
                }
                Ok(Arc::new(BingClient::new(
                    self.client.clone(),
                    &self.settings.bing_api_url,
                    api_key,
                    site_url,
                )))
            }
        }
    }
}
