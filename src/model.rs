//! Backlog data model.
//!
//! A [`UrlEntry`] is the unit of work that flows through the pipeline: one row per
//! `(shop, url)`, written to `PENDING` by the upstream webhook handler and moved through
//! its status cycle by the stages. A [`ShopProfile`] holds the tenant's encrypted
//! engine credentials and per-engine daily limits.
//!
//! All timestamps are epoch milliseconds (UTC).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Error returned when a stored enum column holds an unknown value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Processing status of a [`UrlEntry`].
///
/// ```text
/// PENDING → PROCESSING → { COMPLETED, FAILED, PENDING }
///    ▲                          │          │
///    └──── upstream event ──────┴──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UrlStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl UrlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for UrlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UrlStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(ParseEnumError { kind: "status", value: other.to_string() }),
        }
    }
}

/// Intended effect of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexAction {
    /// Add or update the URL in the engine's index
    Index,
    /// Remove the URL from the engine's index
    Delete,
    /// Do nothing (never loaded by the pipeline)
    Ignore,
}

impl IndexAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Index => "INDEX",
            Self::Delete => "DELETE",
            Self::Ignore => "IGNORE",
        }
    }
}

impl fmt::Display for IndexAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INDEX" => Ok(Self::Index),
            "DELETE" => Ok(Self::Delete),
            "IGNORE" => Ok(Self::Ignore),
            other => Err(ParseEnumError { kind: "index action", value: other.to_string() }),
        }
    }
}

/// A third-party search engine the pipeline submits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Google,
    Bing,
}

impl Engine {
    pub const ALL: [Engine; 2] = [Engine::Google, Engine::Bing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Bing => "bing",
        }
    }

    /// Daily request budget when the shop doesn't override it.
    pub fn default_daily_limit(&self) -> u32 {
        match self {
            Self::Google => 200,
            Self::Bing => 10_000,
        }
    }

    /// Maximum URLs accepted in a single API call.
    pub fn batch_limit(&self) -> usize {
        100
    }

    /// Whether this engine has an endpoint for the given action.
    /// Bing only accepts submissions; deletions are Google-only.
    pub fn supports(&self, action: IndexAction) -> bool {
        match (self, action) {
            (_, IndexAction::Ignore) => false,
            (Self::Google, _) => true,
            (Self::Bing, IndexAction::Index) => true,
            (Self::Bing, IndexAction::Delete) => false,
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(Self::Google),
            "bing" => Ok(Self::Bing),
            other => Err(ParseEnumError { kind: "engine", value: other.to_string() }),
        }
    }
}

/// One backlog row per `(shop, url)`.
///
/// # Example
///
/// ```
/// use indexing_pipeline::{UrlEntry, UrlStatus, IndexAction};
///
/// let entry = UrlEntry::pending("demo.myshopify.com", "https://demo.example/p/1", IndexAction::Index, 1_000);
/// assert_eq!(entry.status, UrlStatus::Pending);
/// assert_eq!(entry.attempts, 0);
/// assert!(entry.claimed_at.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlEntry {
    pub shop: String,
    pub url: String,
    pub index_action: IndexAction,
    pub status: UrlStatus,
    pub attempts: u32,
    /// Set by the upstream webhook; authoritative for recency
    pub last_event_at: i64,
    pub last_indexed_at: Option<i64>,
    /// Lease start while PROCESSING
    pub claimed_at: Option<i64>,
    /// Batch id holding the lease while PROCESSING
    pub claim_token: Option<String>,
    /// Not claimable before this instant (requeue backoff)
    pub retry_after: Option<i64>,
    /// Reason text for the last failure, shown in the admin UI
    pub last_error: Option<String>,
    /// The next claim does not count as an attempt (set by a rate-limit requeue)
    #[serde(default)]
    pub skip_attempt: bool,
}

impl UrlEntry {
    /// A freshly written row, as the webhook handler leaves it.
    pub fn pending(shop: &str, url: &str, action: IndexAction, event_at: i64) -> Self {
        Self {
            shop: shop.to_string(),
            url: url.to_string(),
            index_action: action,
            status: UrlStatus::Pending,
            attempts: 0,
            last_event_at: event_at,
            last_indexed_at: None,
            claimed_at: None,
            claim_token: None,
            retry_after: None,
            last_error: None,
            skip_attempt: false,
        }
    }

    /// `attempts` once this entry is claimed: unchanged after a rate-limit requeue,
    /// otherwise one more, never past `max_attempts`.
    pub fn attempts_after_claim(&self, max_attempts: u32) -> u32 {
        if self.skip_attempt || self.attempts >= max_attempts {
            self.attempts
        } else {
            self.attempts + 1
        }
    }

    /// Whether L1 may claim this entry at `now`.
    ///
    /// PENDING rows are claimable once their backoff has elapsed; PROCESSING rows
    /// only once their lease has expired (abandoned by a crashed worker).
    pub fn is_claimable(&self, now: i64, lease_ms: i64) -> bool {
        if self.index_action == IndexAction::Ignore {
            return false;
        }
        match self.status {
            UrlStatus::Pending => self.retry_after.map_or(true, |t| t <= now),
            UrlStatus::Processing => self.claimed_at.map_or(true, |c| now - c > lease_ms),
            UrlStatus::Completed | UrlStatus::Failed => false,
        }
    }

    /// Whether batch `token` still owns this entry's claim.
    pub fn is_held_by(&self, token: &str) -> bool {
        self.status == UrlStatus::Processing && self.claim_token.as_deref() == Some(token)
    }
}

/// Tenant configuration as stored alongside the backlog.
///
/// Credentials are `iv.tag.ciphertext` blobs (see [`crate::cipher`]); they are only
/// decrypted in memory for the duration of a job or batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopProfile {
    pub shop: String,
    /// False once the shop uninstalls; in-flight work is short-circuited
    pub active: bool,
    /// Public site URL (Bing `siteUrl`); defaults to `https://{shop}`
    pub site_url: Option<String>,
    /// Encrypted Google service-account JSON
    pub google_credential: Option<String>,
    /// Encrypted Bing Webmaster API key
    pub bing_credential: Option<String>,
    pub google_daily_limit: Option<u32>,
    pub bing_daily_limit: Option<u32>,
    /// Engine preference order; the first engine with budget takes an entry
    pub engines: Vec<Engine>,
}

impl ShopProfile {
    pub fn new(shop: &str) -> Self {
        Self {
            shop: shop.to_string(),
            active: true,
            site_url: None,
            google_credential: None,
            bing_credential: None,
            google_daily_limit: None,
            bing_daily_limit: None,
            engines: Engine::ALL.to_vec(),
        }
    }

    pub fn credential(&self, engine: Engine) -> Option<&str> {
        match engine {
            Engine::Google => self.google_credential.as_deref(),
            Engine::Bing => self.bing_credential.as_deref(),
        }
    }

    pub fn daily_limit(&self, engine: Engine) -> u32 {
        let custom = match engine {
            Engine::Google => self.google_daily_limit,
            Engine::Bing => self.bing_daily_limit,
        };
        custom.unwrap_or_else(|| engine.default_daily_limit())
    }

    pub fn site_url(&self) -> String {
        self.site_url
            .clone()
            .unwrap_or_else(|| format!("https://{}", self.shop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_strings() {
        for status in [UrlStatus::Pending, UrlStatus::Processing, UrlStatus::Completed, UrlStatus::Failed] {
            assert_eq!(status.as_str().parse::<UrlStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<UrlStatus>().is_err());
    }

    #[test]
    fn test_engine_supports() {
        assert!(Engine::Google.supports(IndexAction::Index));
        assert!(Engine::Google.supports(IndexAction::Delete));
        assert!(Engine::Bing.supports(IndexAction::Index));
        assert!(!Engine::Bing.supports(IndexAction::Delete));
        assert!(!Engine::Google.supports(IndexAction::Ignore));
    }

    #[test]
    fn test_pending_entry_claimable_after_backoff() {
        let mut entry = UrlEntry::pending("s", "https://s/a", IndexAction::Index, 0);
        assert!(entry.is_claimable(10, 1_000));

        entry.retry_after = Some(50);
        assert!(!entry.is_claimable(10, 1_000));
        assert!(entry.is_claimable(50, 1_000));
    }

    #[test]
    fn test_processing_entry_claimable_only_after_lease() {
        let mut entry = UrlEntry::pending("s", "https://s/a", IndexAction::Index, 0);
        entry.status = UrlStatus::Processing;
        entry.claimed_at = Some(100);

        assert!(!entry.is_claimable(1_100, 1_000));
        assert!(entry.is_claimable(1_101, 1_000));
    }

    #[test]
    fn test_ignore_and_terminal_never_claimable() {
        let ignored = UrlEntry::pending("s", "https://s/a", IndexAction::Ignore, 0);
        assert!(!ignored.is_claimable(10, 1_000));

        let mut done = UrlEntry::pending("s", "https://s/b", IndexAction::Index, 0);
        done.status = UrlStatus::Completed;
        assert!(!done.is_claimable(10, 1_000));
    }

    #[test]
    fn test_profile_limits_and_site_url() {
        let mut profile = ShopProfile::new("demo.myshopify.com");
        assert_eq!(profile.daily_limit(Engine::Google), 200);
        assert_eq!(profile.daily_limit(Engine::Bing), 10_000);

        profile.bing_daily_limit = Some(50);
        assert_eq!(profile.daily_limit(Engine::Bing), 50);
        assert_eq!(profile.site_url(), "https://demo.myshopify.com");
    }
}
