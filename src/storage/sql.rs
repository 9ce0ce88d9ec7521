// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backlog store (MySQL or SQLite via sqlx `Any`).
//!
//! ```sql
//! CREATE TABLE url_entries (
//!   shop VARCHAR(255), url VARCHAR(512),
//!   index_action VARCHAR(16),   -- INDEX | DELETE | IGNORE
//!   status VARCHAR(16),         -- PENDING | PROCESSING | COMPLETED | FAILED
//!   attempts BIGINT,
//!   last_event_at BIGINT,       -- epoch ms, written by the webhook handler
//!   last_indexed_at BIGINT,
//!   claimed_at BIGINT,          -- lease start while PROCESSING
//!   claim_token VARCHAR(64),    -- batch id holding the lease
//!   retry_after BIGINT,         -- requeue backoff gate
//!   last_error TEXT,
//!   skip_attempt INT,           -- 1 after a rate-limit requeue: next claim is free
//!   PRIMARY KEY (shop, url)
//! )
//! ```
//!
//! Every transition is a single conditional `UPDATE`; `rows_affected() == 1` is the
//! CAS success signal. No row locks are held between statements.
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL TEXT columns come back as BLOB through `Any`, so text columns are read as
//! `String` first and `Vec<u8>` second.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;

use super::traits::{BacklogStore, Claim, StorageError};
use crate::model::{Engine, IndexAction, ShopProfile, UrlEntry, UrlStatus};
use crate::resilience::retry::{retry, RetryConfig};
use crate::transition::Resolution;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const ENTRY_COLUMNS: &str = "shop, url, index_action, status, attempts, last_event_at, last_indexed_at, \
     claimed_at, claim_token, retry_after, last_error, skip_attempt";

/// Rows L1 may claim. Binds: `now`, `now - lease_ms`.
const CLAIMABLE: &str = "index_action <> 'IGNORE' AND (\
     (status = 'PENDING' AND (retry_after IS NULL OR retry_after <= ?)) \
     OR (status = 'PROCESSING' AND (claimed_at IS NULL OR claimed_at < ?)))";

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct SqlBacklogStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlBacklogStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and create
    /// tables if missing.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 4 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self { pool, is_sqlite };
        if is_sqlite {
            store.enable_wal_mode().await?;
        }
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set busy timeout: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS url_entries (
                    shop TEXT NOT NULL,
                    url TEXT NOT NULL,
                    index_action TEXT NOT NULL DEFAULT 'INDEX',
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_event_at INTEGER NOT NULL,
                    last_indexed_at INTEGER,
                    claimed_at INTEGER,
                    claim_token TEXT,
                    retry_after INTEGER,
                    last_error TEXT,
                    skip_attempt INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (shop, url)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_url_entries_claimable ON url_entries (shop, status, last_event_at)",
                r#"
                CREATE TABLE IF NOT EXISTS shop_profiles (
                    shop TEXT PRIMARY KEY,
                    active INTEGER NOT NULL DEFAULT 1,
                    site_url TEXT,
                    google_credential TEXT,
                    bing_credential TEXT,
                    google_daily_limit INTEGER,
                    bing_daily_limit INTEGER,
                    engines TEXT NOT NULL DEFAULT 'google,bing'
                )
                "#,
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS url_entries (
                    shop VARCHAR(255) NOT NULL,
                    url VARCHAR(512) NOT NULL,
                    index_action VARCHAR(16) NOT NULL DEFAULT 'INDEX',
                    status VARCHAR(16) NOT NULL DEFAULT 'PENDING',
                    attempts BIGINT NOT NULL DEFAULT 0,
                    last_event_at BIGINT NOT NULL,
                    last_indexed_at BIGINT,
                    claimed_at BIGINT,
                    claim_token VARCHAR(64),
                    retry_after BIGINT,
                    last_error TEXT,
                    skip_attempt BIGINT NOT NULL DEFAULT 0,
                    PRIMARY KEY (shop, url),
                    INDEX idx_url_entries_claimable (shop, status, last_event_at)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS shop_profiles (
                    shop VARCHAR(255) PRIMARY KEY,
                    active BIGINT NOT NULL DEFAULT 1,
                    site_url VARCHAR(512),
                    google_credential TEXT,
                    bing_credential TEXT,
                    google_daily_limit BIGINT,
                    bing_daily_limit BIGINT,
                    engines VARCHAR(64) NOT NULL DEFAULT 'google,bing'
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    /// Read a text column: `String` on SQLite, bytes on MySQL.
    fn text(row: &AnyRow, column: &str) -> Option<String> {
        row.try_get::<Option<String>, _>(column).ok().flatten().or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(column)
                .ok()
                .flatten()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    fn int(row: &AnyRow, column: &str) -> Option<i64> {
        row.try_get::<Option<i64>, _>(column).ok().flatten()
    }

    fn row_to_entry(row: &AnyRow) -> Result<UrlEntry, StorageError> {
        let shop = Self::text(row, "shop").unwrap_or_default();
        let url = Self::text(row, "url").unwrap_or_default();
        let corrupt = |reason: String| StorageError::Corruption {
            key: format!("{}|{}", shop, url),
            reason,
        };

        let index_action = Self::text(row, "index_action")
            .unwrap_or_default()
            .parse::<IndexAction>()
            .map_err(|e| corrupt(e.to_string()))?;
        let status = Self::text(row, "status")
            .unwrap_or_default()
            .parse::<UrlStatus>()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(UrlEntry {
            index_action,
            status,
            attempts: Self::int(row, "attempts").unwrap_or(0).max(0) as u32,
            last_event_at: Self::int(row, "last_event_at").unwrap_or(0),
            last_indexed_at: Self::int(row, "last_indexed_at"),
            claimed_at: Self::int(row, "claimed_at"),
            claim_token: Self::text(row, "claim_token"),
            retry_after: Self::int(row, "retry_after"),
            last_error: Self::text(row, "last_error"),
            skip_attempt: Self::int(row, "skip_attempt").unwrap_or(0) != 0,
            shop,
            url,
        })
    }

    fn row_to_profile(row: &AnyRow) -> ShopProfile {
        let engines = Self::text(row, "engines")
            .map(|raw| parse_engines(&raw))
            .unwrap_or_else(|| Engine::ALL.to_vec());
        let limit = |column: &str| Self::int(row, column).map(|v| v.clamp(0, u32::MAX as i64) as u32);

        ShopProfile {
            shop: Self::text(row, "shop").unwrap_or_default(),
            active: Self::int(row, "active").unwrap_or(1) != 0,
            site_url: Self::text(row, "site_url"),
            google_credential: Self::text(row, "google_credential"),
            bing_credential: Self::text(row, "bing_credential"),
            google_daily_limit: limit("google_daily_limit"),
            bing_daily_limit: limit("bing_daily_limit"),
            engines,
        }
    }
}

/// Parse `"google,bing"`; unknown names are skipped.
fn parse_engines(raw: &str) -> Vec<Engine> {
    raw.split(',')
        .filter_map(|name| name.trim().parse::<Engine>().ok())
        .collect()
}

fn join_engines(engines: &[Engine]) -> String {
    engines.iter().map(Engine::as_str).collect::<Vec<_>>().join(",")
}

#[async_trait]
impl BacklogStore for SqlBacklogStore {
    async fn record_event(
        &self,
        shop: &str,
        url: &str,
        action: IndexAction,
        event_at: i64,
    ) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO url_entries (shop, url, index_action, status, attempts, last_event_at)
             VALUES (?, ?, ?, 'PENDING', 0, ?)
             ON CONFLICT(shop, url) DO UPDATE SET
                index_action = excluded.index_action,
                status = 'PENDING',
                attempts = 0,
                last_event_at = excluded.last_event_at,
                claimed_at = NULL,
                claim_token = NULL,
                retry_after = NULL,
                skip_attempt = 0"
        } else {
            "INSERT INTO url_entries (shop, url, index_action, status, attempts, last_event_at)
             VALUES (?, ?, ?, 'PENDING', 0, ?)
             ON DUPLICATE KEY UPDATE
                index_action = VALUES(index_action),
                status = 'PENDING',
                attempts = 0,
                last_event_at = VALUES(last_event_at),
                claimed_at = NULL,
                claim_token = NULL,
                retry_after = NULL,
                skip_attempt = 0"
        };

        retry("sql_record_event", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(shop)
                .bind(url)
                .bind(action.as_str())
                .bind(event_at)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn pending_shops(&self, now: i64, lease_ms: i64) -> Result<Vec<String>, StorageError> {
        let sql = format!("SELECT DISTINCT shop FROM url_entries WHERE {} ORDER BY shop", CLAIMABLE);
        let rows = retry("sql_pending_shops", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(now)
                .bind(now - lease_ms)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        Ok(rows.iter().filter_map(|row| Self::text(row, "shop")).collect())
    }

    async fn load_claimable(
        &self,
        shop: &str,
        now: i64,
        lease_ms: i64,
        limit: usize,
    ) -> Result<Vec<UrlEntry>, StorageError> {
        let sql = format!(
            "SELECT {} FROM url_entries WHERE shop = ? AND {} ORDER BY last_event_at, url LIMIT ?",
            ENTRY_COLUMNS, CLAIMABLE
        );
        let rows = retry("sql_load_claimable", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(shop)
                .bind(now)
                .bind(now - lease_ms)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn try_claim(&self, entry: &UrlEntry, claim: &Claim) -> Result<bool, StorageError> {
        let sql = format!(
            "UPDATE url_entries SET
                status = 'PROCESSING',
                claimed_at = ?,
                claim_token = ?,
                retry_after = NULL,
                attempts = CASE WHEN skip_attempt = 0 AND attempts < ? THEN attempts + 1 ELSE attempts END,
                skip_attempt = 0
             WHERE shop = ? AND url = ? AND last_event_at = ? AND index_action = ? AND {}",
            CLAIMABLE
        );

        let result = retry("sql_try_claim", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(claim.now)
                .bind(&claim.token)
                .bind(claim.max_attempts as i64)
                .bind(&entry.shop)
                .bind(&entry.url)
                .bind(entry.last_event_at)
                .bind(entry.index_action.as_str())
                .bind(claim.now)
                .bind(claim.now - claim.lease_ms)
                .execute(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_entry(&self, shop: &str, url: &str) -> Result<Option<UrlEntry>, StorageError> {
        let sql = format!("SELECT {} FROM url_entries WHERE shop = ? AND url = ?", ENTRY_COLUMNS);
        let row = retry("sql_get_entry", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(shop)
                .bind(url)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn resolve(
        &self,
        shop: &str,
        url: &str,
        token: &str,
        resolution: &Resolution,
        now: i64,
    ) -> Result<bool, StorageError> {
        let result = retry("sql_resolve", &RetryConfig::query(), || async {
            let query = match resolution {
                Resolution::Complete => sqlx::query(
                    "UPDATE url_entries SET status = 'COMPLETED', last_indexed_at = ?, last_error = NULL, \
                     retry_after = NULL, claimed_at = NULL, claim_token = NULL, skip_attempt = 0 \
                     WHERE shop = ? AND url = ? AND status = 'PROCESSING' AND claim_token = ?",
                )
                .bind(now),
                Resolution::Fail { reason } => sqlx::query(
                    "UPDATE url_entries SET status = 'FAILED', last_error = ?, \
                     retry_after = NULL, claimed_at = NULL, claim_token = NULL, skip_attempt = 0 \
                     WHERE shop = ? AND url = ? AND status = 'PROCESSING' AND claim_token = ?",
                )
                .bind(reason.as_str()),
                Resolution::Requeue { retry_after, reason, counted } => sqlx::query(
                    "UPDATE url_entries SET status = 'PENDING', retry_after = ?, last_error = ?, \
                     skip_attempt = ?, claimed_at = NULL, claim_token = NULL \
                     WHERE shop = ? AND url = ? AND status = 'PROCESSING' AND claim_token = ?",
                )
                .bind(*retry_after)
                .bind(reason.as_str())
                .bind(if *counted { 0i64 } else { 1i64 }),
            };
            query
                .bind(shop)
                .bind(url)
                .bind(token)
                .execute(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn shop_profile(&self, shop: &str) -> Result<Option<ShopProfile>, StorageError> {
        let row = retry("sql_shop_profile", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT shop, active, site_url, google_credential, bing_credential, \
                 google_daily_limit, bing_daily_limit, engines FROM shop_profiles WHERE shop = ?",
            )
            .bind(shop)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)
        })
        .await?;

        Ok(row.as_ref().map(Self::row_to_profile))
    }

    async fn upsert_shop(&self, profile: &ShopProfile) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO shop_profiles (shop, active, site_url, google_credential, bing_credential, \
             google_daily_limit, bing_daily_limit, engines) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(shop) DO UPDATE SET \
                active = excluded.active, \
                site_url = excluded.site_url, \
                google_credential = excluded.google_credential, \
                bing_credential = excluded.bing_credential, \
                google_daily_limit = excluded.google_daily_limit, \
                bing_daily_limit = excluded.bing_daily_limit, \
                engines = excluded.engines"
        } else {
            "INSERT INTO shop_profiles (shop, active, site_url, google_credential, bing_credential, \
             google_daily_limit, bing_daily_limit, engines) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                active = VALUES(active), \
                site_url = VALUES(site_url), \
                google_credential = VALUES(google_credential), \
                bing_credential = VALUES(bing_credential), \
                google_daily_limit = VALUES(google_daily_limit), \
                bing_daily_limit = VALUES(bing_daily_limit), \
                engines = VALUES(engines)"
        };
        let engines = join_engines(&profile.engines);

        retry("sql_upsert_shop", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(&profile.shop)
                .bind(if profile.active { 1i64 } else { 0i64 })
                .bind(&profile.site_url)
                .bind(&profile.google_credential)
                .bind(&profile.bing_credential)
                .bind(profile.google_daily_limit.map(i64::from))
                .bind(profile.bing_daily_limit.map(i64::from))
                .bind(&engines)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (SqlBacklogStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backlog.db");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        (SqlBacklogStore::new(&url).await.unwrap(), dir)
    }

    fn claim(token: &str, now: i64) -> Claim {
        Claim { token: token.to_string(), now, lease_ms: 1_000, max_attempts: 2 }
    }

    #[test]
    fn test_engine_list_parsing() {
        assert_eq!(parse_engines("bing, google"), vec![Engine::Bing, Engine::Google]);
        assert_eq!(parse_engines("yandex,google"), vec![Engine::Google]);
        assert_eq!(join_engines(&[Engine::Google, Engine::Bing]), "google,bing");
    }

    #[tokio::test]
    async fn test_record_and_claim_cycle() {
        let (store, _dir) = store().await;
        store.record_event("s", "https://s/a", IndexAction::Index, 10).await.unwrap();

        let rows = store.load_claimable("s", 100, 1_000, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(store.try_claim(&rows[0], &claim("b1", 100)).await.unwrap());
        assert!(!store.try_claim(&rows[0], &claim("b2", 100)).await.unwrap());

        let row = store.get_entry("s", "https://s/a").await.unwrap().unwrap();
        assert_eq!(row.status, UrlStatus::Processing);
        assert_eq!(row.claim_token.as_deref(), Some("b1"));
        assert_eq!(row.attempts, 1);
        assert!(store.load_claimable("s", 200, 1_000, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_lease_is_reclaimable_and_attempts_capped() {
        let (store, _dir) = store().await;
        store.record_event("s", "https://s/a", IndexAction::Index, 10).await.unwrap();

        for (i, now) in [100i64, 1_200, 2_300].iter().enumerate() {
            let rows = store.load_claimable("s", *now, 1_000, 10).await.unwrap();
            assert_eq!(rows.len(), 1, "round {}", i);
            assert!(store.try_claim(&rows[0], &claim(&format!("b{}", i), *now)).await.unwrap());
        }

        let row = store.get_entry("s", "https://s/a").await.unwrap().unwrap();
        assert_eq!(row.attempts, 2);
        assert_eq!(row.claim_token.as_deref(), Some("b2"));
    }

    #[tokio::test]
    async fn test_resolve_and_supersede() {
        let (store, _dir) = store().await;
        store.record_event("s", "https://s/a", IndexAction::Index, 10).await.unwrap();
        let rows = store.load_claimable("s", 100, 1_000, 10).await.unwrap();
        store.try_claim(&rows[0], &claim("b1", 100)).await.unwrap();

        // A newer webhook event lands while the batch is in flight
        store.record_event("s", "https://s/a", IndexAction::Delete, 150).await.unwrap();
        assert!(!store.resolve("s", "https://s/a", "b1", &Resolution::Complete, 200).await.unwrap());

        let row = store.get_entry("s", "https://s/a").await.unwrap().unwrap();
        assert_eq!(row.status, UrlStatus::Pending);
        assert_eq!(row.index_action, IndexAction::Delete);
        assert_eq!(row.attempts, 0);
    }

    #[tokio::test]
    async fn test_requeue_sets_backoff_gate() {
        let (store, _dir) = store().await;
        store.record_event("s", "https://s/a", IndexAction::Index, 10).await.unwrap();
        let rows = store.load_claimable("s", 100, 1_000, 10).await.unwrap();
        store.try_claim(&rows[0], &claim("b1", 100)).await.unwrap();

        let requeue = Resolution::Requeue {
            retry_after: 5_000,
            reason: "RATE_LIMITED (429)".into(),
            counted: false,
        };
        assert!(store.resolve("s", "https://s/a", "b1", &requeue, 200).await.unwrap());

        assert!(store.load_claimable("s", 4_999, 1_000, 10).await.unwrap().is_empty());
        assert_eq!(store.pending_shops(5_000, 1_000).await.unwrap(), vec!["s".to_string()]);

        let row = store.get_entry("s", "https://s/a").await.unwrap().unwrap();
        assert_eq!(row.last_error.as_deref(), Some("RATE_LIMITED (429)"));
        assert!(row.claim_token.is_none());
        assert!(row.skip_attempt);

        // The rate-limited cycle is not charged on the next claim
        let rows = store.load_claimable("s", 5_000, 1_000, 10).await.unwrap();
        assert!(store.try_claim(&rows[0], &claim("b2", 5_000)).await.unwrap());
        let row = store.get_entry("s", "https://s/a").await.unwrap().unwrap();
        assert_eq!(row.attempts, 1);
        assert!(!row.skip_attempt);
    }

    #[tokio::test]
    async fn test_shop_profile_roundtrip() {
        let (store, _dir) = store().await;
        let mut profile = ShopProfile::new("demo.myshopify.com");
        profile.bing_credential = Some("iv.tag.ct".into());
        profile.google_daily_limit = Some(50);
        profile.engines = vec![Engine::Bing, Engine::Google];
        store.upsert_shop(&profile).await.unwrap();

        let loaded = store.shop_profile("demo.myshopify.com").await.unwrap().unwrap();
        assert_eq!(loaded, profile);

        profile.active = false;
        store.upsert_shop(&profile).await.unwrap();
        assert!(!store.shop_profile("demo.myshopify.com").await.unwrap().unwrap().active);
        assert!(store.shop_profile("missing").await.unwrap().is_none());
    }
}
