//! Redis backends: consumer-group streams and quota counters.
//!
//! Streams are plain Redis streams with one field per entry:
//!
//! ```text
//! XADD indexer:batches MAXLEN ~ 100000 * payload '{"type":"batch",...}'
//! XREADGROUP GROUP index-workers node-a-index-0-1f2e3d4c COUNT 10 BLOCK 2000 STREAMS indexer:batches >
//! ```
//!
//! Recovery of abandoned deliveries uses `XPENDING ... IDLE <ms>` (the server picks
//! the idle entries and reports delivery counts) followed by `XCLAIM`. Backlog for backpressure comes from `XINFO GROUPS`
//! (`pending` + `lag`).
//!
//! Quota counters are reserved by a Lua script so concurrent workers never
//! over-commit a day's budget.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client, Script, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::traits::{Delivery, QuotaStore, StorageError, StreamBus};
use crate::messages::PAYLOAD_FIELD;
use crate::resilience::retry::{retry, RetryConfig};

fn backend(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Open a managed connection with startup-mode retry.
pub async fn connect(connection_string: &str) -> Result<ConnectionManager, StorageError> {
    let client = Client::open(connection_string).map_err(backend)?;

    // Use startup config: fast-fail, don't hang forever
    retry("redis_connect", &RetryConfig::startup(), || async {
        ConnectionManager::new(client.clone()).await
    })
    .await
    .map_err(backend)
}

fn payload_of(entry: &StreamId) -> Option<String> {
    entry.get::<String>(PAYLOAD_FIELD)
}

// ═══════════════════════════════════════════════════════════════════════════
// Streams
// ═══════════════════════════════════════════════════════════════════════════

pub struct RedisStreamBus {
    connection: ConnectionManager,
    /// Approximate cap applied on every XADD
    max_len: usize,
}

impl RedisStreamBus {
    pub async fn new(connection_string: &str, max_len: usize) -> Result<Self, StorageError> {
        Ok(Self::with_connection(connect(connection_string).await?, max_len))
    }

    pub fn with_connection(connection: ConnectionManager, max_len: usize) -> Self {
        Self { connection, max_len }
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

/// `XINFO GROUPS` row for one group.
fn group_backlog(groups: &[HashMap<String, Value>], group: &str) -> Option<u64> {
    let as_u64 = |v: Option<&Value>| match v {
        Some(Value::Int(i)) => Some((*i).max(0) as u64),
        Some(Value::BulkString(bytes)) => std::str::from_utf8(bytes).ok()?.parse().ok(),
        _ => None,
    };
    let as_str = |v: Option<&Value>| match v {
        Some(Value::BulkString(bytes)) => std::str::from_utf8(bytes).ok().map(str::to_string),
        Some(Value::SimpleString(s)) => Some(s.clone()),
        _ => None,
    };

    groups
        .iter()
        .find(|row| as_str(row.get("name")).as_deref() == Some(group))
        .map(|row| as_u64(row.get("pending")).unwrap_or(0) + as_u64(row.get("lag")).unwrap_or(0))
}

#[async_trait]
impl StreamBus for RedisStreamBus {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        match conn.xgroup_create_mkstream::<_, _, _, ()>(stream, group, "$").await {
            Ok(()) => {
                info!(stream, group, "Created consumer group");
                Ok(())
            }
            // Group already exists, which is fine
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(backend(e)),
        }
    }

    async fn publish(&self, stream: &str, payload: &str) -> Result<String, StorageError> {
        let mut conn = self.connection.clone();
        conn.xadd_maxlen::<_, _, _, _, String>(
            stream,
            StreamMaxlen::Approx(self.max_len),
            "*",
            &[(PAYLOAD_FIELD, payload)],
        )
        .await
        .map_err(backend)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, StorageError> {
        let mut conn = self.connection.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .block(block.as_millis().max(1) as usize)
            .count(count);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(backend)?;

        Ok(reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|key| key.ids)
            .map(|entry| Delivery {
                payload: payload_of(&entry),
                id: entry.id,
                deliveries: 1,
            })
            .collect())
    }

    async fn reclaim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>, StorageError> {
        let mut conn = self.connection.clone();
        let min_idle_ms = min_idle.as_millis() as usize;

        // IDLE needs Redis 6.2+; busy entries ahead of idle ones are skipped server-side
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        let stale: HashMap<String, u64> = pending
            .ids
            .iter()
            .map(|p| (p.id.clone(), p.times_delivered as u64))
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = stale.keys().map(String::as_str).collect();
        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, &ids)
            .await
            .map_err(backend)?;

        let deliveries: Vec<Delivery> = claimed
            .ids
            .into_iter()
            .map(|entry| Delivery {
                payload: payload_of(&entry),
                // XCLAIM bumps the counter
                deliveries: stale.get(&entry.id).copied().unwrap_or(0) + 1,
                id: entry.id,
            })
            .collect();

        if !deliveries.is_empty() {
            debug!(stream, group, consumer, reclaimed = deliveries.len(), "Reclaimed idle deliveries");
        }
        Ok(deliveries)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        conn.xack::<_, _, _, ()>(stream, group, &[id]).await.map_err(backend)
    }

    async fn backlog(&self, stream: &str, group: &str) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        let groups: Vec<HashMap<String, Value>> = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(group_backlog(&groups, group).unwrap_or(0))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Quota
// ═══════════════════════════════════════════════════════════════════════════

/// KEYS[1] = counter, ARGV = limit, requested, ttl seconds. Returns units granted.
const RESERVE_SCRIPT: &str = r#"
local used = tonumber(redis.call('GET', KEYS[1]) or '0')
local limit = tonumber(ARGV[1])
local want = tonumber(ARGV[2])
local grant = math.min(want, math.max(limit - used, 0))
if grant > 0 then
  redis.call('INCRBY', KEYS[1], grant)
end
if redis.call('TTL', KEYS[1]) < 0 then
  redis.call('EXPIRE', KEYS[1], tonumber(ARGV[3]))
end
return grant
"#;

pub struct RedisQuotaStore {
    connection: ConnectionManager,
    script: Script,
}

impl RedisQuotaStore {
    pub fn with_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            script: Script::new(RESERVE_SCRIPT),
        }
    }
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn reserve_up_to(&self, key: &str, limit: u32, n: u32, ttl: Duration) -> Result<u32, StorageError> {
        if n == 0 {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let granted: i64 = self
            .script
            .key(key)
            .arg(limit)
            .arg(n)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(granted.clamp(0, n as i64) as u32)
    }

    async fn used(&self, key: &str) -> Result<u32, StorageError> {
        let mut conn = self.connection.clone();
        let used: Option<u32> = conn.get(key).await.map_err(backend)?;
        Ok(used.unwrap_or(0))
    }
}
