use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;

use super::{BucketOutcome, BucketParams, Store, WindowOutcome, WindowParams};
use crate::error::StoreError;

const SCAN_BATCH: usize = 200;

/// Refill, take and persist in one server-side step.
/// Returns `{allowed, tokens}` with tokens as a decimal string, since Lua
/// numbers are truncated to integers on the way out.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(state[1]) or capacity
local last_refill = tonumber(state[2]) or now

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + elapsed * rate)

local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill', tostring(now))
redis.call('EXPIRE', KEYS[1], ttl)
return {allowed, tostring(tokens)}
"#;

/// Evict, count and conditionally append in one server-side step.
/// Returns `{allowed, count_before, oldest_score_or_empty}`.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local max_requests = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
local first = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local oldest = first[2] or ''

if count < max_requests then
  redis.call('ZADD', KEYS[1], now, ARGV[5])
  redis.call('EXPIRE', KEYS[1], ttl)
  return {1, count, oldest}
end
return {0, count, oldest}
"#;

const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// [`Store`] backed by Redis.
///
/// Uses a [`ConnectionManager`], a multiplexed connection that reconnects on
/// its own and is shared by every clone. The rate-limit steps run as Lua
/// scripts so each check is atomic per key across all replicas.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    token_bucket: Arc<Script>,
    sliding_window: Arc<Script>,
    compare_and_delete: Arc<Script>,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let store = Self {
            conn,
            token_bucket: Arc::new(Script::new(TOKEN_BUCKET_SCRIPT)),
            sliding_window: Arc::new(Script::new(SLIDING_WINDOW_SCRIPT)),
            compare_and_delete: Arc::new(Script::new(COMPARE_AND_DELETE_SCRIPT)),
        };
        store.ping().await?;
        Ok(store)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let updated: i64 = ::redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn sorted_range(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let mut conn = self.conn.clone();
        let items: Vec<(String, f64)> = ::redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn token_bucket(
        &self,
        key: &str,
        params: BucketParams,
    ) -> Result<BucketOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let (allowed, tokens): (i64, String) = self
            .token_bucket
            .key(key)
            .arg(params.capacity)
            .arg(params.rate)
            .arg(params.now)
            .arg(ttl_secs(params.ttl))
            .invoke_async(&mut conn)
            .await?;
        let tokens = tokens.parse::<f64>().map_err(|e| StoreError::Corrupted {
            key: key.to_string(),
            reason: format!("tokens: {e}"),
        })?;
        Ok(BucketOutcome {
            allowed: allowed == 1,
            tokens,
        })
    }

    async fn sliding_window(
        &self,
        key: &str,
        params: WindowParams,
    ) -> Result<WindowOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let (allowed, count, oldest): (i64, u64, String) = self
            .sliding_window
            .key(key)
            .arg(params.max_requests)
            .arg(params.window)
            .arg(params.now)
            .arg(ttl_secs(params.ttl))
            .arg(&params.member)
            .invoke_async(&mut conn)
            .await?;
        Ok(WindowOutcome {
            allowed: allowed == 1,
            count,
            oldest: oldest.parse::<f64>().ok(),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
