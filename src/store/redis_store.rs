//! Redis-backed counter store.
//!
//! Provides the shared store for multi-instance deployments. Every instance
//! of the service talks to the same Redis server, so window counters and
//! block markers are visible cluster-wide.
//!
//! ## Key layout
//!
//! - `{prefix}:cnt:{identifier}:{epoch_second}`: window counter, expires after one window
//! - `{prefix}:block:{identifier}`: block marker, expires after the block duration
//!
//! ## Atomicity
//!
//! Increment-with-expiry runs as one Lua script, so a counter is never
//! created without its expiry even if the client disconnects between the
//! two commands. Block markers are written with a single `SET ... PX`.
//!
//! ## Timeouts
//!
//! Every command is bounded by [`RedisStoreConfig::command_timeout`]. A
//! command that does not complete in time surfaces as `StoreUnavailable`;
//! nothing is retried here.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo, Script};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{BlockStatus, CounterStore, DEFAULT_KEY_PREFIX};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{block_store_key, Identifier, WindowKey};

/// Increment a counter and give it an expiry when the increment created it.
///
/// KEYS[1] = counter key, ARGV[1] = TTL in milliseconds.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix for every key written (default: "rl")
    pub key_prefix: String,
    /// Upper bound on a single command round-trip (default: 500ms)
    pub command_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            command_timeout: Duration::from_millis(500),
        }
    }
}

/// Redis-backed counter store shared by all service instances.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    increment_script: Script,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1/")
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration and verify the server answers.
    ///
    /// `target` is a connection URL or a prepared [`redis::ConnectionInfo`].
    pub async fn connect_with_config<T>(target: T, config: RedisStoreConfig) -> Result<Self>
    where
        T: IntoConnectionInfo,
    {
        info!(
            key_prefix = %config.key_prefix,
            command_timeout_ms = config.command_timeout.as_millis() as u64,
            "Connecting to Redis"
        );

        let client = Client::open(target)
            .map_err(|e| TurnstileError::Config(format!("invalid Redis URL: {}", e)))?;
        let connection = with_timeout(config.command_timeout, ConnectionManager::new(client)).await?;

        let store = Self {
            connection,
            increment_script: Script::new(INCREMENT_SCRIPT),
            config,
        };
        store.ping().await?;

        info!("Connected to Redis");
        Ok(store)
    }

    /// Round-trip a PING to the server.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = with_timeout(
            self.config.command_timeout,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &WindowKey, window_ttl: Duration) -> Result<u64> {
        let store_key = key.to_store_key(&self.config.key_prefix);
        let mut conn = self.connection.clone();

        let count: u64 = with_timeout(
            self.config.command_timeout,
            self.increment_script
                .key(&store_key)
                .arg(ttl_millis(window_ttl))
                .invoke_async(&mut conn),
        )
        .await
        .inspect_err(|e| warn!(key = %store_key, error = %e, "Failed to increment window counter"))?;

        debug!(key = %store_key, count, "Incremented window counter");
        Ok(count)
    }

    async fn set_blocked(&self, identifier: &Identifier, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return Ok(());
        }

        let store_key = block_store_key(&self.config.key_prefix, identifier);
        let mut conn = self.connection.clone();

        let _: () = with_timeout(
            self.config.command_timeout,
            redis::cmd("SET")
                .arg(&store_key)
                .arg(1)
                .arg("PX")
                .arg(ttl_millis(duration))
                .query_async(&mut conn),
        )
        .await
        .inspect_err(|e| warn!(key = %store_key, error = %e, "Failed to set block marker"))?;

        Ok(())
    }

    async fn is_blocked(&self, identifier: &Identifier) -> Result<BlockStatus> {
        let store_key = block_store_key(&self.config.key_prefix, identifier);
        let mut conn = self.connection.clone();

        // -2 when the key is missing, -1 when it has no expiry
        let ttl_ms: i64 = with_timeout(
            self.config.command_timeout,
            redis::cmd("PTTL").arg(&store_key).query_async(&mut conn),
        )
        .await
        .inspect_err(|e| warn!(key = %store_key, error = %e, "Failed to read block marker"))?;

        if ttl_ms > 0 {
            Ok(BlockStatus::blocked(Duration::from_millis(ttl_ms as u64)))
        } else {
            Ok(BlockStatus::clear())
        }
    }
}

/// TTL in whole milliseconds, never below one.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Await a Redis future, failing with `StoreUnavailable` after `limit`.
async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(TurnstileError::from),
        Err(_) => Err(TurnstileError::StoreUnavailable(format!(
            "Redis command timed out after {}ms",
            limit.as_millis()
        ))),
    }
}
