//! In-process counter store for single-instance deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::{BlockStatus, CounterStore, DEFAULT_KEY_PREFIX};
use crate::error::Result;
use crate::ratelimit::{block_store_key, Identifier, WindowKey};

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: Instant,
}

/// A counter store held in process memory.
///
/// Each operation runs under the lock of the map shard owning its key, which
/// makes increment-with-expiry atomic. TTLs are measured on the tokio clock,
/// so expiry can be driven deterministically with paused time in tests.
///
/// Expired entries are ignored on read and reclaimed by [`MemoryStore::purge_expired`].
#[derive(Debug)]
pub struct MemoryStore {
    prefix: String,
    counters: DashMap<String, Counter>,
    blocks: DashMap<String, Instant>,
}

impl MemoryStore {
    /// Create an empty store using the default key prefix.
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_KEY_PREFIX)
    }

    /// Create an empty store using a custom key prefix.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            counters: DashMap::new(),
            blocks: DashMap::new(),
        }
    }

    /// Current value of a live window counter.
    pub fn counter_value(&self, key: &WindowKey) -> Option<u64> {
        let now = Instant::now();
        self.counters
            .get(&key.to_store_key(&self.prefix))
            .filter(|c| c.expires_at > now)
            .map(|c| c.count)
    }

    /// Number of counters and block markers held, including expired ones
    /// not yet purged.
    pub fn len(&self) -> usize {
        self.counters.len() + self.blocks.len()
    }

    /// Whether the store holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired counter and block marker.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.counters.retain(|_, c| {
            let live = c.expires_at > now;
            removed += usize::from(!live);
            live
        });
        self.blocks.retain(|_, expires_at| {
            let live = *expires_at > now;
            removed += usize::from(!live);
            live
        });

        trace!(removed, "Purged expired entries");
        removed
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &WindowKey, window_ttl: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut counter = self
            .counters
            .entry(key.to_store_key(&self.prefix))
            .or_insert(Counter {
                count: 0,
                expires_at: now,
            });

        if counter.expires_at <= now {
            counter.count = 0;
        }

        counter.count += 1;
        if counter.count == 1 {
            counter.expires_at = now + window_ttl;
        }

        Ok(counter.count)
    }

    async fn set_blocked(&self, identifier: &Identifier, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return Ok(());
        }

        self.blocks.insert(
            block_store_key(&self.prefix, identifier),
            Instant::now() + duration,
        );
        Ok(())
    }

    async fn is_blocked(&self, identifier: &Identifier) -> Result<BlockStatus> {
        let now = Instant::now();
        let status = match self.blocks.get(&block_store_key(&self.prefix, identifier)) {
            Some(expires_at) if *expires_at > now => BlockStatus::blocked(*expires_at - now),
            _ => BlockStatus::clear(),
        };
        Ok(status)
    }
}
