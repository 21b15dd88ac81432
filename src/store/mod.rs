//! Shared counter store.
//!
//! Admission state (window counters and block markers) lives in a store
//! shared by every instance of the service. The engine relies only on the
//! atomic primitives of [`CounterStore`]; no in-process locking is layered
//! on top, so the store's atomicity is what keeps limits correct across
//! instances.

mod memory;
mod redis_store;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::ratelimit::{Identifier, WindowKey};

pub use self::memory::MemoryStore;
pub use self::redis_store::{RedisStore, RedisStoreConfig};

/// Default prefix for every key the service writes.
pub const DEFAULT_KEY_PREFIX: &str = "rl";

/// Whether an identifier is blocked, and for how much longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockStatus {
    pub blocked: bool,
    pub remaining: Duration,
}

impl BlockStatus {
    /// A live block with the given remaining time to live.
    pub fn blocked(remaining: Duration) -> Self {
        Self {
            blocked: true,
            remaining,
        }
    }

    /// No live block marker.
    pub fn clear() -> Self {
        Self::default()
    }
}

/// Atomic operations the decision engine needs from a shared store.
///
/// Every operation may fail with `StoreUnavailable`; implementations never
/// retry internally.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the window counter and return its new value.
    ///
    /// When the increment creates the counter, its expiry is set to
    /// `window_ttl` in the same logical operation.
    async fn increment(&self, key: &WindowKey, window_ttl: Duration) -> Result<u64>;

    /// Mark `identifier` as blocked for `duration`, overwriting any existing marker.
    ///
    /// A zero duration is a no-op.
    async fn set_blocked(&self, identifier: &Identifier, duration: Duration) -> Result<()>;

    /// Whether a live block marker exists and its remaining time to live.
    async fn is_blocked(&self, identifier: &Identifier) -> Result<BlockStatus>;
}
