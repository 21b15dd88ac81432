//! The admission decision engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::AdmissionBackend;
use super::identity::Identifier;
use super::rules::Rule;
use super::window::{WindowKey, WINDOW};
use crate::error::Result;
use crate::store::CounterStore;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the request may proceed
    pub allowed: bool,
    /// How long the caller should wait; only meaningful when denied
    pub retry_after: Duration,
}

impl Verdict {
    /// Admit the request.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    /// Deny the request with a retry hint.
    pub fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

/// Fixed-window admission engine over a shared [`CounterStore`].
///
/// The engine holds no state of its own. Concurrent checks for the same
/// identifier may interleave their store calls freely: the counter increment
/// is atomic in the store and the exceedance test is a local comparison on
/// the value it returns.
pub struct DecisionEngine {
    store: Arc<dyn CounterStore>,
}

impl DecisionEngine {
    /// Create an engine over the given store.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Check whether `identifier` may proceed under `rule` at `now`.
    ///
    /// A blocked identifier is denied before any counting, so denied
    /// requests never add to its window count while the block lasts.
    /// Store failures are returned unchanged and never retried.
    pub async fn check(
        &self,
        identifier: &Identifier,
        rule: &Rule,
        now: DateTime<Utc>,
    ) -> Result<Verdict> {
        if rule.is_unlimited() {
            return Ok(Verdict::allow());
        }

        let block = self.store.is_blocked(identifier).await?;
        if block.blocked {
            trace!(
                identifier = %identifier,
                remaining_ms = block.remaining.as_millis() as u64,
                "Identifier is blocked"
            );
            return Ok(Verdict::deny(block.remaining));
        }

        let key = WindowKey::at(identifier, now);
        let count = self.store.increment(&key, WINDOW).await?;

        trace!(
            identifier = %identifier,
            window = key.epoch_second,
            count,
            limit = rule.limit,
            "Counted request"
        );

        if count <= rule.limit {
            return Ok(Verdict::allow());
        }

        debug!(
            identifier = %identifier,
            count,
            limit = rule.limit,
            block_secs = rule.block.as_secs(),
            "Rate limit exceeded"
        );

        if !rule.block.is_zero() {
            self.store.set_blocked(identifier, rule.block).await?;
        }

        Ok(Verdict::deny(rule.block))
    }
}

#[async_trait]
impl AdmissionBackend for DecisionEngine {
    async fn check(&self, identifier: &Identifier, rule: &Rule, now: DateTime<Utc>) -> Result<Verdict> {
        DecisionEngine::check(self, identifier, rule, now).await
    }
}
