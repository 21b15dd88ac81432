//! Admission backend trait for abstracting the decision engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::engine::Verdict;
use super::identity::Identifier;
use super::rules::Rule;
use crate::error::Result;

/// Trait for admission checkers.
///
/// This trait abstracts over the `DecisionEngine` so the HTTP middleware can
/// be exercised against any checker, including test fakes.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Decide whether `identifier` may proceed under `rule` at `now`.
    async fn check(&self, identifier: &Identifier, rule: &Rule, now: DateTime<Utc>) -> Result<Verdict>;
}
