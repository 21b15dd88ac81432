//! Fixed one-second counting windows and the store key layout.
//!
//! Windows are aligned to wall-clock epoch seconds, not sliding. A burst
//! that straddles a boundary is counted in two windows and can therefore
//! admit up to twice the limit across that boundary.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::identity::Identifier;

/// Length of one counting window.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Key identifying one window counter in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// The caller being counted.
    pub identifier: Identifier,
    /// Epoch second the window starts at.
    pub epoch_second: i64,
}

impl WindowKey {
    /// Key for the window containing `now`.
    pub fn at(identifier: &Identifier, now: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.clone(),
            epoch_second: now.timestamp(),
        }
    }

    /// Format: "{prefix}:cnt:{identifier}:{epoch_second}"
    pub fn to_store_key(&self, prefix: &str) -> String {
        format!("{}:cnt:{}:{}", prefix, self.identifier, self.epoch_second)
    }
}

/// Format: "{prefix}:block:{identifier}"
pub fn block_store_key(prefix: &str, identifier: &Identifier) -> String {
    format!("{}:block:{}", prefix, identifier)
}
