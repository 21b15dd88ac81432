//! Admission rules and per-token overrides.
//!
//! A [`Rule`] is resolved fresh for every request from the configured
//! defaults and the override table; it is never stored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// The limit and block duration governing one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    /// Requests admitted per one-second window. Zero disables limiting.
    pub limit: u64,
    /// How long an identifier stays blocked after exceeding the limit.
    pub block: Duration,
}

impl Rule {
    /// Create a rule from a per-second limit and a block duration.
    pub fn new(limit: u64, block: Duration) -> Self {
        Self { limit, block }
    }

    /// Whether this rule admits every request without counting.
    pub fn is_unlimited(&self) -> bool {
        self.limit == 0
    }
}

/// How callers are identified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Always by client address; overrides never apply.
    #[serde(alias = "ip")]
    Address,
    /// Always by presented credential, even when it is empty.
    Token,
    /// By credential when one is presented, otherwise by address.
    #[default]
    #[serde(alias = "auto")]
    Automatic,
}

impl FromStr for Mode {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "address" | "ip" => Ok(Mode::Address),
            "token" => Ok(Mode::Token),
            "automatic" | "auto" => Ok(Mode::Automatic),
            other => Err(TurnstileError::Config(format!("unknown mode '{}'", other))),
        }
    }
}

/// A configured override for one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleOverride {
    /// Requests admitted per second for this credential
    pub limit_per_second: u64,
    /// Block duration in seconds for this credential
    pub block_seconds: u64,
}

impl From<RuleOverride> for Rule {
    fn from(o: RuleOverride) -> Self {
        Rule::new(o.limit_per_second, Duration::from_secs(o.block_seconds))
    }
}

/// Parse overrides in the compact `token:limit:block[,token:limit:block...]` form.
///
/// Blank items are skipped. Any other malformed item is a configuration error.
pub fn parse_token_overrides(raw: &str) -> Result<HashMap<String, RuleOverride>> {
    let mut overrides = HashMap::new();

    for item in raw.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let fields: Vec<&str> = item.split(':').map(str::trim).collect();
        let [token, limit, block] = fields.as_slice() else {
            return Err(TurnstileError::Config(format!(
                "invalid token override item '{}': expected token:limit:block",
                item
            )));
        };

        if token.is_empty() {
            return Err(TurnstileError::Config(format!(
                "invalid token override item '{}': empty token",
                item
            )));
        }

        let limit_per_second = limit.parse().map_err(|e| {
            TurnstileError::Config(format!("invalid limit in token override '{}': {}", item, e))
        })?;
        let block_seconds = block.parse().map_err(|e| {
            TurnstileError::Config(format!(
                "invalid block seconds in token override '{}': {}",
                item, e
            ))
        })?;

        overrides.insert(
            token.to_string(),
            RuleOverride {
                limit_per_second,
                block_seconds,
            },
        );
    }

    Ok(overrides)
}
