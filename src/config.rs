//! Configuration management for Turnstile.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! environment variables prefixed with `TURNSTILE_` using `__` between
//! sections (for example `TURNSTILE_RATE_LIMITING__MODE=token`). The plain
//! names `PORT`, `RATE_LIMIT_*` and `REDIS_*` are applied last. The
//! resulting value is immutable and handed to the components that need it.
//!
//! Token overrides are keyed by case-sensitive credentials, so they are read
//! from the file with `serde_yaml` directly or given in compact form through
//! `RATE_LIMIT_TOKEN_OVERRIDES`; the layered loader lowercases map keys.

use redis::IntoConnectionInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{parse_token_overrides, Mode, RuleOverride};
use crate::store::{RedisStoreConfig, DEFAULT_KEY_PREFIX};

/// Prefix for environment variable overrides.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Name this instance reports in its logs
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            instance_id: default_instance_id(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// How callers are identified
    #[serde(default)]
    pub mode: Mode,

    /// Default requests admitted per second; zero disables limiting
    #[serde(default = "default_limit_per_second")]
    pub limit_per_second: u64,

    /// Default block duration in seconds after exceeding the limit
    #[serde(default = "default_block_seconds")]
    pub block_seconds: u64,

    /// Header carrying the caller's credential
    #[serde(default = "default_token_header")]
    pub token_header: String,

    /// Per-credential rule overrides
    #[serde(default)]
    pub token_overrides: HashMap<String, RuleOverride>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            limit_per_second: default_limit_per_second(),
            block_seconds: default_block_seconds(),
            token_header: default_token_header(),
            token_overrides: HashMap::new(),
        }
    }
}

fn default_limit_per_second() -> u64 {
    10
}

fn default_block_seconds() -> u64 {
    300
}

fn default_token_header() -> String {
    "API_KEY".to_string()
}

/// Which counter store implementation backs the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; limits hold per instance only
    Memory,
    /// Shared Redis server; limits hold cluster-wide
    #[default]
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, including credentials and database index
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix for every key written to the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single store command in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// How often the in-memory store drops expired entries, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Redis password, replacing any given in `url`
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Redis database index, replacing any given in `url`
    #[serde(default)]
    pub db: Option<i64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            password: None,
            db: None,
        }
    }
}

impl StoreConfig {
    /// Redis connection parameters from `url`, `password` and `db`.
    pub fn connection_info(&self) -> Result<redis::ConnectionInfo> {
        let mut info = self
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| TurnstileError::Config(format!("invalid store.url: {}", e)))?;

        if let Some(password) = &self.password {
            info.redis.password = Some(password.clone());
        }
        if let Some(db) = self.db {
            info.redis.db = db;
        }
        Ok(info)
    }

    /// Settings for the Redis store client.
    pub fn redis(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            key_prefix: self.key_prefix.clone(),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_command_timeout_ms() -> u64 {
    500
}

fn default_sweep_interval_secs() -> u64 {
    5
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    fn load_with_env<F>(path: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let mut config: TurnstileConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.rate_limiting.token_overrides = match path {
            Some(path) => read_token_overrides(path)?,
            None => HashMap::new(),
        };
        config.apply_env_aliases(env)?;

        config.validate()?;
        Ok(config)
    }

    /// Apply the plain `PORT`, `RATE_LIMIT_*` and `REDIS_*` variables.
    ///
    /// Unset or blank variables leave the current value alone. Compact
    /// overrides from `RATE_LIMIT_TOKEN_OVERRIDES` are merged over any
    /// loaded from the file.
    pub fn apply_env_aliases<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            env(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(port) = var("PORT") {
            self.server.listen_addr.set_port(parse_var("PORT", &port)?);
        }
        if let Some(mode) = var("RATE_LIMIT_MODE") {
            self.rate_limiting.mode = mode.parse()?;
        }
        if let Some(rps) = var("RATE_LIMIT_RPS") {
            self.rate_limiting.limit_per_second = parse_var("RATE_LIMIT_RPS", &rps)?;
        }
        if let Some(block) = var("RATE_LIMIT_BLOCK_SECONDS") {
            self.rate_limiting.block_seconds = parse_var("RATE_LIMIT_BLOCK_SECONDS", &block)?;
        }
        if let Some(header) = var("RATE_LIMIT_TOKEN_HEADER") {
            self.rate_limiting.token_header = header;
        }
        if let Some(raw) = var("RATE_LIMIT_TOKEN_OVERRIDES") {
            self.rate_limiting
                .token_overrides
                .extend(parse_token_overrides(&raw)?);
        }
        if let Some(addr) = var("REDIS_ADDR") {
            self.store.url = if addr.contains("://") {
                addr
            } else {
                format!("redis://{}", addr)
            };
        }
        if let Some(db) = var("REDIS_DB") {
            self.store.db = Some(parse_var("REDIS_DB", &db)?);
        }
        if let Some(password) = var("REDIS_PASSWORD") {
            self.store.password = Some(password);
        }

        Ok(())
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component could run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.token_header.trim().is_empty() {
            return Err(TurnstileError::Config("token_header must not be empty".to_string()));
        }

        if self.rate_limiting.token_overrides.keys().any(|t| t.trim().is_empty()) {
            return Err(TurnstileError::Config(
                "token_overrides must not contain an empty token".to_string(),
            ));
        }

        if self.store.key_prefix.is_empty() {
            return Err(TurnstileError::Config("store.key_prefix must not be empty".to_string()));
        }

        if self.store.command_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "store.command_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| TurnstileError::Config(format!("invalid {} '{}': {}", key, value, e)))
}

/// Read `rate_limiting.token_overrides` from a YAML file with keys verbatim.
fn read_token_overrides(path: &Path) -> Result<HashMap<String, RuleOverride>> {
    #[derive(Deserialize)]
    struct OverridesFile {
        rate_limiting: Option<OverridesSection>,
    }

    #[derive(Deserialize)]
    struct OverridesSection {
        token_overrides: Option<HashMap<String, RuleOverride>>,
    }

    let raw = std::fs::read_to_string(path).map_err(|e| {
        TurnstileError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let file: OverridesFile = serde_yaml::from_str(&raw)
        .map_err(|e| TurnstileError::Config(format!("Failed to parse config: {}", e)))?;

    Ok(file
        .rate_limiting
        .and_then(|section| section.token_overrides)
        .unwrap_or_default())
}
