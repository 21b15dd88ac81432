//! Request identification and rule resolution.
//!
//! Maps an inbound request to the identifier it is counted under and the
//! rule it is judged by. Tokens take precedence over addresses in automatic
//! mode, and explicit per-token overrides take precedence over defaults.

use axum::http::{HeaderMap, HeaderName};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use super::identity::Identifier;
use super::rules::{Mode, Rule};
use crate::config::RateLimitingConfig;
use crate::error::{Result, TurnstileError};

/// Header carrying the proxy chain, client first.
const FORWARDED_FOR: &str = "x-forwarded-for";
/// Address used when neither a forwarded header nor a peer address is known.
const UNKNOWN_ADDRESS: &str = "unknown";

/// The identifier and rule resolved for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub identifier: Identifier,
    pub rule: Rule,
}

/// Resolves identifiers and rules from an immutable configuration snapshot.
#[derive(Debug, Clone)]
pub struct RuleResolver {
    mode: Mode,
    token_header: HeaderName,
    default_rule: Rule,
    overrides: HashMap<String, Rule>,
}

impl RuleResolver {
    /// Build a resolver from the rate limiting configuration.
    ///
    /// Fails if the configured token header is not a valid header name.
    pub fn new(config: &RateLimitingConfig) -> Result<Self> {
        let token_header = HeaderName::from_bytes(config.token_header.trim().as_bytes())
            .map_err(|e| {
                TurnstileError::Config(format!(
                    "invalid token header '{}': {}",
                    config.token_header, e
                ))
            })?;

        let overrides = config
            .token_overrides
            .iter()
            .map(|(token, o)| (token.clone(), Rule::from(*o)))
            .collect();

        Ok(Self {
            mode: config.mode,
            token_header,
            default_rule: Rule::new(
                config.limit_per_second,
                Duration::from_secs(config.block_seconds),
            ),
            overrides,
        })
    }

    /// The configured identification mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Resolve a request from its headers and peer address.
    pub fn resolve_request(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Resolution {
        let credential = self.credential(headers);
        let address = client_address(headers, peer);
        self.resolve(&credential, &address)
    }

    /// Resolve from an already extracted credential and client address.
    pub fn resolve(&self, credential: &str, address: &str) -> Resolution {
        match self.mode {
            Mode::Token => self.by_token(credential),
            Mode::Address => self.by_address(address),
            Mode::Automatic if !credential.is_empty() => self.by_token(credential),
            Mode::Automatic => self.by_address(address),
        }
    }

    fn by_token(&self, credential: &str) -> Resolution {
        let rule = self
            .overrides
            .get(credential)
            .copied()
            .unwrap_or(self.default_rule);

        Resolution {
            identifier: Identifier::from_token(credential),
            rule,
        }
    }

    fn by_address(&self, address: &str) -> Resolution {
        Resolution {
            identifier: Identifier::from_address(address),
            rule: self.default_rule,
        }
    }

    /// Presented credential, trimmed; empty when absent or not visible ASCII.
    fn credential(&self, headers: &HeaderMap) -> String {
        headers
            .get(&self.token_header)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    }
}

/// Client address: the first forwarded-for entry, else the peer IP.
fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match (forwarded, peer) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => UNKNOWN_ADDRESS.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::RuleOverride;
    use axum::http::HeaderValue;

    fn config(mode: Mode) -> RateLimitingConfig {
        let mut config = RateLimitingConfig {
            mode,
            limit_per_second: 10,
            block_seconds: 300,
            ..RateLimitingConfig::default()
        };
        config.token_overrides.insert(
            "vip".to_string(),
            RuleOverride {
                limit_per_second: 100,
                block_seconds: 60,
            },
        );
        config
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    fn peer() -> Option<SocketAddr> {
        Some("192.168.1.7:51234".parse().unwrap())
    }

    fn default_rule() -> Rule {
        Rule::new(10, Duration::from_secs(300))
    }

    #[test]
    fn test_automatic_prefers_token_over_address() {
        let resolver = RuleResolver::new(&config(Mode::Automatic)).unwrap();
        let req = headers(&[("API_KEY", "abc"), ("x-forwarded-for", "10.0.0.1")]);

        let resolution = resolver.resolve_request(&req, peer());
        assert_eq!(resolution.identifier.as_str(), "token:abc");
        assert_eq!(resolution.rule, default_rule());
    }

    #[test]
    fn test_automatic_applies_token_override() {
        let resolver = RuleResolver::new(&config(Mode::Automatic)).unwrap();
        let resolution = resolver.resolve_request(&headers(&[("API_KEY", "vip")]), peer());

        assert_eq!(resolution.identifier.as_str(), "token:vip");
        assert_eq!(resolution.rule, Rule::new(100, Duration::from_secs(60)));
    }

    #[test]
    fn test_automatic_falls_back_to_address() {
        let resolver = RuleResolver::new(&config(Mode::Automatic)).unwrap();

        let resolution = resolver.resolve_request(&HeaderMap::new(), peer());
        assert_eq!(resolution.identifier.as_str(), "ip:192.168.1.7");

        // A blank credential counts as absent
        let resolution = resolver.resolve_request(&headers(&[("API_KEY", "   ")]), peer());
        assert_eq!(resolution.identifier.as_str(), "ip:192.168.1.7");
    }

    #[test]
    fn test_address_mode_ignores_token_and_overrides() {
        let resolver = RuleResolver::new(&config(Mode::Address)).unwrap();
        let resolution = resolver.resolve_request(&headers(&[("API_KEY", "vip")]), peer());

        assert_eq!(resolution.identifier.as_str(), "ip:192.168.1.7");
        assert_eq!(resolution.rule, default_rule());
    }

    #[test]
    fn test_token_mode_buckets_missing_credential() {
        let resolver = RuleResolver::new(&config(Mode::Token)).unwrap();
        let resolution = resolver.resolve_request(&HeaderMap::new(), peer());

        assert_eq!(resolution.identifier.as_str(), "token:");
        assert_eq!(resolution.rule, default_rule());
    }

    #[test]
    fn test_token_mode_applies_override() {
        let resolver = RuleResolver::new(&config(Mode::Token)).unwrap();
        let resolution = resolver.resolve("vip", "10.0.0.1");
        assert_eq!(resolution.rule.limit, 100);
    }

    #[test]
    fn test_forwarded_for_first_entry_wins() {
        let req = headers(&[("x-forwarded-for", " 203.0.113.9 , 10.0.0.1")]);
        assert_eq!(client_address(&req, peer()), "203.0.113.9");
    }

    #[test]
    fn test_empty_forwarded_for_uses_peer() {
        let req = headers(&[("x-forwarded-for", " ,10.0.0.1")]);
        assert_eq!(client_address(&req, peer()), "192.168.1.7");
        assert_eq!(client_address(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn test_token_header_is_case_insensitive() {
        let mut config = config(Mode::Token);
        config.token_header = "X-Api-Key".to_string();
        let resolver = RuleResolver::new(&config).unwrap();

        let resolution = resolver.resolve_request(&headers(&[("x-api-key", "abc")]), None);
        assert_eq!(resolution.identifier.as_str(), "token:abc");
    }

    #[test]
    fn test_invalid_token_header_is_config_error() {
        let mut config = config(Mode::Token);
        config.token_header = "bad header".to_string();
        assert!(matches!(
            RuleResolver::new(&config),
            Err(TurnstileError::Config(_))
        ));
    }

    #[test]
    fn test_credential_with_spaces_is_sanitized() {
        let resolver = RuleResolver::new(&config(Mode::Token)).unwrap();
        let resolution = resolver.resolve_request(&headers(&[("API_KEY", "two words")]), None);
        assert_eq!(resolution.identifier.as_str(), "token:two_words");
    }

    #[test]
    fn test_overrides_match_credential_case() {
        let mut config = config(Mode::Token);
        config.token_overrides.insert(
            "AbC-Key".to_string(),
            RuleOverride {
                limit_per_second: 50,
                block_seconds: 2,
            },
        );
        let resolver = RuleResolver::new(&config).unwrap();
        assert_eq!(resolver.mode(), Mode::Token);

        let resolution = resolver.resolve("AbC-Key", "10.0.0.1");
        assert_eq!(resolution.rule, Rule::new(50, Duration::from_secs(2)));

        let resolution = resolver.resolve("abc-key", "10.0.0.1");
        assert_eq!(resolution.rule, default_rule());
    }
}
