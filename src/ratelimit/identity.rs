//! Caller identifiers.

use std::fmt;

/// Namespace tag for identifiers derived from a presented credential.
pub const TOKEN_NAMESPACE: &str = "token";
/// Namespace tag for identifiers derived from a network address.
pub const ADDRESS_NAMESPACE: &str = "ip";

/// A key that uniquely names one rate-limited caller.
///
/// The raw value is prefixed with the namespace of its source before
/// sanitization, so a token and an address that happen to be textually
/// identical never share counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Identifier for a presented credential. An empty credential is its own bucket.
    pub fn from_token(token: &str) -> Self {
        Self::namespaced(TOKEN_NAMESPACE, token)
    }

    /// Identifier for a client network address.
    pub fn from_address(address: &str) -> Self {
        Self::namespaced(ADDRESS_NAMESPACE, address)
    }

    fn namespaced(namespace: &str, raw: &str) -> Self {
        Self(sanitize(&format!("{}:{}", namespace, raw)))
    }

    /// The sanitized identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Replace characters that would corrupt a composite storage key.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_whitespace() || c.is_control() { '_' } else { c })
        .collect()
}
