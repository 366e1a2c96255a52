//! Identity types for the relay protocol.

use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::TypesError;

/// Length of generated pair ids and personalization strings.
pub const TOKEN_LEN: usize = 32;

/// Generate a random alphanumeric token of [`TOKEN_LEN`] characters.
pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Identifier of one session pair on the wire.
///
/// Random per handshake, so a pool produced by a re-pair never reuses an id
/// from the pool it replaced.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairId(String);

impl PairId {
    /// Create a new random PairId.
    pub fn random() -> Self {
        Self(random_token())
    }

    /// Wrap an id received from the wire or from storage.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the id is empty (never valid for a request).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(8).collect();
        write!(f, "PairId({})", short)
    }
}

/// Server-assigned identifier for one client/host relationship.
///
/// Empty until the first capability probe answers.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Wrap an id received from the server or from storage.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True before the server has assigned an id.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

/// Canonical origin of a relay host, always `scheme://host[:port]/`.
///
/// Two spellings of the same origin (case, default port, trailing path)
/// canonicalize to the same identity, so they share one pairing.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostIdentity(String);

impl HostIdentity {
    /// Canonicalize a host URL. Only `http` and `https` origins are accepted.
    pub fn parse(input: &str) -> Result<Self, TypesError> {
        let invalid = |reason: String| TypesError::InvalidHost {
            url: input.to_string(),
            reason,
        };
        let url = Url::parse(input.trim()).map_err(|e| invalid(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(invalid(format!("unsupported scheme '{}'", other))),
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host".into()));
        }
        Ok(Self(format!("{}/", url.origin().ascii_serialization())))
    }

    /// The canonical URL, with trailing slash.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Absolute URL for a route relative to this host.
    pub fn join(&self, route: &str) -> String {
        format!("{}{}", self.0, route.trim_start_matches('/'))
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostIdentity({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_token_is_alphanumeric() {
        let token = random_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn pair_ids_are_unique() {
        let a = PairId::random();
        let b = PairId::random();
        assert_ne!(a, b);
    }

    #[test]
    fn pair_id_serializes_as_plain_string() {
        let id = PairId::new("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }

    #[test]
    fn client_id_defaults_empty() {
        assert!(ClientId::default().is_empty());
        assert!(!ClientId::new("c1").is_empty());
    }

    #[test]
    fn host_identity_canonicalizes_origin() {
        let a = HostIdentity::parse("HTTPS://Relay.Example.com:443/api/login?x=1").unwrap();
        let b = HostIdentity::parse("https://relay.example.com").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://relay.example.com/");
    }

    #[test]
    fn host_identity_keeps_explicit_port() {
        let host = HostIdentity::parse("http://localhost:8080/").unwrap();
        assert_eq!(host.as_str(), "http://localhost:8080/");
    }

    #[test]
    fn host_identity_rejects_other_schemes() {
        assert!(HostIdentity::parse("ftp://example.com").is_err());
        assert!(HostIdentity::parse("not a url").is_err());
    }

    #[test]
    fn host_identity_join_strips_leading_slash() {
        let host = HostIdentity::parse("https://relay.example.com").unwrap();
        assert_eq!(host.join("/api/mte-pair"), "https://relay.example.com/api/mte-pair");
        assert_eq!(host.join("api/mte-relay"), "https://relay.example.com/api/mte-relay");
    }
}
