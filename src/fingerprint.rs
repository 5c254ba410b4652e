//! Deterministic visit fingerprints.
//!
//! Before any cookie exists, the only way to correlate parallel requests
//! from the same browser is what the connection itself tells us: the remote
//! address and the user-agent string. Both are hashed into a short opaque
//! key that becomes the identity row's name prefix. The raw address and
//! agent are never stored.

use sha2::{Digest, Sha256};

/// Prefix shared by every fingerprint-derived identity name, so reconciler
/// rows are recognizable in the table next to bot and authenticated rows.
const NAME_PREFIX: &str = "_v_";

/// Placeholder when the client sent no user-agent header at all.
const UNKNOWN_AGENT: &str = "(unknown agent)";

/// A deterministic hash of (remote address, user agent).
///
/// Equal inputs always produce the same key, which is exactly what lets two
/// parallel first-contact requests find each other's rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    key: String,
}

impl Fingerprint {
    /// Derive the fingerprint for a request.
    pub fn from_request(remote_addr: &str, user_agent: &str) -> Self {
        let agent = if user_agent.is_empty() {
            UNKNOWN_AGENT
        } else {
            user_agent
        };

        let mut hasher = Sha256::new();
        hasher.update(remote_addr.as_bytes());
        hasher.update(agent.as_bytes());
        let hash = hasher.finalize();

        Self {
            key: format!("{}{}", NAME_PREFIX, &format!("{:x}", hash)[..16]),
        }
    }

    /// The bare fingerprint key (suffix 0).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Identity name for a given collision-splitting suffix. Suffix 0 is
    /// the bare key; higher suffixes are appended as `_NN`, the shape the
    /// reconciler bumps through when a prefix is contended by stale rows.
    pub fn name_with_suffix(&self, suffix: u32) -> String {
        if suffix == 0 {
            self.key.clone()
        } else {
            format!("{}_{:02}", self.key, suffix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_inputs_same_key() {
        let a = Fingerprint::from_request("203.0.113.7", "Mozilla/5.0");
        let b = Fingerprint::from_request("203.0.113.7", "Mozilla/5.0");
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_inputs_different_keys() {
        let a = Fingerprint::from_request("203.0.113.7", "Mozilla/5.0");
        let b = Fingerprint::from_request("203.0.113.8", "Mozilla/5.0");
        let c = Fingerprint::from_request("203.0.113.7", "curl/8.0");
        assert_ne!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_empty_agent_uses_placeholder() {
        let empty = Fingerprint::from_request("203.0.113.7", "");
        let named = Fingerprint::from_request("203.0.113.7", UNKNOWN_AGENT);
        assert_eq!(empty, named);
    }

    #[test]
    fn test_suffix_naming() {
        let fp = Fingerprint::from_request("203.0.113.7", "Mozilla/5.0");
        assert_eq!(fp.name_with_suffix(0), fp.key());
        assert_eq!(fp.name_with_suffix(1), format!("{}_01", fp.key()));
        assert_eq!(fp.name_with_suffix(12), format!("{}_12", fp.key()));
    }
}
