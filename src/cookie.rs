//! Tamper-evident identity cookies.
//!
//! The token is `id|expiry|hmac` where the MAC is HMAC-SHA256 over the
//! first two fields keyed with the server secret. The codec is stateless
//! and pure: it never touches storage, and the "does this identity still
//! exist" check belongs to the session facade.
//!
//! Validation is all-or-nothing on purpose. A malformed token, a bad MAC
//! and an expired token all collapse to the same `None`, so nothing the
//! caller can observe helps an attacker distinguish which check failed.
//! The MAC comparison itself is constant-time (`verify_slice`).

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Builds and validates identity cookie tokens.
pub struct CookieCodec {
    secret: Vec<u8>,
    ttl: Duration,
}

impl CookieCodec {
    /// Create a codec with the installation's server secret and the TTL
    /// applied to issued tokens.
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl,
        }
    }

    /// Issue a token for `id`, expiring `ttl` from now.
    pub fn issue(&self, id: i64) -> String {
        let expiry = Utc::now().timestamp() + self.ttl.as_secs() as i64;
        self.issue_with_expiry(id, expiry)
    }

    /// Issue a token with an explicit expiry (seconds since epoch).
    pub fn issue_with_expiry(&self, id: i64, expiry: i64) -> String {
        let payload = format!("{}|{}", id, expiry);
        format!("{}|{}", payload, hex::encode(self.mac(&payload)))
    }

    /// Validate a token and return the identity id it binds.
    ///
    /// Returns `None` for any failure: wrong field count, non-numeric
    /// fields, expiry in the past, undecodable or mismatched MAC.
    pub fn validate(&self, token: &str) -> Option<i64> {
        let mut parts = token.split('|');
        let id_field = parts.next()?;
        let expiry_field = parts.next()?;
        let mac_field = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        let id: i64 = id_field.parse().ok()?;
        let expiry: i64 = expiry_field.parse().ok()?;
        if id <= 0 || expiry < Utc::now().timestamp() {
            return None;
        }

        let expected = hex::decode(mac_field).ok()?;
        let payload = format!("{}|{}", id, expiry);
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret).ok()?;
        mac.update(payload.as_bytes());
        // constant-time comparison
        mac.verify_slice(&expected).ok()?;

        Some(id)
    }

    fn mac(&self, payload: &str) -> Vec<u8> {
        // new_from_slice only fails for unusable key lengths, which HMAC
        // does not have
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(payload.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}
