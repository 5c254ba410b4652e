//! Per-identity key/value metadata.
//!
//! Carts, shipping selections, checkout errors: anything host code wants
//! to remember about a visitor hangs off the identity as a JSON value.
//! This keeps the identity row itself narrow and write-cheap.

use crate::error::Result;
use crate::store::IdentityStore;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

/// Key under which the shopping cart payload is stored. The cart itself is
/// opaque to this crate; only emptiness is ever inspected (for the
/// login-time merge).
pub const CART_KEY: &str = "cart";

/// Key/value metadata attached to visitor identities.
#[derive(Clone)]
pub struct MetaStore {
    store: IdentityStore,
}

impl MetaStore {
    pub fn new(store: IdentityStore) -> Self {
        Self { store }
    }

    pub fn get_meta(&self, owner_id: i64, key: &str) -> Result<Option<Value>> {
        let conn = self.store.meta_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM visitor_meta WHERE owner_id = ?1 AND key = ?2",
                params![owner_id, key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            // a value that no longer parses is treated as absent rather than
            // failing the request
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub fn set_meta(&self, owner_id: i64, key: &str, value: &Value) -> Result<()> {
        let conn = self.store.meta_conn()?;
        conn.execute(
            "INSERT INTO visitor_meta (owner_id, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (owner_id, key) DO UPDATE SET value = excluded.value",
            params![owner_id, key, value.to_string()],
        )?;
        Ok(())
    }

    /// Returns whether a value existed.
    pub fn delete_meta(&self, owner_id: i64, key: &str) -> Result<bool> {
        let conn = self.store.meta_conn()?;
        let changed = conn.execute(
            "DELETE FROM visitor_meta WHERE owner_id = ?1 AND key = ?2",
            params![owner_id, key],
        )?;
        Ok(changed > 0)
    }

    /// Drop everything attached to an identity; used when the identity row
    /// itself is deleted. Returns the number of keys removed.
    pub fn delete_all_meta(&self, owner_id: i64) -> Result<usize> {
        let conn = self.store.meta_conn()?;
        let changed = conn.execute(
            "DELETE FROM visitor_meta WHERE owner_id = ?1",
            params![owner_id],
        )?;
        Ok(changed)
    }

    /// Whether any metadata at all is attached to an identity.
    pub fn has_meta(&self, owner_id: i64) -> Result<bool> {
        let conn = self.store.meta_conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM visitor_meta WHERE owner_id = ?1 LIMIT 1",
                params![owner_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

/// Emptiness test for merge decisions: null, `[]`, `{}` and `""` all count
/// as "nothing worth keeping".
pub(crate) fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
