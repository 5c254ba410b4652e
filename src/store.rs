//! Visitor identity storage.
//!
//! Thin transactional CRUD over the `visitors` table in SQLite, pooled for
//! concurrent access. Uses WAL mode so readers never block the writer.
//!
//! # Architecture
//!
//! ```text
//! IdentityReconciler ──→ WriteHandle ──→ BEGIN IMMEDIATE ... COMMIT
//!         │                                  (exclusive write txn)
//! VisitorSession ─────→ IdentityStore ──→ r2d2 pool
//! RetirementSweep ────→      │
//!                            ├──→ SQLite connection 1
//!                            └──→ SQLite connection N (max 8)
//! ```
//!
//! The `name` column is deliberately NOT unique-indexed: the reconciler's
//! whole design assumes storage that lets two concurrent inserts of the
//! same name both succeed, and adjudicates the duplicates afterwards. See
//! `reconcile.rs`.

use crate::error::Result;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;

/// Login-style name of the single shared synthetic bot identity.
pub(crate) const BOT_IDENTITY_NAME: &str = "_bot";

/// Retention and cookie behavior bucket for an identity row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Anonymous,
    Bot,
    Authenticated,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anonymous => "anonymous",
            Role::Bot => "bot",
            Role::Authenticated => "authenticated",
        }
    }

    fn parse(s: &str) -> Role {
        match s {
            "bot" => Role::Bot,
            "authenticated" => Role::Authenticated,
            _ => Role::Anonymous,
        }
    }
}

/// One visitor identity row. Timestamps are milliseconds since epoch;
/// millisecond precision matters because the recency window W is
/// sub-second.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
    pub last_active_at: Option<i64>,
    pub retire_after: Option<i64>,
    pub role: Role,
    pub initialized: bool,
}

/// Minimal row view used during race adjudication.
#[derive(Debug, Clone, Copy)]
pub struct CandidateRow {
    pub id: i64,
    pub created_at: i64,
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS visitors (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        name           TEXT NOT NULL,
        created_at     INTEGER NOT NULL,
        last_active_at INTEGER,
        retire_after   INTEGER,
        role           TEXT NOT NULL DEFAULT 'anonymous',
        initialized    INTEGER NOT NULL DEFAULT 0
    );
    -- non-unique on purpose: duplicate names are adjudicated in application code
    CREATE INDEX IF NOT EXISTS idx_visitors_name ON visitors(name);
    CREATE INDEX IF NOT EXISTS idx_visitors_retire ON visitors(retire_after)
        WHERE retire_after IS NOT NULL;

    CREATE TABLE IF NOT EXISTS visitor_meta (
        owner_id INTEGER NOT NULL,
        key      TEXT NOT NULL,
        value    TEXT NOT NULL,
        PRIMARY KEY (owner_id, key)
    );
"#;

/// Pooled handle to the visitor database. Cheap to clone; clones share the
/// underlying pool.
#[derive(Clone)]
pub struct IdentityStore {
    pool: Pool<SqliteConnectionManager>,
}

impl IdentityStore {
    /// Open (creating if needed) the visitor database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|c| {
            c.execute_batch(
                r#"
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA busy_timeout=5000;
                "#,
            )
        });
        let pool = Pool::builder().max_size(8).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub(crate) fn meta_conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.conn()
    }

    /// Check out a connection for a write transaction.
    pub fn writer(&self) -> Result<WriteHandle> {
        Ok(WriteHandle { conn: self.conn()? })
    }

    /// Fetch one identity by id.
    pub fn get(&self, id: i64) -> Result<Option<Identity>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, created_at, last_active_at, retire_after, role, initialized
                 FROM visitors WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Identity {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                        last_active_at: row.get(3)?,
                        retire_after: row.get(4)?,
                        role: Role::parse(&row.get::<_, String>(5)?),
                        initialized: row.get::<_, i64>(6)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn exists(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM visitors WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    /// All rows carrying exactly this identity name, for race adjudication.
    pub fn rows_matching(&self, name: &str) -> Result<Vec<CandidateRow>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, created_at FROM visitors WHERE name = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![name], |row| {
            Ok(CandidateRow {
                id: row.get(0)?,
                created_at: row.get(1)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Post-adjudication re-check of how many rows share a name.
    pub fn final_count_matching(&self, name: &str) -> Result<u32> {
        let conn = self.conn()?;
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM visitors WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Hard-delete a row. Deleting a row another adjudicator already removed
    /// is a no-op, not an error; returns whether anything was deleted.
    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM visitors WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// One-shot default initialization of a freshly adjudicated winner:
    /// anonymous role, first activity stamp, short initial retirement grace.
    /// Guarded by the `initialized` marker so concurrent initializers cannot
    /// clobber each other; returns true only for the caller that won the
    /// guard.
    pub fn initialize_defaults(&self, id: i64, now_ms: i64, retire_after_ms: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE visitors
             SET role = 'anonymous', last_active_at = ?2, retire_after = ?3, initialized = 1
             WHERE id = ?1 AND initialized = 0",
            params![id, now_ms, retire_after_ms],
        )?;
        Ok(changed > 0)
    }

    pub fn record_activity(&self, id: i64, now_ms: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE visitors SET last_active_at = ?2 WHERE id = ?1",
            params![id, now_ms],
        )?;
        Ok(())
    }

    pub fn schedule_retirement(&self, id: i64, at_ms: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE visitors SET retire_after = ?2 WHERE id = ?1",
            params![id, at_ms],
        )?;
        Ok(())
    }

    /// Remove any pending retirement, e.g. once an identity authenticates.
    pub fn clear_retirement(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE visitors SET retire_after = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn set_role(&self, id: i64, role: Role) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE visitors SET role = ?2 WHERE id = ?1",
            params![id, role.as_str()],
        )?;
        Ok(())
    }

    /// Find the shared synthetic bot identity, if one was ever created.
    pub fn find_bot_identity(&self) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let id = conn
            .query_row(
                "SELECT id FROM visitors WHERE name = ?1 AND role = 'bot' ORDER BY id LIMIT 1",
                params![BOT_IDENTITY_NAME],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Create the shared synthetic bot identity. Bot rows never retire.
    pub fn insert_bot_identity(&self, now_ms: i64) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO visitors (name, created_at, last_active_at, role, initialized)
             VALUES (?1, ?2, ?2, 'bot', 1)",
            params![BOT_IDENTITY_NAME, now_ms],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Anonymous identities whose retirement deadline has passed, oldest
    /// deadline first.
    pub fn expired_identities(&self, now_ms: i64, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM visitors
             WHERE role = 'anonymous' AND retire_after IS NOT NULL AND retire_after <= ?1
             ORDER BY retire_after LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now_ms, limit as i64], |row| row.get(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Delete an identity only if it is still anonymous and its retirement
    /// deadline has elapsed. The guard is in the SQL so a concurrent
    /// authentication or activity refresh between listing and deleting
    /// cannot lose data.
    pub fn delete_if_stale(&self, id: i64, now_ms: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM visitors
             WHERE id = ?1 AND role = 'anonymous'
               AND retire_after IS NOT NULL AND retire_after <= ?2",
            params![id, now_ms],
        )?;
        Ok(changed > 0)
    }
}

/// A checked-out connection on which write transactions can be opened.
pub struct WriteHandle {
    conn: PooledConnection<SqliteConnectionManager>,
}

impl WriteHandle {
    /// Open an exclusive write transaction. Dropping the returned
    /// transaction without committing rolls it back, so every exit path of
    /// every caller releases the transactional context.
    pub fn begin(&mut self) -> Result<IdentityTx<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(IdentityTx { tx })
    }
}

/// Scoped transactional view used by the reconciliation loop.
pub struct IdentityTx<'a> {
    tx: Transaction<'a>,
}

impl IdentityTx<'_> {
    /// Count rows whose name equals the probe name.
    pub fn count_matching(&self, name: &str) -> Result<u32> {
        let count: u32 = self.tx.query_row(
            "SELECT COUNT(*) FROM visitors WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn rows_matching(&self, name: &str) -> Result<Vec<CandidateRow>> {
        let mut stmt = self
            .tx
            .prepare("SELECT id, created_at FROM visitors WHERE name = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![name], |row| {
            Ok(CandidateRow {
                id: row.get(0)?,
                created_at: row.get(1)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Insert a candidate row. Storage enforces no uniqueness on the name,
    /// so a concurrent duplicate insert can also succeed; callers must
    /// adjudicate after commit.
    pub fn insert_candidate(&self, name: &str, now_ms: i64) -> Result<i64> {
        self.tx.execute(
            "INSERT INTO visitors (name, created_at) VALUES (?1, ?2)",
            params![name, now_ms],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    pub fn rollback(self) -> Result<()> {
        self.tx.rollback()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, IdentityStore) {
        let dir = TempDir::new().unwrap();
        let store = IdentityStore::open(dir.path().join("visitors.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_duplicate_names_both_insert() -> anyhow::Result<()> {
        let (_dir, store) = open_store();

        let mut w = store.writer()?;
        let tx = w.begin()?;
        let a = tx.insert_candidate("_v_abc", 1_000)?;
        tx.commit()?;

        let tx = w.begin()?;
        let b = tx.insert_candidate("_v_abc", 1_001)?;
        tx.commit()?;

        assert_ne!(a, b);
        assert_eq!(store.final_count_matching("_v_abc")?, 2);
        Ok(())
    }

    #[test]
    fn test_rollback_discards_insert() {
        let (_dir, store) = open_store();

        let mut w = store.writer().unwrap();
        let tx = w.begin().unwrap();
        tx.insert_candidate("_v_abc", 1_000).unwrap();
        // visible inside the transaction...
        assert_eq!(tx.count_matching("_v_abc").unwrap(), 1);
        tx.rollback().unwrap();

        // ...gone after rollback
        assert_eq!(store.final_count_matching("_v_abc").unwrap(), 0);
    }

    #[test]
    fn test_drop_without_commit_rolls_back() {
        let (_dir, store) = open_store();

        let mut w = store.writer().unwrap();
        {
            let tx = w.begin().unwrap();
            tx.insert_candidate("_v_abc", 1_000).unwrap();
            // dropped here
        }
        assert_eq!(store.final_count_matching("_v_abc").unwrap(), 0);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store) = open_store();

        let mut w = store.writer().unwrap();
        let tx = w.begin().unwrap();
        let id = tx.insert_candidate("_v_abc", 1_000).unwrap();
        tx.commit().unwrap();

        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert!(!store.delete(999_999).unwrap());
    }

    #[test]
    fn test_initialize_defaults_runs_once() {
        let (_dir, store) = open_store();

        let mut w = store.writer().unwrap();
        let tx = w.begin().unwrap();
        let id = tx.insert_candidate("_v_abc", 1_000).unwrap();
        tx.commit().unwrap();

        assert!(store.initialize_defaults(id, 2_000, 9_000).unwrap());
        // second initializer loses the guard
        assert!(!store.initialize_defaults(id, 3_000, 10_000).unwrap());

        let identity = store.get(id).unwrap().unwrap();
        assert!(identity.initialized);
        assert_eq!(identity.last_active_at, Some(2_000));
        assert_eq!(identity.retire_after, Some(9_000));
        assert_eq!(identity.role, Role::Anonymous);
    }

    #[test]
    fn test_delete_if_stale_guards() {
        let (_dir, store) = open_store();

        let mut w = store.writer().unwrap();
        let tx = w.begin().unwrap();
        let id = tx.insert_candidate("_v_abc", 1_000).unwrap();
        tx.commit().unwrap();
        store.initialize_defaults(id, 1_000, 5_000).unwrap();

        // deadline not yet reached
        assert!(!store.delete_if_stale(id, 4_999).unwrap());
        // authenticated rows are never swept
        store.set_role(id, Role::Authenticated).unwrap();
        assert!(!store.delete_if_stale(id, 10_000).unwrap());

        store.set_role(id, Role::Anonymous).unwrap();
        assert!(store.delete_if_stale(id, 10_000).unwrap());
        assert!(store.get(id).unwrap().is_none());
    }

    #[test]
    fn test_expired_identities_ordering_and_limit() {
        let (_dir, store) = open_store();

        let mut ids = Vec::new();
        for i in 0..3 {
            let mut w = store.writer().unwrap();
            let tx = w.begin().unwrap();
            let id = tx.insert_candidate(&format!("_v_{i}"), 1_000).unwrap();
            tx.commit().unwrap();
            store.initialize_defaults(id, 1_000, 3_000 - i).unwrap();
            ids.push(id);
        }

        let expired = store.expired_identities(10_000, 2).unwrap();
        assert_eq!(expired.len(), 2);
        // oldest deadline first
        assert_eq!(expired[0], ids[2]);
    }

    #[test]
    fn test_bot_identity_round_trip() -> anyhow::Result<()> {
        let (_dir, store) = open_store();
        assert!(store.find_bot_identity()?.is_none());

        let id = store.insert_bot_identity(1_000)?;
        assert_eq!(store.find_bot_identity()?, Some(id));

        let identity = store.get(id)?.expect("bot row just inserted");
        assert_eq!(identity.role, Role::Bot);
        assert!(identity.retire_after.is_none());
        Ok(())
    }
}
