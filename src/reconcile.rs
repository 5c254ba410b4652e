//! Concurrent identity reconciliation.
//!
//! The hard case this module exists for: a cached page is served to a
//! browser with no identity cookie yet, and the browser fires several
//! parallel sub-requests (AJAX, images, form posts). Each request would
//! happily mint its own visitor row and set its own cookie; whichever
//! cookie the browser keeps last wins, and anything written under the other
//! ids (an add-to-cart, say) silently vanishes. `resolve` makes those
//! parallel requests converge on exactly one row.
//!
//! # The loop
//!
//! ```text
//! probe name = fingerprint key (+ optional _NN suffix)
//! loop (hard cap):
//!   BEGIN IMMEDIATE
//!     0 rows            → insert candidate
//!     1 row, recent (W) → adopt it, no insert
//!     otherwise         → ROLLBACK, bump suffix, retry
//!   COMMIT
//!   adjudicate outside the txn:
//!     re-read all rows with this name
//!     winner = smallest id; delete the rest (no-op if already gone)
//!     if our insert lost, adopt the winner
//!   one-shot default initialization, guarded by the initialized marker
//!   return winner
//! ```
//!
//! Adjudication must happen after commit: storage enforces no uniqueness on
//! the name, and a sibling's duplicate insert only becomes visible once
//! both transactions have committed. Smallest id wins: a deterministic
//! total order both racers compute identically without coordination.
//!
//! Correctness rests entirely on the storage layer's transaction isolation.
//! An in-process mutex would be useless here: the siblings may be other OS
//! processes sharing the same database.

use crate::bot::BotClassifier;
use crate::config::IdentityConfig;
use crate::error::{IdentityError, Result};
use crate::fingerprint::Fingerprint;
use crate::store::IdentityStore;
use chrono::Utc;
use std::sync::Mutex;

/// Contention above this many suffix bumps in one call is worth an
/// operator's attention even though the loop will still terminate.
const CONTENTION_WARN_EVERY: u32 = 50;

/// Resolves a fingerprint to exactly one identity id under concurrency.
pub struct IdentityReconciler {
    store: IdentityStore,
    config: IdentityConfig,
    /// Synthetic bot identity, created lazily and cached for the process
    /// lifetime so crawler traffic costs at most one write ever.
    bot_identity: Mutex<Option<i64>>,
}

impl IdentityReconciler {
    pub fn new(store: IdentityStore, config: IdentityConfig) -> Self {
        Self {
            store,
            config,
            bot_identity: Mutex::new(None),
        }
    }

    /// Route a request to an identity id: automated traffic shares the
    /// synthetic bot identity, everything else goes through `resolve`.
    pub fn resolve_request(
        &self,
        classifier: &dyn BotClassifier,
        remote_addr: &str,
        user_agent: &str,
        path: &str,
    ) -> Result<i64> {
        if classifier.is_automated(remote_addr, user_agent, path) {
            return self.bot_identity();
        }
        self.resolve(&Fingerprint::from_request(remote_addr, user_agent))
    }

    /// The shared synthetic identity for automated traffic. Never goes
    /// through the reconciliation loop.
    pub fn bot_identity(&self) -> Result<i64> {
        let mut cached = self.bot_identity.lock().unwrap();
        if let Some(id) = *cached {
            return Ok(id);
        }

        let id = match self.store.find_bot_identity()? {
            Some(id) => id,
            None => {
                let id = self.store.insert_bot_identity(Utc::now().timestamp_millis())?;
                tracing::debug!(id, "created synthetic bot identity");
                id
            }
        };
        *cached = Some(id);
        Ok(id)
    }

    /// Resolve a fingerprint to exactly one identity id, creating one if
    /// needed. Must be called at most once per inbound request.
    ///
    /// # Errors
    /// `TransientStorage` if the backend fails mid-loop (the caller should
    /// treat this visitor as anonymous-without-identity for this request);
    /// `RetryBudgetExhausted` if the iteration cap is hit, which is logged
    /// as a critical anomaly.
    pub fn resolve(&self, fingerprint: &Fingerprint) -> Result<i64> {
        let window_ms = self.config.recency_window_ms();
        let mut suffix = 0u32;

        for _iteration in 0..self.config.retry_cap {
            let now = Utc::now().timestamp_millis();
            let name = fingerprint.name_with_suffix(suffix);

            let mut writer = self.store.writer()?;
            let tx = writer.begin()?;

            let rows = tx.rows_matching(&name)?;
            let our_insert = match rows.as_slice() {
                [] => Some(tx.insert_candidate(&name, now)?),
                [row] if (now - row.created_at).abs() <= window_ms => {
                    // a sibling request from this same visit committed first;
                    // adopt its row instead of inserting
                    None
                }
                _ => {
                    // either one stale row (a different, older visit attempt
                    // that must be left alone) or several committed rows.
                    // Try a fresh suffix.
                    tx.rollback()?;
                    suffix += 1;
                    if suffix % CONTENTION_WARN_EVERY == 0 {
                        tracing::warn!(
                            prefix = fingerprint.key(),
                            suffix,
                            "heavy contention while reconciling visitor identity"
                        );
                    }
                    continue;
                }
            };
            tx.commit()?;
            // return the write connection before adjudication checks out
            // readers, so callers never hold two pool slots at once
            drop(writer);

            // Adjudication. Even when our own insert succeeded, a concurrent
            // duplicate our transaction could not see may have committed too.
            let survivors = self.store.rows_matching(&name)?;
            let winner = match survivors.iter().map(|r| r.id).min() {
                Some(id) => id,
                None => {
                    // every row vanished between commit and re-read; retry
                    // the same name
                    continue;
                }
            };
            for row in &survivors {
                if row.id != winner {
                    // delete of an already-deleted loser is a no-op
                    self.store.delete(row.id)?;
                }
            }

            if let Some(own) = our_insert {
                if own != winner {
                    // the race actually happened and we lost: our row is
                    // gone (we or a sibling just deleted it), so adopt the
                    // winner rather than re-creating anything
                    tracing::debug!(
                        lost = own,
                        adopted = winner,
                        "lost identity creation race, adopting winner"
                    );
                }
            }

            if self.store.final_count_matching(&name)? != 1 {
                // another racer is still mid-adjudication; go around again
                // and re-read
                continue;
            }

            let retire_after = now + self.config.initial_retire_grace_ms();
            if self.store.initialize_defaults(winner, now, retire_after)? {
                tracing::debug!(id = winner, name = %name, "initialized visitor identity");
            }

            return Ok(winner);
        }

        tracing::error!(
            prefix = fingerprint.key(),
            cap = self.config.retry_cap,
            "identity reconciliation retry budget exhausted"
        );
        Err(IdentityError::RetryBudgetExhausted {
            prefix: fingerprint.key().to_string(),
            iterations: self.config.retry_cap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::FixedBotClassifier;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn setup() -> (TempDir, IdentityStore, IdentityConfig) {
        let dir = TempDir::new().unwrap();
        let store = IdentityStore::open(dir.path().join("visitors.db")).unwrap();
        (dir, store, IdentityConfig::default())
    }

    // RUST_LOG=vestibule=debug shows the contention telemetry while the
    // concurrency tests run.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn test_single_caller_creates_one_row() {
        let (_dir, store, config) = setup();
        let reconciler = IdentityReconciler::new(store.clone(), config);
        let fp = Fingerprint::from_request("203.0.113.7", "Mozilla/5.0");

        let id = reconciler.resolve(&fp).unwrap();
        assert_eq!(store.final_count_matching(fp.key()).unwrap(), 1);

        let identity = store.get(id).unwrap().unwrap();
        assert!(identity.initialized);
        assert!(identity.retire_after.is_some());
    }

    #[test]
    fn test_repeat_call_within_window_reuses_row() {
        let (_dir, store, config) = setup();
        let reconciler = IdentityReconciler::new(store.clone(), config);
        let fp = Fingerprint::from_request("203.0.113.7", "Mozilla/5.0");

        let a = reconciler.resolve(&fp).unwrap();
        let b = reconciler.resolve(&fp).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.final_count_matching(fp.key()).unwrap(), 1);
    }

    // Convergence: N parallel callers with the same fingerprint all get the
    // same id and exactly one row survives.
    #[test]
    fn test_parallel_callers_converge() {
        init_tracing();
        let (_dir, store, mut config) = setup();
        // wide window so a slow test machine cannot make sibling threads
        // look like stale visits
        config.recency_window = std::time::Duration::from_secs(10);
        let reconciler = Arc::new(IdentityReconciler::new(store.clone(), config));
        let fp = Fingerprint::from_request("203.0.113.7", "Mozilla/5.0");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let reconciler = reconciler.clone();
            let fp = fp.clone();
            handles.push(thread::spawn(move || reconciler.resolve(&fp).unwrap()));
        }
        let ids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let first = ids[0];
        assert!(ids.iter().all(|&id| id == first), "diverged: {ids:?}");
        assert_eq!(store.final_count_matching(fp.key()).unwrap(), 1);
        assert_eq!(store.rows_matching(fp.key()).unwrap()[0].id, first);
    }

    // No starvation under bounded contention: 50 callers, all terminate.
    #[test]
    fn test_many_parallel_callers_terminate() {
        init_tracing();
        let (_dir, store, mut config) = setup();
        config.recency_window = std::time::Duration::from_secs(10);
        let reconciler = Arc::new(IdentityReconciler::new(store, config));
        let fp = Fingerprint::from_request("203.0.113.7", "Mozilla/5.0");

        let mut handles = Vec::new();
        for _ in 0..50 {
            let reconciler = reconciler.clone();
            let fp = fp.clone();
            handles.push(thread::spawn(move || reconciler.resolve(&fp)));
        }
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    }

    #[test]
    fn test_distinct_fingerprints_get_distinct_ids() {
        let (_dir, store, config) = setup();
        let reconciler = IdentityReconciler::new(store, config);

        let a = reconciler
            .resolve(&Fingerprint::from_request("203.0.113.7", "Mozilla/5.0"))
            .unwrap();
        let b = reconciler
            .resolve(&Fingerprint::from_request("203.0.113.8", "Mozilla/5.0"))
            .unwrap();
        assert_ne!(a, b);
    }

    // A row older than the recency window belongs to a stale visit attempt:
    // it is left alone and a suffixed name is created instead.
    #[test]
    fn test_stale_row_gets_fresh_suffix() {
        let (_dir, store, config) = setup();
        let fp = Fingerprint::from_request("203.0.113.7", "Mozilla/5.0");

        // plant a row created two hours ago
        let two_hours_ago = Utc::now().timestamp_millis() - 2 * 3600 * 1000;
        let mut w = store.writer().unwrap();
        let tx = w.begin().unwrap();
        let stale_id = tx.insert_candidate(fp.key(), two_hours_ago).unwrap();
        tx.commit().unwrap();
        store
            .initialize_defaults(stale_id, two_hours_ago, two_hours_ago)
            .unwrap();

        let reconciler = IdentityReconciler::new(store.clone(), config);
        let id = reconciler.resolve(&fp).unwrap();

        assert_ne!(id, stale_id, "stale identity must not be silently reused");
        assert!(store.get(stale_id).unwrap().is_some(), "stale row left alone");
        assert_eq!(store.final_count_matching(&fp.name_with_suffix(1)).unwrap(), 1);
    }

    // The race scenario, forced deterministically: two rows with the same
    // name already committed (as storage without a uniqueness constraint
    // permits). Adjudication keeps the smallest id and deletes the rest.
    #[test]
    fn test_adjudication_smallest_id_wins() {
        let (_dir, store, config) = setup();
        let fp = Fingerprint::from_request("203.0.113.7", "Mozilla/5.0");
        let now = Utc::now().timestamp_millis();

        let mut w = store.writer().unwrap();
        let tx = w.begin().unwrap();
        let id_a = tx.insert_candidate(fp.key(), now).unwrap();
        tx.commit().unwrap();
        let tx = w.begin().unwrap();
        let id_b = tx.insert_candidate(fp.key(), now).unwrap();
        tx.commit().unwrap();
        assert!(id_a < id_b);
        drop(w);

        // a third caller arriving mid-race sees two recent rows, bumps the
        // suffix, and settles on its own row without touching the racers'
        let reconciler = IdentityReconciler::new(store.clone(), config);
        let third = reconciler.resolve(&fp).unwrap();
        assert_ne!(third, id_a);
        assert_ne!(third, id_b);

        // the racers' own adjudication pass: winner is min(id_a, id_b)
        let survivors = store.rows_matching(fp.key()).unwrap();
        let winner = survivors.iter().map(|r| r.id).min().unwrap();
        assert_eq!(winner, id_a);
        for row in &survivors {
            if row.id != winner {
                store.delete(row.id).unwrap();
            }
        }
        assert_eq!(store.final_count_matching(fp.key()).unwrap(), 1);
        assert_eq!(store.rows_matching(fp.key()).unwrap()[0].id, id_a);
    }

    // Bot isolation: automated traffic shares one synthetic identity and
    // inserts no rows after the first.
    #[test]
    fn test_bot_traffic_shares_one_identity() {
        let (_dir, store, config) = setup();
        let reconciler = IdentityReconciler::new(store.clone(), config);
        let classifier = FixedBotClassifier(true);

        let first = reconciler
            .resolve_request(&classifier, "198.51.100.1", "somebot/1.0", "/")
            .unwrap();
        for i in 0..1000 {
            let id = reconciler
                .resolve_request(
                    &classifier,
                    &format!("198.51.100.{}", i % 250),
                    &format!("somebot/{i}"),
                    "/products",
                )
                .unwrap();
            assert_eq!(id, first);
        }

        // exactly one row in the whole table
        assert_eq!(store.find_bot_identity().unwrap(), Some(first));
        assert_eq!(store.final_count_matching("_bot").unwrap(), 1);
    }

    #[test]
    fn test_bot_identity_survives_process_restart() {
        let (_dir, store, config) = setup();

        let first = IdentityReconciler::new(store.clone(), config.clone())
            .bot_identity()
            .unwrap();
        // a fresh reconciler (new process) finds the same row
        let second = IdentityReconciler::new(store, config).bot_identity().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_human_traffic_not_routed_to_bot_identity() {
        let (_dir, store, config) = setup();
        let reconciler = IdentityReconciler::new(store.clone(), config);

        let id = reconciler
            .resolve_request(
                &FixedBotClassifier(false),
                "203.0.113.7",
                "Mozilla/5.0",
                "/products",
            )
            .unwrap();
        assert!(store.find_bot_identity().unwrap().is_none());
        let identity = store.get(id).unwrap().unwrap();
        assert_eq!(identity.role, crate::store::Role::Anonymous);
    }
}
