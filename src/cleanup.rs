//! Periodic retirement sweep.
//!
//! Anonymous profiles are cheap to create and most are abandoned after a
//! single page view, so the table would grow without bound if nothing
//! pruned it. A dedicated thread wakes on an interval, collects anonymous
//! identities whose `retire_after` deadline has passed, and deletes them,
//! unless an injected predicate says the identity still carries something
//! important (by default: recorded purchases, posts or comments). An
//! abandoned cart is deliberately NOT important; it is the most common
//! thing the sweep exists to reclaim.
//!
//! The deletion itself re-checks role and deadline inside the SQL, so an
//! identity that authenticates or becomes active between listing and
//! deleting is left alone.

use crate::config::SweepConfig;
use crate::error::Result;
use crate::meta::{is_empty_payload, MetaStore};
use crate::store::IdentityStore;
use chrono::Utc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};

/// Decides whether an expired identity still holds data worth keeping.
pub type ImportantDataCheck = dyn Fn(&MetaStore, i64) -> Result<bool> + Send + Sync;

/// Meta keys that mark an identity as having real history.
const HISTORY_KEYS: &[&str] = &["purchases", "posts", "comments"];

/// Default check: any recorded purchase, post or comment makes the
/// identity important. A zero count or empty payload does not.
pub fn has_important_history(meta: &MetaStore, id: i64) -> Result<bool> {
    for key in HISTORY_KEYS {
        if let Some(value) = meta.get_meta(id, key)? {
            if !is_empty_payload(&value) && value.as_u64() != Some(0) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Handle to the background sweep thread.
pub struct RetirementSweep {
    shutdown_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl RetirementSweep {
    /// Spawn the sweep thread with the default important-data check.
    pub fn spawn(store: IdentityStore, config: SweepConfig) -> std::io::Result<Self> {
        Self::spawn_with_check(store, config, Box::new(has_important_history))
    }

    /// Spawn the sweep thread with a custom important-data check.
    pub fn spawn_with_check(
        store: IdentityStore,
        config: SweepConfig,
        check: Box<ImportantDataCheck>,
    ) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("visitor-sweep".into())
            .spawn(move || {
                let meta = MetaStore::new(store.clone());
                loop {
                    match shutdown_rx.recv_timeout(config.interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            tracing::debug!("retirement sweep shutting down");
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            match sweep_once(&store, &meta, &config, check.as_ref()) {
                                Ok(0) => {}
                                Ok(deleted) => {
                                    tracing::info!(deleted, "retired expired visitor identities");
                                }
                                Err(e) => {
                                    // non-fatal: try again next interval
                                    tracing::warn!("retirement sweep failed: {e}");
                                }
                            }
                        }
                    }
                }
            })?;

        Ok(Self {
            shutdown_tx,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RetirementSweep {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One sweep pass. Exposed so hosts with their own scheduler can drive the
/// cadence themselves instead of spawning the thread.
pub fn sweep_once(
    store: &IdentityStore,
    meta: &MetaStore,
    config: &SweepConfig,
    important: &ImportantDataCheck,
) -> Result<usize> {
    let now = Utc::now().timestamp_millis();
    let mut deleted = 0;

    for id in store.expired_identities(now, config.batch_limit)? {
        if important(meta, id)? {
            tracing::trace!(id, "expired identity kept: important data attached");
            continue;
        }
        // the guard in the SQL re-checks role and deadline
        if store.delete_if_stale(id, now)? {
            meta.delete_all_meta(id)?;
            deleted += 1;
        }
    }

    Ok(deleted)
}
