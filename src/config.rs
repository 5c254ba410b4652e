//! Tunable constants for identity reconciliation and session upkeep.
//!
//! All the magic numbers ("half a second", "10000 loops", "48 hours") live
//! here as explicit fields, so deployments can tune them without touching
//! the algorithm.

use std::time::Duration;

/// Configuration for identity reconciliation and activity tracking.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Recency window W: two rows sharing a fingerprint prefix whose
    /// creation times fall within this window are assumed to come from the
    /// same visit attempt. Rows older than this are stale and get a fresh
    /// suffix instead of being silently reused.
    pub recency_window: Duration,

    /// Hard cap on reconciliation loop iterations. Exceeding it is treated
    /// as a fatal invariant violation, not another retry.
    pub retry_cap: u32,

    /// Lifetime of an issued identity cookie.
    pub cookie_ttl: Duration,

    /// Minimum gap between two persisted `last_active_at` updates. Activity
    /// inside this window is not written, bounding writes to one per window
    /// instead of one per request.
    pub activity_threshold: Duration,

    /// How far past the latest qualifying activity an anonymous identity is
    /// kept before it becomes eligible for the retirement sweep.
    pub retire_grace: Duration,

    /// Grace given to a freshly created identity before any activity has
    /// been recorded. Kept short so one-page-view profiles are swept
    /// quickly instead of cluttering the table.
    pub initial_retire_grace: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            recency_window: Duration::from_millis(500),
            retry_cap: 10_000,
            cookie_ttl: Duration::from_secs(48 * 3600),
            activity_threshold: Duration::from_secs(3600),
            retire_grace: Duration::from_secs(48 * 3600),
            initial_retire_grace: Duration::from_secs(2 * 3600),
        }
    }
}

impl IdentityConfig {
    pub(crate) fn recency_window_ms(&self) -> i64 {
        self.recency_window.as_millis() as i64
    }

    pub(crate) fn activity_threshold_ms(&self) -> i64 {
        self.activity_threshold.as_millis() as i64
    }

    pub(crate) fn retire_grace_ms(&self) -> i64 {
        self.retire_grace.as_millis() as i64
    }

    pub(crate) fn initial_retire_grace_ms(&self) -> i64 {
        self.initial_retire_grace.as_millis() as i64
    }
}

/// Configuration for the periodic retirement sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Time between sweep passes.
    pub interval: Duration,
    /// Maximum identities deleted per pass, so a large backlog cannot
    /// monopolize the writer.
    pub batch_limit: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            batch_limit: 100,
        }
    }
}
