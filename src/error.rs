//! Error taxonomy for the visitor identity subsystem.
//!
//! Only two conditions are real errors from the caller's point of view:
//! storage being unavailable, and the reconciliation loop running out of
//! retries. An invalid or expired cookie is deliberately NOT an error;
//! it is an `Option`-shaped miss, so callers can never leak to an end user
//! which of the validation checks failed.

use thiserror::Error;

/// Errors surfaced by identity resolution and storage.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The storage backend failed mid-operation. The caller should treat the
    /// visitor as anonymous-without-identity for this one request and let the
    /// next request retry; masking an outage here would hide real trouble.
    #[error("visitor storage unavailable: {0}")]
    TransientStorage(#[from] rusqlite::Error),

    /// No connection could be checked out of the pool.
    #[error("visitor storage pool unavailable: {0}")]
    Pool(#[from] r2d2::Error),

    /// Filesystem trouble while opening the database.
    #[error("visitor storage io error: {0}")]
    Io(#[from] std::io::Error),

    /// The reconciliation loop hit its hard iteration cap. This is a critical
    /// anomaly (pathological contention or a storage clock problem), not a
    /// retryable condition.
    #[error("identity reconciliation gave up after {iterations} iterations for prefix {prefix}")]
    RetryBudgetExhausted { prefix: String, iterations: u32 },
}

pub type Result<T> = std::result::Result<T, IdentityError>;
