//! Anonymous visitor identity reconciliation for storefronts.
//!
//! A shop wants one identity row per visitor so carts and checkout state
//! have somewhere to live before anyone registers. The hard part is the
//! very first contact: a cached page can fire several parallel requests
//! before any cookie exists, and each one looks like a brand-new visitor.
//! This crate makes those requests converge on exactly one identity, with
//! no duplicate rows and no lost cart writes, while keeping crawler traffic out
//! of the table entirely.
//!
//! # Components
//!
//! ```text
//! request ──→ VisitorSession::current_identity
//!                 │
//!                 ├─ CookieCodec::validate ── valid? ──→ done
//!                 ├─ BotClassifier ── automated? ──→ shared bot identity
//!                 └─ IdentityReconciler::resolve ──→ CookieCodec::issue
//!                         │
//!                         └─ IdentityStore (SQLite, pooled, WAL)
//! ```
//!
//! `RetirementSweep` prunes abandoned anonymous profiles in the background,
//! and `MetaStore` holds the per-identity payloads (cart and friends) that
//! make the identities worth having.

pub mod bot;
pub mod cleanup;
pub mod config;
pub mod cookie;
pub mod country;
pub mod error;
pub mod fingerprint;
pub mod meta;
pub mod reconcile;
pub mod session;
pub mod store;

pub use bot::{BotClassifier, FixedBotClassifier, HeuristicBotClassifier};
pub use cleanup::RetirementSweep;
pub use config::{IdentityConfig, SweepConfig};
pub use cookie::CookieCodec;
pub use country::{CountryRecord, CountryTable};
pub use error::{IdentityError, Result};
pub use fingerprint::Fingerprint;
pub use meta::MetaStore;
pub use reconcile::IdentityReconciler;
pub use session::{CookieUpdate, RequestInfo, ResolvedIdentity, VisitorSession};
pub use store::{Identity, IdentityStore, Role};
