//! Per-request visitor session facade.
//!
//! Orchestrates cookie validation, bot classification, reconciliation and
//! cookie issuance, and exposes the lifecycle operations host code calls
//! during a request: activity touches and the login-time cart merge.
//!
//! One `VisitorSession` is created per inbound request. The resolved
//! identity is cached inside the session, so however many times handler
//! code asks for the current identity, reconciliation runs at most once per
//! request; the amortized "one write per real visit" promise depends on
//! that.

use crate::bot::BotClassifier;
use crate::config::IdentityConfig;
use crate::cookie::CookieCodec;
use crate::error::Result;
use crate::meta::{is_empty_payload, MetaStore, CART_KEY};
use crate::reconcile::IdentityReconciler;
use crate::store::{IdentityStore, Role};
use chrono::Utc;
use std::sync::Arc;

/// What the request carried in.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub remote_addr: String,
    pub user_agent: String,
    pub path: String,
    /// The raw identity cookie value, if the browser sent one.
    pub cookie: Option<String>,
}

/// What the response should do with the identity cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieUpdate {
    /// Leave the cookie as-is.
    Keep,
    /// Set (or replace) the cookie with this token.
    Set(String),
    /// Expire the cookie.
    Clear,
}

/// The identity resolved for one request.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub id: i64,
    pub cookie: CookieUpdate,
}

/// Request-scoped facade over the identity subsystem.
pub struct VisitorSession {
    store: IdentityStore,
    meta: MetaStore,
    reconciler: Arc<IdentityReconciler>,
    codec: Arc<CookieCodec>,
    classifier: Arc<dyn BotClassifier>,
    config: IdentityConfig,
    resolved: Option<ResolvedIdentity>,
}

impl VisitorSession {
    pub fn new(
        store: IdentityStore,
        reconciler: Arc<IdentityReconciler>,
        codec: Arc<CookieCodec>,
        classifier: Arc<dyn BotClassifier>,
        config: IdentityConfig,
    ) -> Self {
        let meta = MetaStore::new(store.clone());
        Self {
            store,
            meta,
            reconciler,
            codec,
            classifier,
            config,
            resolved: None,
        }
    }

    /// Resolve the identity for this request, creating one if needed.
    ///
    /// The result is cached for the lifetime of the session: repeated calls
    /// return the same identity without re-resolving, even if the cookie
    /// header were somehow manipulated mid-request.
    pub fn current_identity(&mut self, request: &RequestInfo) -> Result<ResolvedIdentity> {
        if let Some(resolved) = &self.resolved {
            return Ok(resolved.clone());
        }

        let resolved = self.resolve_once(request)?;
        self.resolved = Some(resolved.clone());
        Ok(resolved)
    }

    fn resolve_once(&self, request: &RequestInfo) -> Result<ResolvedIdentity> {
        // 1. A valid cookie naming a still-existing identity settles it.
        //    Every failure mode (bad structure, bad MAC, expired, row
        //    purged) falls through identically.
        if let Some(token) = &request.cookie {
            if let Some(id) = self.codec.validate(token) {
                if self.store.exists(id)? {
                    return Ok(ResolvedIdentity {
                        id,
                        cookie: CookieUpdate::Keep,
                    });
                }
            }
        }

        // 2. Automated traffic shares the synthetic identity and gets no
        //    cookie: crawlers would never send it back anyway.
        if self
            .classifier
            .is_automated(&request.remote_addr, &request.user_agent, &request.path)
        {
            let id = self.reconciler.bot_identity()?;
            return Ok(ResolvedIdentity {
                id,
                cookie: CookieUpdate::Keep,
            });
        }

        // 3. Real visitor without a usable cookie: reconcile and issue.
        let fingerprint = crate::fingerprint::Fingerprint::from_request(
            &request.remote_addr,
            &request.user_agent,
        );
        let id = self.reconciler.resolve(&fingerprint)?;
        Ok(ResolvedIdentity {
            id,
            cookie: CookieUpdate::Set(self.codec.issue(id)),
        })
    }

    /// Record qualifying activity on an identity, throttled so repeated
    /// requests cost at most one write per threshold window. Anonymous
    /// identities also get their retirement deadline pushed out by the
    /// grace period, again only when the deadline actually moves by more
    /// than the threshold. No reason for another database hit on every
    /// request.
    ///
    /// Returns whether anything was written.
    pub fn touch_activity(&self, id: i64) -> Result<bool> {
        let Some(identity) = self.store.get(id)? else {
            return Ok(false);
        };

        let now = Utc::now().timestamp_millis();
        let threshold = self.config.activity_threshold_ms();

        if now - identity.last_active_at.unwrap_or(0) < threshold {
            return Ok(false);
        }
        self.store.record_activity(id, now)?;

        match identity.role {
            Role::Anonymous => {
                let keep_until = now + self.config.retire_grace_ms();
                if keep_until - identity.retire_after.unwrap_or(0) > threshold {
                    self.store.schedule_retirement(id, keep_until)?;
                }
            }
            Role::Authenticated | Role::Bot => {
                // durable identities never expire
                if identity.retire_after.is_some() {
                    self.store.clear_retirement(id)?;
                }
            }
        }

        Ok(true)
    }

    /// One-time, one-directional merge when a previously anonymous visitor
    /// logs in: if the anonymous cart has items and the authenticated cart
    /// is empty, copy it over so the shopper does not lose their work. The
    /// anonymous cart is then removed, the anonymous identity scheduled for
    /// immediate retirement, and the caller must clear the cookie from the
    /// response.
    pub fn merge_on_authentication(&self, anonymous_id: i64, authenticated_id: i64) -> Result<CookieUpdate> {
        if let Some(cart) = self.meta.get_meta(anonymous_id, CART_KEY)? {
            let auth_cart = self.meta.get_meta(authenticated_id, CART_KEY)?;
            let auth_empty = auth_cart.map_or(true, |c| is_empty_payload(&c));
            if !is_empty_payload(&cart) && auth_empty {
                self.meta.set_meta(authenticated_id, CART_KEY, &cart)?;
                tracing::debug!(
                    from = anonymous_id,
                    to = authenticated_id,
                    "copied anonymous cart to authenticated identity"
                );
            }
            // the anonymous copy is spent either way; a leftover cart must
            // not keep the retiring row alive
            self.meta.delete_meta(anonymous_id, CART_KEY)?;
        }

        // hand the anonymous row to the sweep
        self.store
            .schedule_retirement(anonymous_id, Utc::now().timestamp_millis())?;

        Ok(CookieUpdate::Clear)
    }

    /// Metadata store for this session's identities.
    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }
}
