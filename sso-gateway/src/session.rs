//! Session state and the access gate in front of every proxied route.
//!
//! The browser holds an opaque, HMAC-signed session id in the `sso_session`
//! cookie. The session data itself (principal email and display name) lives
//! in a [`SessionStore`] populated by the login flow.

use std::sync::Arc;

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ring::hmac;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::policy::{normalize, AccessPolicy};

/// Name of the cookie carrying the signed session id.
pub const SESSION_COOKIE: &str = "sso_session";

/// An authenticated identity. The email is trimmed, lower-cased and never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    email: String,
    name: String,
}

impl Principal {
    /// Returns `None` when the email is blank. The display name falls back to
    /// the email.
    pub fn new(email: &str, name: Option<&str>) -> Option<Self> {
        let email = normalize(email);
        if email.is_empty() {
            return None;
        }
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map_or_else(|| email.clone(), str::to_string);
        Some(Self { email, name })
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Data stored server-side for one browser session.
#[derive(Debug, Clone)]
pub struct SessionData {
    pub principal: Principal,
    pub expires_at: DateTime<Utc>,
}

impl SessionData {
    pub fn new(principal: Principal, ttl: Duration) -> Self {
        Self {
            principal,
            expires_at: Utc::now()
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Server-side session storage keyed by an opaque session id.
pub trait SessionStore: Send + Sync {
    fn get(&self, id: &str) -> Option<SessionData>;
    fn set(&self, id: &str, data: SessionData);
    fn clear(&self, id: &str);
}

/// In-process session store. Expired entries are dropped when read and by
/// [`MemorySessionStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, SessionData>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Removes every expired session and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, data| !data.is_expired());
        before.saturating_sub(self.sessions.len())
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, id: &str) -> Option<SessionData> {
        let data = self.sessions.get(id).map(|entry| entry.value().clone())?;
        if data.is_expired() {
            debug!("dropping expired session");
            self.sessions.remove(id);
            return None;
        }
        Some(data)
    }

    fn set(&self, id: &str, data: SessionData) {
        self.sessions.insert(id.to_string(), data);
    }

    fn clear(&self, id: &str) {
        self.sessions.remove(id);
    }
}

/// Signs and verifies cookie values as `<value>.<hex HMAC-SHA256>`.
#[derive(Clone)]
pub struct CookieSigner {
    key: hmac::Key,
}

impl CookieSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    pub fn sign(&self, value: &str) -> String {
        let tag = hmac::sign(&self.key, value.as_bytes());
        format!("{value}.{}", hex::encode(tag.as_ref()))
    }

    /// Returns the original value if the signature checks out.
    pub fn verify(&self, signed: &str) -> Option<String> {
        let (value, sig) = signed.rsplit_once('.')?;
        let sig = hex::decode(sig).ok()?;
        hmac::verify(&self.key, value.as_bytes(), &sig).ok()?;
        Some(value.to_string())
    }
}

impl std::fmt::Debug for CookieSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieSigner").finish_non_exhaustive()
    }
}

/// Outcome of checking a request against the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Authenticated(Principal),
    Unauthenticated,
}

impl AuthState {
    pub const fn principal(&self) -> Option<&Principal> {
        match self {
            Self::Authenticated(p) => Some(p),
            Self::Unauthenticated => None,
        }
    }
}

/// Resolves the principal of a request from its session cookie.
#[derive(Clone)]
pub struct SessionGate {
    store: Arc<dyn SessionStore>,
    signer: CookieSigner,
    policy: Arc<AccessPolicy>,
    ttl: Duration,
}

impl SessionGate {
    pub fn new(
        store: Arc<dyn SessionStore>,
        signer: CookieSigner,
        policy: Arc<AccessPolicy>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            signer,
            policy,
            ttl,
        }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub const fn signer(&self) -> &CookieSigner {
        &self.signer
    }

    /// Looks up the session named by the request's cookie.
    ///
    /// Missing, tampered, expired or no-longer-allowed sessions are all
    /// reported as [`AuthState::Unauthenticated`].
    pub fn current_principal(&self, jar: &CookieJar) -> AuthState {
        let Some(cookie) = jar.get(SESSION_COOKIE) else {
            return AuthState::Unauthenticated;
        };
        let Some(id) = self.signer.verify(cookie.value()) else {
            warn!("rejecting session cookie with bad signature");
            return AuthState::Unauthenticated;
        };
        let Some(data) = self.store.get(&id) else {
            return AuthState::Unauthenticated;
        };
        if !self.policy.is_allowed(data.principal.email()) {
            warn!(email = %data.principal.email(), "session principal no longer allowed");
            return AuthState::Unauthenticated;
        }
        AuthState::Authenticated(data.principal)
    }

    /// Starts a new session and returns the jar with the signed cookie set.
    pub fn login(&self, jar: CookieJar, principal: Principal) -> CookieJar {
        let id = Uuid::new_v4().simple().to_string();
        self.store.set(&id, SessionData::new(principal, self.ttl));
        jar.add(Self::session_cookie(self.signer.sign(&id)))
    }

    /// Destroys the current session, if any, and removes the cookie.
    pub fn logout(&self, jar: CookieJar) -> CookieJar {
        if let Some(id) = jar
            .get(SESSION_COOKIE)
            .and_then(|c| self.signer.verify(c.value()))
        {
            self.store.clear(&id);
        }
        jar.remove(Cookie::build(SESSION_COOKIE).path("/"))
    }

    fn session_cookie(value: String) -> Cookie<'static> {
        Cookie::build((SESSION_COOKIE, value))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .build()
    }
}
