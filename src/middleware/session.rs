//! Cookie-backed sessions with a pluggable storage backend.

use super::{Context, Middleware, MiddlewareResponse, PreOutcome};
use crate::http::request::Request;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

type HmacSha256 = Hmac<Sha256>;

/// Signs `value` as `value.signature`, signature = base64(HMAC-SHA256(value, secret)).
fn sign(value: &str, secret: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(value.as_bytes());
    let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    format!("{value}.{signature}")
}

/// Verifies a `value.signature` cookie, returning `value` only if the
/// signature matches under constant-time comparison.
fn verify<'a>(cookie: &'a str, secret: &[u8]) -> Option<&'a str> {
    let (value, signature) = cookie.rsplit_once('.')?;
    let signature = base64::engine::general_purpose::STANDARD.decode(signature).ok()?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(value.as_bytes());
    mac.verify_slice(&signature).ok()?;

    Some(value)
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub data: HashMap<String, String>,
    pub expires_at: SystemTime,
}

impl Session {
    fn new(id: String, ttl: Duration) -> Self {
        Self { id, data: HashMap::new(), expires_at: SystemTime::now() + ttl }
    }

    fn is_expired(&self) -> bool {
        SystemTime::now() > self.expires_at
    }

    /// Replaces the session id, keeping its data and expiry. Call this from
    /// a login handler after authenticating a previously-anonymous session,
    /// so a session id issued before login is never valid after it.
    pub fn regenerate(&mut self) {
        self.id = generate_id();
    }
}

/// Storage backend for session state, kept separate from the cookie plumbing
/// so a Redis- or database-backed store can replace the in-memory default.
pub trait SessionStore: Send + Sync {
    fn get(&self, id: &str) -> Option<Session>;
    fn save(&self, session: Session);
    fn delete(&self, id: &str);
}

/// Process-local session store. Entries past their expiry are dropped lazily
/// on lookup; call [`MemoryStore::cleanup`] periodically to reclaim abandoned
/// sessions nobody ever looks up again.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cleanup(&self) {
        self.sessions.lock().unwrap().retain(|_, s| !s.is_expired());
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, id: &str) -> Option<Session> {
        let session = self.sessions.lock().unwrap().get(id).cloned()?;
        if session.is_expired() {
            None
        } else {
            Some(session)
        }
    }

    fn save(&self, session: Session) {
        self.sessions.lock().unwrap().insert(session.id.clone(), session);
    }

    fn delete(&self, id: &str) {
        self.sessions.lock().unwrap().remove(id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

#[derive(Clone)]
pub struct SessionConfig {
    // `secret` is intentionally excluded from Debug below.
    pub cookie_name: String,
    pub max_age: Duration,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
    pub path: String,
    pub domain: Option<String>,
    pub sliding_expiration: bool,
    /// HMAC-SHA256 key the session id cookie is signed with, guarding
    /// against a client handing back a store key it never received.
    pub secret: Vec<u8>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("cookie_name", &self.cookie_name)
            .field("max_age", &self.max_age)
            .field("secure", &self.secure)
            .field("http_only", &self.http_only)
            .field("same_site", &self.same_site)
            .field("path", &self.path)
            .field("domain", &self.domain)
            .field("sliding_expiration", &self.sliding_expiration)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "session_id".to_owned(),
            max_age: Duration::from_secs(3600),
            secure: true,
            http_only: true,
            same_site: SameSite::Lax,
            path: "/".to_owned(),
            domain: None,
            sliding_expiration: true,
            secret: Vec::new(),
        }
    }
}

pub struct SessionMiddleware<T: SessionStore> {
    config: SessionConfig,
    store: Arc<T>,
}

impl<T: SessionStore> SessionMiddleware<T> {
    pub fn new(config: SessionConfig, store: Arc<T>) -> Self {
        Self { config, store }
    }
}

impl<T: SessionStore> Middleware for SessionMiddleware<T> {
    fn pre(&self, ctx: &mut Context, request: &Request<'_>) -> PreOutcome {
        let existing = request
            .header(b"cookie")
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|cookies| read_cookie(cookies, &self.config.cookie_name))
            .and_then(|cookie| verify(cookie, &self.config.secret))
            .and_then(|id| self.store.get(id));

        ctx.session = existing.or_else(|| Some(Session::new(generate_id(), self.config.max_age)));
        PreOutcome::Continue
    }

    fn post(&self, ctx: &mut Context, _request: &Request<'_>, response: &mut MiddlewareResponse) {
        let Some(mut session) = ctx.session.take() else { return };
        if self.config.sliding_expiration {
            session.expires_at = SystemTime::now() + self.config.max_age;
        }

        let signed_id = sign(&session.id, &self.config.secret);
        let domain = match &self.config.domain {
            Some(domain) => format!("; Domain={domain}"),
            None => String::new(),
        };
        let set_cookie = format!(
            "{}={}{}; Path={}; Max-Age={}{}{}; SameSite={}",
            self.config.cookie_name,
            signed_id,
            domain,
            self.config.path,
            self.config.max_age.as_secs(),
            if self.config.secure { "; Secure" } else { "" },
            if self.config.http_only { "; HttpOnly" } else { "" },
            self.config.same_site.as_str(),
        );
        response.headers.push(("set-cookie".to_owned(), set_cookie));

        self.store.save(session);
    }
}

/// Reads one named cookie out of a `Cookie` header value.
pub(crate) fn read_cookie<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies.split(';').map(str::trim).find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

fn generate_id() -> String {
    let value: u128 = rand::thread_rng().gen();
    format!("{value:032x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ReqLimits;

    #[test]
    fn signed_cookie_roundtrips_and_rejects_tampering() {
        let secret = b"top secret";
        let signed = sign("abc123", secret);
        assert_eq!(verify(&signed, secret), Some("abc123"));

        let tampered = signed.replace("abc123", "abc124");
        assert_eq!(verify(&tampered, secret), None);
    }

    #[test]
    fn reads_named_cookie_from_header() {
        assert_eq!(read_cookie("a=1; b=2; session_id=abc", "session_id"), Some("abc"));
        assert_eq!(read_cookie("a=1", "session_id"), None);
    }

    #[test]
    fn issues_a_fresh_session_when_no_cookie_present() {
        let store = Arc::new(MemoryStore::new());
        let middleware = SessionMiddleware::new(SessionConfig::default(), store.clone());
        let request = Request::new(&ReqLimits::default());
        let mut ctx = Context::default();

        middleware.pre(&mut ctx, &request);
        assert!(ctx.session.is_some());

        let mut response = MiddlewareResponse::new(crate::http::types::StatusCode::Ok);
        middleware.post(&mut ctx, &request, &mut response);

        assert!(response.headers.iter().any(|(n, _)| n == "set-cookie"));
    }
}
