//! Double-submit-cookie CSRF protection.

use super::{session::read_cookie, session::SameSite, Context, Middleware, MiddlewareResponse, PreOutcome};
use crate::http::{request::Request, types::Method};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct CsrfConfig {
    pub cookie_name: String,
    pub header_name: String,
    pub token_length: usize,
    pub exempt_methods: Vec<Method>,
    /// Request paths (exact match against [`Url::path`](crate::Url::path))
    /// that skip the check regardless of method, e.g. a webhook endpoint
    /// authenticated by a signature header instead of a session cookie.
    pub exempt_paths: Vec<String>,
    pub cookie_secure: bool,
    /// `false` by default: the double-submit pattern requires the page's
    /// own script to read the cookie back and echo it in the header, so an
    /// `HttpOnly` cookie here would defeat the mechanism unless the caller
    /// has another way to learn the token (e.g. embedding it server-side).
    pub cookie_http_only: bool,
    pub cookie_same_site: SameSite,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            cookie_name: "XSRF-TOKEN".to_owned(),
            header_name: "x-xsrf-token".to_owned(),
            token_length: 32,
            exempt_methods: vec![Method::Get, Method::Head, Method::Options, Method::Trace],
            exempt_paths: Vec::new(),
            cookie_secure: true,
            cookie_http_only: false,
            cookie_same_site: SameSite::Strict,
        }
    }
}

pub struct Csrf {
    config: CsrfConfig,
}

impl Csrf {
    pub fn new(config: CsrfConfig) -> Self {
        Self { config }
    }

    fn cookie_token<'a>(&self, request: &'a Request<'_>) -> Option<String> {
        let cookies = request.header(b"cookie")?;
        let cookies = std::str::from_utf8(cookies).ok()?;
        read_cookie(cookies, &self.config.cookie_name).map(str::to_owned)
    }
}

impl Middleware for Csrf {
    fn pre(&self, _ctx: &mut Context, request: &Request<'_>) -> PreOutcome {
        if self.config.exempt_methods.contains(&request.method()) {
            return PreOutcome::Continue;
        }
        if self.config.exempt_paths.iter().any(|p| p.as_bytes() == request.url().path()) {
            return PreOutcome::Continue;
        }

        let cookie_token = self.cookie_token(request);
        let header_token = request
            .header(self.config.header_name.as_bytes())
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(str::to_owned);

        match (cookie_token, header_token) {
            (Some(a), Some(b)) if constant_time_eq(a.as_bytes(), b.as_bytes()) => PreOutcome::Continue,
            _ => PreOutcome::Respond(MiddlewareResponse::new(crate::http::types::StatusCode::Forbidden)),
        }
    }

    fn post(&self, _ctx: &mut Context, request: &Request<'_>, response: &mut MiddlewareResponse) {
        if self.cookie_token(request).is_some() {
            return;
        }

        let token = generate_token(self.config.token_length);
        let set_cookie = format!(
            "{}={}; Path=/; SameSite={}{}{}",
            self.config.cookie_name,
            token,
            self.config.cookie_same_site.as_str(),
            if self.config.cookie_secure { "; Secure" } else { "" },
            if self.config.cookie_http_only { "; HttpOnly" } else { "" },
        );
        response.headers.push(("set-cookie".to_owned(), set_cookie));
    }
}

fn generate_token(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ReqLimits;

    #[test]
    fn constant_time_eq_rejects_mismatched_tokens() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn get_requests_are_exempt() {
        let csrf = Csrf::new(CsrfConfig::default());
        let request = Request::new(&ReqLimits::default());
        let mut ctx = Context::default();

        assert!(matches!(csrf.pre(&mut ctx, &request), PreOutcome::Continue));
    }

    #[test]
    fn exempt_path_list_matches_by_exact_path() {
        let exempt_paths = vec!["/webhook".to_owned()];
        assert!(exempt_paths.iter().any(|p| p.as_bytes() == b"/webhook"));
        assert!(!exempt_paths.iter().any(|p| p.as_bytes() == b"/webhook/extra"));
    }
}
