//! Cross-Origin Resource Sharing: preflight short-circuit plus response stamping.

use super::{Context, Middleware, MiddlewareResponse, PreOutcome};
use crate::http::{request::Request, types::StatusCode};

#[derive(Debug, Clone)]
pub enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: AllowedOrigins,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: Option<u64>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: AllowedOrigins::Any,
            allowed_methods: vec!["GET".into(), "POST".into(), "PUT".into(), "PATCH".into(), "DELETE".into()],
            allowed_headers: vec!["content-type".into()],
            exposed_headers: Vec::new(),
            allow_credentials: false,
            max_age: Some(86400),
        }
    }
}

pub struct Cors {
    config: CorsConfig,
}

impl Cors {
    pub fn new(config: CorsConfig) -> Self {
        Self { config }
    }

    fn origin_header(&self, origin: &str) -> Option<String> {
        match &self.config.allowed_origins {
            AllowedOrigins::Any if !self.config.allow_credentials => Some("*".to_owned()),
            AllowedOrigins::Any => Some(origin.to_owned()),
            AllowedOrigins::List(list) => list.iter().any(|o| o == origin).then(|| origin.to_owned()),
        }
    }
}

impl Middleware for Cors {
    fn pre(&self, _ctx: &mut Context, request: &Request<'_>) -> PreOutcome {
        let Some(origin) = request.header(b"origin").and_then(|v| std::str::from_utf8(v).ok()) else {
            return PreOutcome::Continue;
        };

        let Some(requested_method) = request.header(b"access-control-request-method") else {
            return PreOutcome::Continue;
        };
        let requested_method = String::from_utf8_lossy(requested_method);

        if !self.config.allowed_methods.iter().any(|m| m.eq_ignore_ascii_case(&requested_method)) {
            return PreOutcome::Respond(MiddlewareResponse::new(StatusCode::Forbidden));
        }

        let Some(allow_origin) = self.origin_header(&origin) else {
            return PreOutcome::Respond(MiddlewareResponse::new(StatusCode::Forbidden));
        };

        let mut response = MiddlewareResponse::new(StatusCode::NoContent)
            .with_header("access-control-allow-origin", allow_origin)
            .with_header("access-control-allow-methods", self.config.allowed_methods.join(", "))
            .with_header("access-control-allow-headers", self.config.allowed_headers.join(", "));

        if self.config.allow_credentials {
            response.set_header("access-control-allow-credentials", "true");
        }
        if let Some(max_age) = self.config.max_age {
            response.set_header("access-control-max-age", max_age.to_string());
        }

        PreOutcome::Respond(response)
    }

    fn post(&self, _ctx: &mut Context, request: &Request<'_>, response: &mut MiddlewareResponse) {
        let Some(origin) = request.header(b"origin").and_then(|v| std::str::from_utf8(v).ok()) else {
            return;
        };
        let Some(allow_origin) = self.origin_header(&origin) else { return };

        response.set_header("access-control-allow-origin", allow_origin);
        if self.config.allow_credentials {
            response.set_header("access-control-allow-credentials", "true");
        }
        if !self.config.exposed_headers.is_empty() {
            response.set_header("access-control-expose-headers", self.config.exposed_headers.join(", "));
        }
    }
}
