//! Stamps every request/response pair with a correlation identifier.

use super::{Context, Middleware, MiddlewareResponse, PreOutcome};
use crate::http::request::Request;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct RequestIdConfig {
    pub header_name: String,
}

impl Default for RequestIdConfig {
    fn default() -> Self {
        Self { header_name: "x-request-id".to_owned() }
    }
}

pub struct RequestId {
    config: RequestIdConfig,
}

impl RequestId {
    pub fn new(config: RequestIdConfig) -> Self {
        Self { config }
    }
}

impl Middleware for RequestId {
    fn pre(&self, ctx: &mut Context, request: &Request<'_>) -> PreOutcome {
        let id = request
            .header(self.config.header_name.as_bytes())
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(str::to_owned)
            .unwrap_or_else(generate_id);

        ctx.request_id = Some(id);
        PreOutcome::Continue
    }

    fn post(&self, ctx: &mut Context, _request: &Request<'_>, response: &mut MiddlewareResponse) {
        if let Some(id) = &ctx.request_id {
            response.set_header(self.config.header_name.clone(), id.clone());
        }
    }
}

fn generate_id() -> String {
    let value: u128 = rand::thread_rng().gen();
    format!("{value:032x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{http::types::StatusCode, limits::ReqLimits};

    #[test]
    fn generates_an_id_when_the_client_sends_none() {
        let middleware = RequestId::new(RequestIdConfig::default());
        let request = Request::new(&ReqLimits::default());
        let mut ctx = Context::default();

        assert!(matches!(middleware.pre(&mut ctx, &request), PreOutcome::Continue));
        let id = ctx.request_id.clone().unwrap();

        let mut response = MiddlewareResponse::new(StatusCode::Ok);
        middleware.post(&mut ctx, &request, &mut response);

        assert_eq!(response.header("x-request-id"), Some(id.as_str()));
    }

    #[test]
    fn custom_header_name_is_used_for_both_directions() {
        let middleware = RequestId::new(RequestIdConfig { header_name: "x-trace-id".to_owned() });
        let request = Request::new(&ReqLimits::default());
        let mut ctx = Context::default();

        middleware.pre(&mut ctx, &request);
        let mut response = MiddlewareResponse::new(StatusCode::Ok);
        middleware.post(&mut ctx, &request, &mut response);

        assert!(response.header("x-trace-id").is_some());
        assert!(response.header("x-request-id").is_none());
    }
}
