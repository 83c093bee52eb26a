//! Composable request/response middleware, layered on top of the wire-level
//! request parser and response writer rather than inside them.
//!
//! Handlers running under a pipeline build a [`MiddlewareResponse`] (a plain
//! headers+body value) instead of writing directly into the zero-copy
//! [`Response`](crate::Response) builder; the pipeline renders the final,
//! fully-decorated value into a real `Response` exactly once, after every
//! middleware's `post` step has had a chance to add headers or rewrite the
//! body. This sidesteps `Response`'s append-only state machine, which has no
//! way to go back and add a header once the body has been written.

pub mod compression;
pub mod cors;
pub mod csrf;
pub mod rate_limit;
pub mod request_id;
pub mod session;

use crate::{http::request::Request, http::types::StatusCode, server::connection::ConnectionData, Handled, Response};

/// Per-request scratch state threaded through one pipeline invocation.
///
/// Never shared between requests; a fresh `Context` is created for each one.
#[derive(Debug, Default)]
pub struct Context {
    pub request_id: Option<String>,
    pub session: Option<session::Session>,
    pub rate_limited: bool,
}

/// A plain, fully-owned response value middleware can freely add headers to
/// or rewrite the body of, before it is rendered onto the wire.
#[derive(Debug, Clone)]
pub struct MiddlewareResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl MiddlewareResponse {
    pub fn new(status: StatusCode) -> Self {
        Self { status, headers: Vec::new(), body: Vec::new() }
    }

    pub fn with_header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body<B: Into<Vec<u8>>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn set_header<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        let name = name.into();
        if let Some(existing) = self.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            existing.1 = value.into();
        } else {
            self.headers.push((name, value.into()));
        }
    }
}

/// The outcome of a middleware's `pre` step.
pub enum PreOutcome {
    Continue,
    Respond(MiddlewareResponse),
}

/// A request-handling pipeline stage.
///
/// Default methods make every middleware the identity element: `Continue`
/// and a no-op `post`. Composing two middlewares with [`Middleware::and_then`]
/// builds a new value wrapping both; it is never mutated in place.
pub trait Middleware: Send + Sync {
    fn pre(&self, _ctx: &mut Context, _request: &Request<'_>) -> PreOutcome {
        PreOutcome::Continue
    }

    fn post(&self, _ctx: &mut Context, _request: &Request<'_>, _response: &mut MiddlewareResponse) {}

    /// Chains `self` before `next`: `next.pre` only runs if `self.pre`
    /// continues, and `self.post` wraps `next.post` (`next` decorates
    /// first, `self` decorates last).
    fn and_then<N: Middleware>(self, next: N) -> Chain<Self, N>
    where
        Self: Sized,
    {
        Chain { first: self, second: next }
    }
}

/// The identity element of [`Middleware::and_then`]: every default method is
/// already a no-op, so this struct needs nothing else.
pub struct Identity;
impl Middleware for Identity {}

/// Two middlewares run as one: see [`Middleware::and_then`].
pub struct Chain<A, B> {
    first: A,
    second: B,
}

impl<A: Middleware, B: Middleware> Middleware for Chain<A, B> {
    fn pre(&self, ctx: &mut Context, request: &Request<'_>) -> PreOutcome {
        match self.first.pre(ctx, request) {
            PreOutcome::Continue => self.second.pre(ctx, request),
            respond @ PreOutcome::Respond(_) => respond,
        }
    }

    fn post(&self, ctx: &mut Context, request: &Request<'_>, response: &mut MiddlewareResponse) {
        self.second.post(ctx, request, response);
        self.first.post(ctx, request, response);
    }
}

/// A request handler that builds a [`MiddlewareResponse`] instead of writing
/// directly to the wire, for use under a [`Middleware`] pipeline.
pub trait Endpoint<S = ()>: Send + Sync
where
    S: ConnectionData,
{
    fn call(
        &self,
        connection_data: &mut S,
        request: &Request<'_>,
    ) -> impl std::future::Future<Output = MiddlewareResponse> + Send;
}

/// Runs `middleware.pre`, the wrapped `endpoint` (unless short-circuited),
/// and `middleware.post`, then renders the result into `response`.
pub async fn run_pipeline<E, M, S>(
    endpoint: &E,
    middleware: &M,
    connection_data: &mut S,
    request: &Request<'_>,
    response: &mut Response,
) -> Handled
where
    E: Endpoint<S>,
    M: Middleware,
    S: ConnectionData,
{
    let mut ctx = Context::default();

    let rendered = match middleware.pre(&mut ctx, request) {
        PreOutcome::Respond(resp) => resp,
        PreOutcome::Continue => {
            let mut resp = endpoint.call(connection_data, request).await;
            middleware.post(&mut ctx, request, &mut resp);
            resp
        }
    };

    render(rendered, response)
}

fn render(resp: MiddlewareResponse, out: &mut Response) -> Handled {
    out.status(resp.status);
    for (name, value) in &resp.headers {
        out.header(name.as_str(), value.as_str());
    }
    out.body(resp.body)
}
