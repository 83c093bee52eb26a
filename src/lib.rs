//! spinnerette - an HTTP/1.1 and WebSocket server runtime for microservices
//!
//! A wire-level engine handling request parsing, response writing,
//! keep-alive, streaming bodies, multipart uploads and WebSocket framing,
//! with a composable middleware pipeline (CORS, CSRF, sessions, rate
//! limiting, compression, request IDs) layered on top.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, chunked transfer encoding, streaming bodies
//! - **HTTP/1.0**: basic protocol support for legacy clients
//! - **WebSocket**: RFC 6455 upgrade handshake, framing, and fragmentation
//!
//! # Features
//!
//! - **Fully configurable limits and timeouts** for requests, responses, connections and WebSocket frames.
//! - **Storing data between requests** in a single connection via the [`ConnectionData`] trait.
//! - **Streaming response bodies** (files or arbitrary chunk producers) without buffering the whole body.
//! - **Middleware composition** for cross-cutting concerns, independent of routing.
//! - **Graceful overload handling** - automatic 503 responses once the admission limit is reached.
//!
//! # Quick Start
//!
//! ```no_run
//! use spinnerette::{Server, Handler, Request, Response, Handled, StatusCode};
//! use tokio::net::TcpListener;
//!
//! struct MyHandler;
//!
//! impl Handler for MyHandler {
//!     async fn handle(&self, _: &mut (), _: &Request<'_>, resp: &mut Response) -> Handled {
//!         resp.status(StatusCode::Ok).body("Hello World!")
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
pub(crate) mod http {
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod server_impl;
}
pub(crate) mod errors;
pub mod limits;
pub mod middleware;
pub mod multipart;
pub mod ws;

pub use crate::{
    http::{
        query,
        request::Request,
        response::{
            write::{BodyWriter, WriteBuffer},
            Handled, Response,
        },
        types::{Method, StatusCode, Url, Version},
    },
    server::{connection::ConnectionData, server_impl::{Handler, Server, ServerBuilder}},
};

#[doc(hidden)]
#[cfg(test)]
pub fn run_test<F: for<'r> FnOnce(&Request<'r>, &mut Response) -> Handled>(f: F) {
    f(
        &Request::new(&crate::limits::ReqLimits::default()),
        &mut Response::new(&crate::limits::RespLimits::default()),
    );
}

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_handler {
    ($name:ident) => {
        use spinnerette::{Handled, Handler, Request, Response, StatusCode};
        struct $name;

        // `<()>` to check functionality
        impl Handler<()> for $name {
            async fn handle(&self, _: &mut (), _: &Request<'_>, resp: &mut Response) -> Handled {
                resp.status(StatusCode::Ok).body("Hello world!")
            }
        }
    };
}

#[doc(hidden)]
#[cfg(test)]
pub(crate) mod tools {
    use std::str::from_utf8;

    #[inline]
    pub(crate) fn str(value: Option<&[u8]>) -> Option<&str> {
        Some(from_utf8(value?).unwrap())
    }

    #[inline]
    pub(crate) fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[inline]
    pub(crate) fn str_2<'a>(value: (&'a [u8], &'a [u8])) -> (&'a str, &'a str) {
        (from_utf8(value.0).unwrap(), from_utf8(value.1).unwrap())
    }
}
