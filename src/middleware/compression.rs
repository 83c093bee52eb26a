//! Response body compression, negotiated against the client's `Accept-Encoding`.

use super::{Context, Middleware, MiddlewareResponse};
use crate::http::request::Request;
use flate2::{
    write::{DeflateEncoder, GzEncoder},
    Compression,
};
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    fn as_str(self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub level: u32,
    pub min_size: usize,
    pub exclude_content_types: Vec<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: 6,
            min_size: 256,
            exclude_content_types: vec!["image/".to_owned(), "video/".to_owned()],
        }
    }
}

pub struct CompressionMiddleware {
    config: CompressionConfig,
}

impl CompressionMiddleware {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    fn is_excluded(&self, content_type: &str) -> bool {
        self.config.exclude_content_types.iter().any(|prefix| content_type.starts_with(prefix.as_str()))
    }

    fn negotiate(&self, request: &Request<'_>) -> Option<Encoding> {
        let accept_encoding = request.header(b"accept-encoding")?;
        let accept_encoding = std::str::from_utf8(accept_encoding).ok()?;
        let tokens: Vec<&str> = accept_encoding.split(',').map(str::trim).collect();

        if tokens.iter().any(|t| t.starts_with("gzip")) {
            Some(Encoding::Gzip)
        } else if tokens.iter().any(|t| t.starts_with("deflate")) {
            Some(Encoding::Deflate)
        } else {
            None
        }
    }

    fn compress(&self, body: &[u8], encoding: Encoding) -> std::io::Result<Vec<u8>> {
        let level = Compression::new(self.config.level);
        match encoding {
            Encoding::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), level);
                encoder.write_all(body)?;
                encoder.finish()
            }
            Encoding::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), level);
                encoder.write_all(body)?;
                encoder.finish()
            }
        }
    }
}

impl Middleware for CompressionMiddleware {
    fn post(&self, _ctx: &mut Context, request: &Request<'_>, response: &mut MiddlewareResponse) {
        if response.header("content-encoding").is_some() {
            return;
        }
        if response.body.len() < self.config.min_size {
            return;
        }

        let Some(encoding) = self.negotiate(request) else { return };

        if let Some(content_type) = response.header("content-type") {
            if self.is_excluded(content_type) {
                return;
            }
        }

        let Ok(compressed) = self.compress(&response.body, encoding) else { return };

        if compressed.len() >= response.body.len() {
            return;
        }

        response.body = compressed;
        response.set_header("content-encoding", encoding.as_str());
        response.set_header("content-length", response.body.len().to_string());
        response.set_header("vary", "accept-encoding");
    }
}
