//! Per-client request rate limiting: token bucket or sliding window.

use super::{Context, Middleware, MiddlewareResponse, PreOutcome};
use crate::http::{request::Request, types::StatusCode};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
}

/// Derives the bucket key for a request. Takes the first `X-Forwarded-For`
/// value by default; swap in a session id, an API key header, or an
/// authenticated user id when clients share a proxy and an IP-based key
/// would lump them into one bucket.
pub type KeyExtractor = Arc<dyn Fn(&Request<'_>) -> String + Send + Sync>;

fn default_key_extractor(request: &Request<'_>) -> String {
    request
        .header(b"x-forwarded-for")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .map(str::to_owned)
        .unwrap_or_else(|| "unknown".to_owned())
}

#[derive(Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub algorithm: Algorithm,
    pub key_extractor: KeyExtractor,
}

impl std::fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .field("algorithm", &self.algorithm)
            .field("key_extractor", &"<fn>")
            .finish()
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            algorithm: Algorithm::SlidingWindow,
            key_extractor: Arc::new(default_key_extractor),
        }
    }
}

enum Bucket {
    Window(Vec<Instant>),
    Tokens { available: f64, last_refill: Instant },
}

/// Per-client limiter. Keys that never come back are never reclaimed; call
/// [`RateLimit::sweep`] on an interval to bound memory.
pub struct RateLimit {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimit {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, buckets: Mutex::new(HashMap::new()) }
    }

    pub fn sweep(&self) {
        let cutoff = Instant::now() - self.config.window;
        let mut buckets = self.buckets.lock().unwrap();
        buckets.retain(|_, bucket| match bucket {
            Bucket::Window(hits) => hits.iter().any(|t| *t > cutoff),
            Bucket::Tokens { .. } => true,
        });
    }

    fn key_for(&self, request: &Request<'_>) -> String {
        (self.config.key_extractor)(request)
    }

    /// Records a hit for `key`, returning `(allowed, remaining, retry_after)`.
    fn check(&self, key: &str) -> (bool, u32, Duration) {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(key.to_owned()).or_insert_with(|| match self.config.algorithm {
            Algorithm::SlidingWindow => Bucket::Window(Vec::new()),
            Algorithm::TokenBucket => {
                Bucket::Tokens { available: self.config.max_requests as f64, last_refill: Instant::now() }
            }
        });

        match bucket {
            Bucket::Window(hits) => {
                let now = Instant::now();
                let cutoff = now - self.config.window;
                hits.retain(|t| *t > cutoff);

                if hits.len() as u32 >= self.config.max_requests {
                    let retry_after = hits
                        .iter()
                        .min()
                        .map(|oldest| self.config.window.saturating_sub(now.duration_since(*oldest)))
                        .unwrap_or(self.config.window);
                    return (false, 0, retry_after);
                }

                hits.push(now);
                (true, self.config.max_requests - hits.len() as u32, Duration::ZERO)
            }
            Bucket::Tokens { available, last_refill } => {
                let now = Instant::now();
                let refill_rate = self.config.max_requests as f64 / self.config.window.as_secs_f64();
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                *available = (*available + elapsed * refill_rate).min(self.config.max_requests as f64);
                *last_refill = now;

                if *available < 1.0 {
                    let deficit = 1.0 - *available;
                    let retry_after = Duration::from_secs_f64(deficit / refill_rate);
                    return (false, 0, retry_after);
                }

                *available -= 1.0;
                (true, *available as u32, Duration::ZERO)
            }
        }
    }

    fn remaining_for(&self, key: &str) -> u32 {
        self.buckets
            .lock()
            .unwrap()
            .get(key)
            .map(|bucket| match bucket {
                Bucket::Window(hits) => self.config.max_requests.saturating_sub(hits.len() as u32),
                Bucket::Tokens { available, .. } => *available as u32,
            })
            .unwrap_or(self.config.max_requests)
    }
}

impl Middleware for RateLimit {
    fn pre(&self, ctx: &mut Context, request: &Request<'_>) -> PreOutcome {
        let key = self.key_for(request);
        let (allowed, _remaining, retry_after) = self.check(&key);
        ctx.rate_limited = !allowed;

        if !allowed {
            let response = MiddlewareResponse::new(StatusCode::TooManyRequests)
                .with_header("retry-after", retry_after.as_secs().to_string())
                .with_header("x-ratelimit-limit", self.config.max_requests.to_string())
                .with_header("x-ratelimit-remaining", "0");
            return PreOutcome::Respond(response);
        }

        PreOutcome::Continue
    }

    fn post(&self, _ctx: &mut Context, request: &Request<'_>, response: &mut MiddlewareResponse) {
        let key = self.key_for(request);
        let remaining = self.remaining_for(&key);

        response.set_header("x-ratelimit-limit", self.config.max_requests.to_string());
        response.set_header("x-ratelimit-remaining", remaining.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ReqLimits;

    #[test]
    fn sliding_window_blocks_after_the_limit() {
        let config = RateLimitConfig { max_requests: 2, ..RateLimitConfig::default() };
        let limiter = RateLimit::new(config);
        let request = Request::new(&ReqLimits::default());
        let mut ctx = Context::default();

        assert!(matches!(limiter.pre(&mut ctx, &request), PreOutcome::Continue));
        assert!(matches!(limiter.pre(&mut ctx, &request), PreOutcome::Continue));
        match limiter.pre(&mut ctx, &request) {
            PreOutcome::Respond(resp) => assert_eq!(resp.status, StatusCode::TooManyRequests),
            PreOutcome::Continue => panic!("expected the third request to be rejected"),
        }
    }

    #[test]
    fn custom_key_extractor_is_used_instead_of_x_forwarded_for() {
        let config = RateLimitConfig {
            max_requests: 1,
            key_extractor: Arc::new(|_request| "fixed-key".to_owned()),
            ..RateLimitConfig::default()
        };
        let limiter = RateLimit::new(config);
        let request = Request::new(&ReqLimits::default());

        assert_eq!(limiter.key_for(&request), "fixed-key");
    }

    #[test]
    fn token_bucket_blocks_after_the_limit() {
        let config = RateLimitConfig { max_requests: 1, algorithm: Algorithm::TokenBucket, ..RateLimitConfig::default() };
        let limiter = RateLimit::new(config);
        let request = Request::new(&ReqLimits::default());
        let mut ctx = Context::default();

        assert!(matches!(limiter.pre(&mut ctx, &request), PreOutcome::Continue));
        match limiter.pre(&mut ctx, &request) {
            PreOutcome::Respond(resp) => assert_eq!(resp.status, StatusCode::TooManyRequests),
            PreOutcome::Continue => panic!("expected the second request to be rejected"),
        }
    }
}
