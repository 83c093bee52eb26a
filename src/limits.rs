//! Web server configuration limits and timeouts
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Memory overflows
//! - Slowloris attacks
//! - Header flooding
//!
//! # Memory Consumption
//!
//! Each active connection consumes memory according to:
//!
//! `Total` = [`Request Buffer`](crate::limits::ReqLimits#memory-allocation-strategy) +
//!           [`Response Buffer`](crate::limits::RespLimits#buffer-management) +
//!           `Runtime Overhead`
//!
//! See each component's documentation for details and configuration options.
//!
//! # Examples
//!
//! ```no_run
//! # spinnerette::impt_default_handler!{MyHandler}
//! use spinnerette::{Server, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use tokio::net::TcpListener;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .server_limits(ServerLimits {
//!             max_connections: 5000, // Higher concurrency
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(5),
//!             max_requests_per_connection: 10_000,
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 18,      // More headers for complex APIs
//!             body_size: 16 * 1024,  // 16KB for larger payloads
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use std::time::Duration;

/// Controls server-level concurrency, admission control, and overload behavior.
///
/// Unlike earlier revisions of this crate, the server no longer pre-spawns a
/// fixed pool of worker tasks drained from a shared queue: every accepted
/// connection gets its own [`tokio::spawn`]ed task, so `max_connections` is an
/// admission-control ceiling (enforced with a semaphore) rather than a pool
/// size.
///
/// # Connection admission
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  || TCP_STREAM
///                                  \/
/// [----------------]   Yes   /--------------------\   No   [-------------]
/// [ Spawn a worker ] <====== | Under max_connections? | ===> [ Sending 503 ]
/// [----------------]         \--------------------/        [-------------]
/// ```
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of concurrent active connections being processed (default: `100`).
    ///
    /// Enforced by a `tokio::sync::Semaphore` at the accept loop; connections
    /// beyond this count are queued (up to `max_pending_connections`) rather
    /// than spawned immediately.
    pub max_connections: usize,

    /// Maximum number of TCP connections waiting for a free admission slot (default: `250`).
    ///
    /// If the pending queue becomes full, new connections receive an
    /// immediate HTTP `503` response.
    pub max_pending_connections: usize,

    /// Strategy used while waiting for a free admission slot (default: `Sleep(50μs)`).
    pub wait_strategy: WaitStrategy,

    /// Dedicated tasks for queue-overflow `503` responses (default: `1`).
    ///
    /// Using multiple handlers prevents bottlenecks when a large volume of
    /// connections are rejected at once. Set to `0` to silently close the
    /// connection instead (not recommended for production).
    pub count_503_handlers: usize,

    /// Format for error responses (default: `true`).
    ///
    /// # Examples
    /// If `true`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 55\r
    /// content-type: application/json\r
    /// \r
    /// {"error":"Invalid HTTP method","code":"INVALID_METHOD"}
    /// ```
    /// If `false`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 0\r
    /// \r
    /// ```
    pub json_errors: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 250,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            count_503_handlers: 1,
            json_errors: true,

            _priv: (),
        }
    }
}

impl ServerLimits {
    /// Higher caps and longer timeouts, suited to local development.
    pub fn development() -> Self {
        Self {
            max_connections: 1000,
            max_pending_connections: 2000,
            ..Self::default()
        }
    }

    /// Lower caps, tighter admission control, for adversarial environments.
    pub fn strict() -> Self {
        Self {
            max_connections: 50,
            max_pending_connections: 50,
            count_503_handlers: 2,
            ..Self::default()
        }
    }
}

/// Strategy used while waiting for a free connection-admission slot.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`].
    ///
    /// Keeps the executor hot (near 100% CPU on the waiting task); prefer
    /// `Sleep` unless sub-millisecond admission latency is required.
    Yield,

    /// While waiting, uses [`tokio::time::sleep()`].
    Sleep(Duration),
}

/// Connection-level limits and timeouts.
///
/// Controls individual TCP connection behavior including timeouts,
/// lifetime, and request limits.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum duration to wait for reading data from the socket (default: `2 seconds`).
    ///
    /// If no data is received within this time, the connection is closed.
    /// Primary mechanism for reclaiming stalled/slowloris connections.
    pub socket_read_timeout: Duration,

    /// Maximum duration to wait for writing data to the socket (default: `3 seconds`).
    pub socket_write_timeout: Duration,

    /// Maximum total time allotted to complete one request/response cycle,
    /// from the first byte of the request line to the last byte of the
    /// response (default: `60 seconds`).
    ///
    /// Bounds handler execution time together with parse/write time; a
    /// worker exceeding it closes the connection. There is no cooperative
    /// cancellation of handler code — this is a hard deadline on the cycle,
    /// not a signal delivered to the handler.
    pub request_timeout: Duration,

    /// Maximum number of requests allowed per connection (default: `100`).
    ///
    /// Acts as `maxKeepAliveRequests`; the connection closes once this many
    /// requests have been served on it, even if otherwise healthy.
    pub max_requests_per_connection: usize,

    /// Maximum lifetime of a connection from establishment to closure (default: `2 minutes`).
    pub connection_lifetime: Duration,

    /// Whether `Transfer-Encoding: chunked` request bodies are accepted (default: `true`).
    ///
    /// When `false`, a chunked request is rejected with `BadRequest` as if
    /// the encoding were unrecognized.
    pub enable_chunked_encoding: bool,

    /// Whether HTTP/1.1 keep-alive is offered at all (default: `true`).
    ///
    /// When `false`, every response carries `Connection: close` and the
    /// connection is torn down after one request regardless of
    /// `max_requests_per_connection`.
    pub enable_keep_alive: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(2),
            socket_write_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(60),
            connection_lifetime: Duration::from_secs(120),
            max_requests_per_connection: 100,
            enable_chunked_encoding: true,
            enable_keep_alive: true,

            _priv: (),
        }
    }
}

impl ConnLimits {
    /// Longer timeouts and an effectively unbounded keep-alive cap.
    pub fn development() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(30),
            socket_write_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(300),
            connection_lifetime: Duration::from_secs(3600),
            max_requests_per_connection: usize::MAX,
            ..Self::default()
        }
    }

    /// Short timeouts and a small keep-alive cap.
    pub fn strict() -> Self {
        Self {
            socket_read_timeout: Duration::from_millis(500),
            socket_write_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            connection_lifetime: Duration::from_secs(30),
            max_requests_per_connection: 20,
            ..Self::default()
        }
    }
}

/// HTTP request parsing limits and buffer pre-allocation strategy.
///
/// **SECURITY-FIRST DEFAULTS** — intentionally conservative to prevent
/// resource exhaustion and various parsing attacks.
///
/// # Memory Allocation Strategy
///
/// Each connection's parse buffer grows on demand but is pre-sized to:
///
/// ```text
/// Total Buffer = First Line + (Headers x Header Line) + Body + Overhead
/// ```
///
/// ## Buffer Size Calculation (Default Values)
///
/// | Component | Formula | Size | Purpose |
/// |-----------|---------|------|---------|
/// | First Line | `19 + url_size` | 275 B | `METHOD URL HTTP/1.1\r\n` |
/// | Headers | `header_count x Header Line` | 9,280 B | Headers storage |
/// | Header Line | `header_name_size + header_value_size + 4` | 580 B | `Name: Value\r\n` |
/// | Body | `body_size` | 4,096 B | Request payload |
/// | **Total** | **Sum + 2 bytes CRLF** | **~13.4 KB** | Per-connection buffer |
///
/// # Example
/// ```
/// use spinnerette::limits::ReqLimits;
///
/// let limits = ReqLimits::default();
/// let buffer_size = limits.estimated_buffer_size();
/// println!("Each connection needs {} bytes for data buffer", buffer_size);
/// ```
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum length of the full request line in bytes (default: `8 KiB`).
    ///
    /// Covers `METHOD SP request-target SP HTTP-version CRLF` as a whole,
    /// distinct from `url_size` below (the request-target component alone).
    pub request_line_size: usize,
    /// Maximum URL length in bytes including path and query string (default: `256 B`).
    pub url_size: usize,
    /// Maximum number of path segments in URL (default: `8 segments`).
    pub url_parts: usize,
    /// Maximum query string length (default: `128`).
    pub url_query_size: usize,
    /// Maximum number of query parameters (default: `8`).
    pub url_query_parts: usize,

    /// Maximum number of headers per request (default: `16 headers`).
    pub header_count: usize,
    /// Maximum header name length in bytes (default: `64 B`).
    pub header_name_size: usize,
    /// Maximum header value length in bytes (default: `512 B`).
    pub header_value_size: usize,
    /// Maximum running total of header bytes, including CRLF terminators
    /// (default: `64 KiB`). Enforced independently of `header_count` /
    /// `header_value_size` to cap aggregate header-section size.
    pub total_headers_size: usize,

    /// Maximum request body size in bytes (default: `4 KiB`).
    pub body_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub precalc: ReqLimitsPrecalc,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            request_line_size: 8 * 1024,

            url_size: 256,
            url_parts: 8,
            url_query_size: 128,
            url_query_parts: 8,

            header_count: 16,
            header_name_size: 64,
            header_value_size: 512,
            total_headers_size: 64 * 1024,

            body_size: 4 * 1024,

            precalc: ReqLimitsPrecalc::default(),
        }
    }
}

impl ReqLimits {
    /// Higher caps, suited to local development against larger payloads.
    pub fn development() -> Self {
        Self {
            request_line_size: 16 * 1024,
            url_size: 4 * 1024,
            header_count: 64,
            header_value_size: 8 * 1024,
            total_headers_size: 256 * 1024,
            body_size: 10 * 1024 * 1024,
            ..Self::default()
        }
    }

    /// Lower caps, for adversarial or resource-constrained environments.
    pub fn strict() -> Self {
        Self {
            request_line_size: 2 * 1024,
            url_size: 128,
            header_count: 8,
            header_value_size: 256,
            total_headers_size: 8 * 1024,
            body_size: 1024,
            ..Self::default()
        }
    }

    /// Returns the estimated memory buffer size required per connection.
    #[inline(always)]
    pub fn estimated_buffer_size(self) -> usize {
        self.precalculate().precalc.buffer
    }

    #[inline(always)]
    pub(crate) fn precalculate(mut self) -> Self {
        self.precalc.first_line = self.first_line();
        self.precalc.h_line = self.h_line();
        self.precalc.buffer = self.buffer();
        self.precalc.req_without_body = self.precalc.buffer - self.body_size;

        self
    }

    #[inline(always)]
    fn buffer(&self) -> usize {
        self.precalc.first_line + self.header_count * self.precalc.h_line + 2 + self.body_size
    }

    #[inline(always)]
    fn first_line(&self) -> usize {
        19 + self.url_size
    }

    #[inline(always)]
    fn h_line(&self) -> usize {
        self.header_name_size + self.header_value_size + 4
    }
}

#[doc(hidden)]
#[derive(Debug, Clone, Default)]
pub struct ReqLimitsPrecalc {
    pub(crate) buffer: usize,
    pub(crate) first_line: usize,
    #[allow(dead_code)]
    pub(crate) req_without_body: usize,
    pub(crate) h_line: usize,
}

/// Configuration for response processing and memory allocation limits.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial buffer capacity allocated for responses (default: `1024 B`).
    pub default_capacity: usize,
    /// Maximum allowed buffer capacity retained between responses (default: `8192 B`).
    pub max_capacity: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 8 * 1024,

            _priv: (),
        }
    }
}

/// Limits enforced by the multipart/form-data parser (buffered and streaming).
#[derive(Debug, Clone)]
pub struct MultipartLimits {
    /// Maximum size of the whole multipart body, in bytes (default: `10 MiB`).
    pub max_multipart_size: u64,
    /// Maximum size of a single file part, in bytes (default: `8 MiB`).
    pub max_file_size: u64,
    /// Maximum number of file parts (default: `16`).
    pub max_file_count: usize,
    /// Optional allow-list of accepted `Content-Type` values for file parts;
    /// `None` means any content type is accepted (default: `None`).
    pub allowed_content_types: Option<Vec<String>>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for MultipartLimits {
    fn default() -> Self {
        Self {
            max_multipart_size: 10 * 1024 * 1024,
            max_file_size: 8 * 1024 * 1024,
            max_file_count: 16,
            allowed_content_types: None,

            _priv: (),
        }
    }
}

/// Limits enforced by the WebSocket runtime.
#[derive(Debug, Clone)]
pub struct WebSocketLimits {
    /// Maximum payload size of a single frame, in bytes (default: `64 KiB`).
    pub max_frame_size: u64,
    /// Maximum size of a reassembled fragmented message, in bytes (default: `4 MiB`).
    pub max_message_size: u64,
    /// Time allowed to complete the upgrade handshake (default: `5 seconds`).
    pub handshake_timeout: Duration,
    /// Time to wait for the peer's Close frame once we have sent ours
    /// (default: `3 seconds`); after this the socket is closed unilaterally.
    pub close_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for WebSocketLimits {
    fn default() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            max_message_size: 4 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(3),

            _priv: (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precalculate_matches_manual_formula() {
        let limits = ReqLimits::default().precalculate();
        let h_line = limits.header_name_size + limits.header_value_size + 4;
        let first_line = 19 + limits.url_size;
        let expected = first_line + limits.header_count * h_line + 2 + limits.body_size;

        assert_eq!(limits.precalc.buffer, expected);
        assert_eq!(limits.precalc.req_without_body, expected - limits.body_size);
    }

    #[test]
    fn strict_preset_is_tighter_than_default() {
        let default = ReqLimits::default();
        let strict = ReqLimits::strict();

        assert!(strict.body_size < default.body_size);
        assert!(strict.header_count < default.header_count);
    }

    #[test]
    fn development_preset_is_looser_than_default() {
        let default = ConnLimits::default();
        let development = ConnLimits::development();

        assert!(development.socket_read_timeout > default.socket_read_timeout);
        assert!(development.max_requests_per_connection >= default.max_requests_per_connection);
    }
}
