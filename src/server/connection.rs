use crate::{
    errors::ErrorKind,
    http::{
        request::{self, Parser},
        response::Response,
        types::Version,
    },
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits, WebSocketLimits},
    server::server_impl::{AllLimits, Handler},
    ws::connection::WsHandler,
};
use std::{io, sync::Arc, time::Instant};
use tokio::{io::AsyncWriteExt, net::TcpStream, time::sleep};

pub(crate) struct HttpConnection<H: Handler<S>, S: ConnectionData> {
    handler: Arc<H>,
    ws_handler: Option<Arc<dyn WsHandler<S>>>,
    connection_data: S,

    connection: Connection,
    pub(crate) parser: Parser,
    pub(crate) response: Response,

    pub(crate) server_limits: ServerLimits,
    pub(crate) conn_limits: ConnLimits,
    pub(crate) req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,
    pub(crate) ws_limits: WebSocketLimits,
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    pub(crate) fn new(
        handler: Arc<H>,
        ws_handler: Option<Arc<dyn WsHandler<S>>>,
        limits: AllLimits,
    ) -> Self {
        Self {
            handler,
            ws_handler,
            connection_data: S::new(),

            connection: Connection::new(),
            parser: Parser::new(&limits.2),
            response: Response::new(&limits.3),

            server_limits: limits.0,
            conn_limits: limits.1,
            req_limits: limits.2,
            resp_limits: limits.3,
            ws_limits: limits.4,
        }
    }

    #[inline]
    fn reset_request_response(&mut self) {
        // The parser is deliberately left alone: a pipelined next request
        // may already be sitting past the one `serve_one` just consumed,
        // and `Parser::advance` has already shifted it to the front of the
        // buffer. Discarding it here would turn that valid request into
        // 400s or a hung read.
        self.response.reset(&self.resp_limits);
    }
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    pub(crate) async fn run(&mut self, stream: &mut TcpStream) -> Result<(), io::Error> {
        match self.impl_run(stream).await {
            Ok(()) => Ok(()),
            Err(ErrorKind::Io(e)) => Err(e.0),
            Err(error) => {
                self.conn_limits
                    .send_error(
                        stream,
                        error,
                        self.response.version,
                        self.server_limits.json_errors,
                    )
                    .await
            }
        }
    }

    #[inline]
    pub(crate) async fn impl_run(&mut self, stream: &mut TcpStream) -> Result<(), ErrorKind> {
        self.connection.reset();
        self.connection_data.reset();

        while !self.is_expired() {
            self.reset_request_response();

            match tokio::time::timeout(
                self.conn_limits.request_timeout,
                self.serve_one(stream),
            )
            .await
            {
                Ok(Ok(Loop::Continue)) => {}
                Ok(Ok(Loop::Close)) => break,
                Ok(Ok(Loop::Upgraded)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ErrorKind::RequestTimeout),
            }
        }

        Ok(())
    }

    /// Reads (as much as needed, possibly nothing if a pipelined request
    /// is already buffered), parses, dispatches and writes exactly one
    /// request/response pair (or performs a WebSocket handoff). Wrapped in
    /// the per-request timeout by the caller.
    async fn serve_one(&mut self, stream: &mut TcpStream) -> Result<Loop, ErrorKind> {
        if self.fill_until_headers_complete(stream).await? == 0 {
            return Ok(Loop::Close);
        }

        // `None` means not chunked: the slice handed to `parse` tracks the
        // buffer's current length so a `Content-Length` body that keeps
        // arriving across several reads is picked up on each retry. A
        // dechunked request instead gets a fixed boundary up front —
        // `dechunk_until_complete` already guarantees the whole body is
        // present, so `parse` can never report it incomplete.
        let chunked_parse_len = match request::detect_chunked(self.parser.bytes()) {
            Some(_) if !self.conn_limits.enable_chunked_encoding => return Err(ErrorKind::InvalidChunk),
            Some(body_start) => Some(self.dechunk_until_complete(stream, body_start).await?),
            None => None,
        };

        let parsed = loop {
            let buf = match chunked_parse_len {
                Some(len) => &self.parser.bytes()[..len],
                None => self.parser.bytes(),
            };

            match request::parse(buf, &self.req_limits) {
                Ok(parsed) => break parsed,
                Err(ErrorKind::Incomplete) => {
                    if self.top_up(stream).await? == 0 {
                        return Err(ErrorKind::Incomplete);
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let request::Parsed {
            request,
            consumed,
            keep_alive,
            version,
        } = parsed;

        self.response.version = version;
        self.response.keep_alive = self.conn_limits.enable_keep_alive && keep_alive;

        if request.is_websocket_upgrade() {
            let Some(ws_handler) = self.ws_handler.clone() else {
                return Err(ErrorKind::WebSocket(crate::ws::codec::Error::InvalidOpcode));
            };

            crate::ws::connection::upgrade(
                stream,
                &request,
                ws_handler,
                &mut self.connection_data,
                &self.ws_limits,
                self.conn_limits.socket_write_timeout,
            )
            .await?;

            return Ok(Loop::Upgraded);
        }

        let future = self
            .handler
            .handle(&mut self.connection_data, &request, &mut self.response);

        if catch_unwind_poll(future).await.is_err() {
            return Err(ErrorKind::HandlerFailure);
        }

        self.write_response(stream).await?;
        self.parser.advance(consumed);

        self.connection.request_count += 1;
        if !self.response.keep_alive {
            return Ok(Loop::Close);
        }

        Ok(Loop::Continue)
    }

    /// Tops up the buffer until it holds a full header section (request
    /// line through the blank line that ends it) or the connection closes.
    /// Returns the number of bytes buffered, `0` meaning the peer closed
    /// without sending anything (the very first read of the connection).
    async fn fill_until_headers_complete(&mut self, stream: &mut TcpStream) -> Result<usize, ErrorKind> {
        loop {
            if request::headers_complete(self.parser.bytes()) {
                return Ok(self.parser.len());
            }
            if self.parser.len() == 0 {
                if self.top_up(stream).await? == 0 {
                    return Ok(0);
                }
                continue;
            }
            if self.parser.is_full() {
                return Err(ErrorKind::TooManyHeaders);
            }
            if self.top_up(stream).await? == 0 {
                return Err(ErrorKind::InvalidHeader);
            }
        }
    }

    /// Retries [`Parser::dechunk`] until the whole chunked body has
    /// arrived, reading more off `stream` each time it reports incomplete.
    async fn dechunk_until_complete(&mut self, stream: &mut TcpStream, body_start: usize) -> Result<usize, ErrorKind> {
        loop {
            match self.parser.dechunk(body_start, self.req_limits.body_size) {
                Ok(parse_len) => return Ok(parse_len),
                Err(ErrorKind::Incomplete) => {
                    if self.top_up(stream).await? == 0 {
                        return Err(ErrorKind::InvalidChunk);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[inline]
    async fn top_up(&mut self, stream: &mut TcpStream) -> Result<usize, ErrorKind> {
        self.parser
            .fill_more(
                stream,
                self.conn_limits.socket_read_timeout,
                self.req_limits.precalc.buffer,
            )
            .await
            .map_err(ErrorKind::from)
    }

    async fn write_response(&mut self, stream: &mut TcpStream) -> Result<(), ErrorKind> {
        self.conn_limits
            .write_bytes(stream, self.response.buffer())
            .await?;

        match self.response.take_body_kind() {
            crate::http::response::BodyKind::Buffered => {}
            crate::http::response::BodyKind::File(path) => {
                self.write_file_body(stream, &path).await?;
            }
            crate::http::response::BodyKind::Stream(mut chunks) => {
                while let Some(chunk) = chunks.recv().await {
                    let chunk = chunk?;
                    self.write_chunk(stream, &chunk).await?;
                }
                self.write_chunk(stream, &[]).await?;
            }
        }

        Ok(())
    }

    async fn write_file_body(&self, stream: &mut TcpStream, path: &std::path::Path) -> Result<(), ErrorKind> {
        use tokio::io::AsyncReadExt;

        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.write_chunk(stream, &buf[..n]).await?;
        }

        self.write_chunk(stream, &[]).await
    }

    async fn write_chunk(&self, stream: &mut TcpStream, chunk: &[u8]) -> Result<(), ErrorKind> {
        let mut framed = Vec::with_capacity(chunk.len() + 8);
        framed.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        framed.extend_from_slice(chunk);
        framed.extend_from_slice(b"\r\n");

        self.conn_limits.write_bytes(stream, &framed).await?;
        Ok(())
    }
}

/// Drives `fut` to completion, catching a panic from any single `poll` call.
///
/// A handler can't be `tokio::spawn`ed here: its `Request<'_>` borrows from
/// `self.parser`'s buffer and spawning requires `'static`. Polling in place
/// with `catch_unwind` around each poll gets the same "don't take the whole
/// connection down" guarantee without detaching the task.
async fn catch_unwind_poll<F: std::future::Future>(fut: F) -> Result<F::Output, ()> {
    let mut fut = std::pin::pin!(fut);

    std::future::poll_fn(|cx| {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| fut.as_mut().poll(cx))) {
            Ok(poll) => poll.map(Ok),
            Err(_) => std::task::Poll::Ready(Err(())),
        }
    })
    .await
}

enum Loop {
    Continue,
    Close,
    Upgraded,
}

impl ConnLimits {
    #[inline]
    pub(crate) async fn send_error(
        &self,
        stream: &mut TcpStream,
        error: ErrorKind,
        version: Version,
        json_errors: bool,
    ) -> Result<(), io::Error> {
        self.write_bytes(stream, error.as_http(version, json_errors))
            .await
    }

    #[inline]
    pub(crate) async fn write_bytes(
        &self,
        stream: &mut TcpStream,
        response: &[u8],
    ) -> Result<(), io::Error> {
        tokio::select! {
            biased;

            result = stream.write_all(response) => result,
            _ = sleep(self.socket_write_timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))
            },
        }
    }
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    fn is_expired(&self) -> bool {
        !self.response.keep_alive
            || self.connection.request_count >= self.conn_limits.max_requests_per_connection
            || self.connection.created.elapsed() > self.conn_limits.connection_lifetime
    }
}

#[derive(Debug)]
pub(crate) struct Connection {
    created: Instant,
    request_count: usize,
}

impl Connection {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            created: Instant::now(),
            request_count: 0,
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.created = Instant::now();
        self.request_count = 0;
    }
}

//

/// Managing user session data stored between requests within a single HTTP connection.
///
/// This trait allows you to store arbitrary state (e.g., authentication data,
/// multistep form status, cache, etc.). The state is available across all requests
/// within a single HTTP keep-alive connection.
///
/// # Examples
/// ```no_run
/// use spinnerette::ConnectionData;
/// use std::collections::HashMap;
///
/// struct MyConnectionData {
///     user_id: Option<i32>,
///     request_count: usize,
///     cache: HashMap<usize, [u8; 4]>,
/// }
///
/// impl ConnectionData for MyConnectionData {
///     fn new() -> Self {
///         Self {
///             user_id: None,
///             request_count: 0,
///             cache: HashMap::new(),
///         }
///     }
///
///     fn reset(&mut self) {
///         self.user_id = None;
///         self.request_count = 0;
///         self.cache.clear(); // Saving the allocated memory
///     }
/// }
/// ```
pub trait ConnectionData: Sync + Send + 'static {
    /// Creates a new instance of user data.
    ///
    /// It is called once at server startup, which avoids runtime allocations.
    fn new() -> Self;

    /// Resets the internal state of the instance to its initial values.
    ///
    /// It is called after the connection is closed. Allows repeated
    /// use of the instance for the following connections. If implemented
    /// correctly, avoids any allocations.
    fn reset(&mut self);
}

impl ConnectionData for () {
    #[inline(always)]
    fn new() -> Self {}

    #[inline(always)]
    fn reset(&mut self) {}
}

#[cfg(test)]
mod def_handler {
    use super::*;
    use crate::{Handled, StatusCode};

    pub(crate) struct DefHandler;

    impl Handler<()> for DefHandler {
        async fn handle(&self, _: &mut (), _: &crate::Request<'_>, r: &mut Response) -> Handled {
            r.status(StatusCode::Ok).body("test")
        }
    }

    impl HttpConnection<DefHandler, ()> {
        #[inline]
        pub(crate) fn from_req<V: AsRef<[u8]>>(value: V) -> Self {
            let req_limits = ReqLimits::default().precalculate();
            let resp_limits = RespLimits::default();

            Self {
                handler: Arc::new(DefHandler),
                ws_handler: None,
                connection_data: (),

                connection: Connection::new(),
                parser: Parser::from(&req_limits, value),
                response: Response::new(&resp_limits),

                server_limits: ServerLimits::default(),
                conn_limits: ConnLimits::default(),
                req_limits,
                resp_limits,
                ws_limits: WebSocketLimits::default(),
            }
        }
    }

    #[tokio::test]
    async fn parses_and_responds_in_one_pass() {
        let mut conn = HttpConnection::<DefHandler, ()>::from_req(
            "GET / HTTP/1.1\r\nConnection: close\r\n\r\n",
        );

        let parsed = request::parse(conn.parser.bytes(), &conn.req_limits).unwrap();
        conn.response.version = parsed.version;
        conn.response.keep_alive = parsed.keep_alive;

        conn.handler
            .handle(&mut conn.connection_data, &parsed.request, &mut conn.response)
            .await;

        assert!(conn.response.buffer().starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(!conn.response.keep_alive);
    }

    #[tokio::test]
    async fn pipelined_requests_in_one_write_both_get_responses() {
        use tokio::{
            io::AsyncReadExt,
            net::{TcpListener, TcpStream},
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut conn = HttpConnection::<DefHandler, ()>::from_req("");
            conn.run(&mut stream).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        server.await.unwrap();

        let responses = received.windows(15).filter(|w| *w == b"HTTP/1.1 200 OK").count();
        assert_eq!(responses, 2, "expected two responses in {received:?}");
    }

    #[tokio::test]
    async fn content_length_body_split_across_reads_is_reassembled() {
        use tokio::{
            io::AsyncReadExt,
            net::{TcpListener, TcpStream},
            time::{sleep, Duration},
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut conn = HttpConnection::<DefHandler, ()>::from_req("");
            conn.run(&mut stream).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"POST / HTTP/1.1\r\nConnection: close\r\nContent-Length: 10\r\n\r\nhel")
            .await
            .unwrap();
        sleep(Duration::from_millis(20)).await;
        client.write_all(b"lo world").await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        server.await.unwrap();

        assert!(received.starts_with(b"HTTP/1.1 200 OK\r\n"));
    }
}
