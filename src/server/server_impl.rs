use crate::{
    errors::ErrorKind,
    http::{
        request::Request,
        response::{Handled, Response},
    },
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits, WebSocketLimits},
    server::connection::{ConnectionData, HttpConnection},
    ws::connection::WsHandler,
    Version,
};
use std::{future::Future, marker::PhantomData, sync::Arc};
use tokio::{net::TcpListener, sync::Semaphore};

/// A trait for handling HTTP requests and generating responses.
///
/// You can use:
/// - `&self` for shared immutable data (e.g. database connection pool, router configuration)
/// - `&mut S` for connection-specific mutable state (e.g. authentication tokens, session data)
///
/// # Examples
///
/// Basic Request Handler
/// ```
/// use spinnerette::{Handler, Request, Response, Handled, StatusCode};
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, _: &mut (), req: &Request<'_>, resp: &mut Response) -> Handled {
///         if req.url().target() == b"/echo" {
///             resp.status(StatusCode::Ok).body("Echo response")
///         } else {
///             resp.status(StatusCode::NotFound).body("Not found :(")
///         }
///     }
/// }
/// ```
/// Handler with [`ConnectionData`]
/// ```
/// use spinnerette::{Handler, ConnectionData, Request, Response, Handled, StatusCode};
///
/// struct CountingHandler;
///
/// impl Handler<State> for CountingHandler {
///     async fn handle(&self, data: &mut State, req: &Request<'_>, resp: &mut Response) -> Handled {
///         data.request_count += 1;
///
///         resp.status(StatusCode::Ok)
///             .body(format!("Request #{}", data.request_count))
///     }
/// }
///
/// struct State {
///     request_count: usize,
/// }
///
/// impl ConnectionData for State {
///     fn new() -> Self {
///         Self { request_count: 0 }
///     }
///
///     fn reset(&mut self) {
///         self.request_count = 0;
///     }
/// }
/// ```
pub trait Handler<S = ()>
where
    Self: Sync + Send + 'static,
    S: ConnectionData,
{
    /// Processes an HTTP request and generates a response.
    ///
    /// # Parameters
    ///
    /// - `connection_data`: Mutable reference to connection-specific state
    /// - `request`: Immutable reference to the parsed HTTP request
    /// - `response`: Mutable response builder for constructing the response
    ///
    /// # Errors
    ///
    /// Implementations should handle errors internally and set appropriate
    /// HTTP status codes on the response. A panic is caught and turned into
    /// a 500 response without taking the connection down.
    fn handle(
        &self,
        connection_data: &mut S,
        request: &Request<'_>,
        response: &mut Response,
    ) -> impl Future<Output = Handled> + Send;
}

/// An HTTP server that accepts connections and dispatches requests to a
/// [`Handler`], admitting at most `max_connections` concurrently-running
/// connections at a time.
///
/// # Examples
///
/// ```no_run
/// use spinnerette::{Server, Handler, Request, Response, Handled, StatusCode};
/// use tokio::net::TcpListener;
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, _: &mut (), _: &Request<'_>, resp: &mut Response) -> Handled {
///         resp.status(StatusCode::Ok).body("Hello world!")
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .handler(MyHandler)
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Server<H: Handler<S>, S: ConnectionData = ()> {
    listener: TcpListener,
    handler: Arc<H>,
    ws_handler: Option<Arc<dyn WsHandler<S>>>,
    limits: AllLimits,
}

impl<H: Handler<S>, S: ConnectionData> Server<H, S> {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder<H, S> {
        ServerBuilder {
            listener: None,
            handler: None,
            ws_handler: None,
            _marker: PhantomData,

            server_limits: None,
            request_limits: None,
            response_limits: None,
            connection_limits: None,
            websocket_limits: None,
        }
    }

    /// Starts the server and begins accepting incoming connections.
    ///
    /// Every accepted connection is driven to completion on its own
    /// `tokio::spawn`ed task. A semaphore sized by
    /// [`ServerLimits::max_connections`](crate::limits::ServerLimits::max_connections)
    /// admits new connections; once saturated, the accept loop either
    /// answers the next connection with `503 Service Unavailable` (when
    /// [`count_503_handlers`](crate::limits::ServerLimits::count_503_handlers)
    /// is nonzero) or drops it silently.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # spinnerette::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use spinnerette::Server;
    /// use tokio::net::TcpListener;
    ///
    /// Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct)
    ///     .build()
    ///     .launch()
    ///     .await
    /// # }
    /// ```
    pub async fn launch(self) {
        let semaphore = Arc::new(Semaphore::new(self.limits.0.max_connections));
        let send_503 = self.limits.0.count_503_handlers != 0;

        loop {
            let Ok((mut stream, _addr)) = self.listener.accept().await else {
                continue;
            };

            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) if send_503 => {
                    let limits = self.limits.1.clone();
                    let json_errors = self.limits.0.json_errors;
                    tokio::spawn(async move {
                        let _ = limits
                            .send_error(&mut stream, ErrorKind::ServiceUnavailable, Version::Http11, json_errors)
                            .await;
                    });
                    continue;
                }
                Err(_) => {
                    drop(stream);
                    continue;
                }
            };

            let handler = self.handler.clone();
            let ws_handler = self.ws_handler.clone();
            let limits = self.limits.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let mut conn = HttpConnection::new(handler, ws_handler, limits);
                let _ = conn.run(&mut stream).await;
            });
        }
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder<H, S = ()>
where
    H: Handler<S>,
    S: ConnectionData,
{
    listener: Option<TcpListener>,
    handler: Option<Arc<H>>,
    ws_handler: Option<Arc<dyn WsHandler<S>>>,
    _marker: PhantomData<S>,

    server_limits: Option<ServerLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    connection_limits: Option<ConnLimits>,
    websocket_limits: Option<WebSocketLimits>,
}

impl<H, S> ServerBuilder<H, S>
where
    H: Handler<S>,
    S: ConnectionData,
{
    /// Sets the TCP listener that the server will use to accept connections.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the request handler that will process incoming requests.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Installs a handler for upgraded WebSocket connections.
    ///
    /// Omitting this call makes the server reject upgrade requests with a
    /// protocol error; any WebSocket-handshake request arriving when no
    /// handler is configured never reaches [`Handler::handle`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # spinnerette::impt_default_handler!{ MyStruct }
    /// use spinnerette::ws::connection::{WsHandler, WebSocketConnection, Message};
    /// use spinnerette::Server;
    /// use tokio::net::TcpListener;
    ///
    /// struct Echo;
    /// impl WsHandler for Echo {
    ///     fn on_message(&self, _: &mut (), conn: &WebSocketConnection, message: Message) {
    ///         match message {
    ///             Message::Text(text) => conn.send_text(text),
    ///             Message::Binary(data) => conn.send_binary(data),
    ///         }
    ///     }
    /// }
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct)
    ///     .ws_handler(Echo)
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn ws_handler<W: WsHandler<S>>(mut self, handler: W) -> Self {
        self.ws_handler = Some(Arc::new(handler));
        self
    }

    /// Configures server-wide admission limits (connection concurrency cap,
    /// pending-queue size, wait strategy).
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures per-connection limits (timeouts, keep-alive behavior).
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request parsing and processing limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures response processing limits.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Configures WebSocket frame/message size limits and handshake timeouts.
    #[inline(always)]
    pub fn websocket_limits(mut self, limits: WebSocketLimits) -> Self {
        self.websocket_limits = Some(limits);
        self
    }

    /// Finalizes the builder and constructs a [`Server`] instance.
    ///
    /// # Panics
    ///
    /// Panics when the `listener` or `handler` method was not called.
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server<H, S> {
        let (listener, handler, ws_handler, limits) = self.get_all_parts();

        Server {
            listener,
            handler,
            ws_handler,
            limits,
        }
    }

    #[inline]
    #[track_caller]
    fn get_all_parts(self) -> (TcpListener, Arc<H>, Option<Arc<dyn WsHandler<S>>>, AllLimits) {
        (
            self.listener
                .expect("The `listener` method must be called to create"),
            self.handler
                .expect("The `handler` method must be called to create"),
            self.ws_handler,
            (
                self.server_limits.unwrap_or_default(),
                self.connection_limits.unwrap_or_default(),
                self.request_limits.unwrap_or_default().precalculate(),
                self.response_limits.unwrap_or_default(),
                self.websocket_limits.unwrap_or_default(),
            ),
        )
    }
}

pub(crate) type AllLimits = (ServerLimits, ConnLimits, ReqLimits, RespLimits, WebSocketLimits);
