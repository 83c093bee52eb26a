//! Post-handshake WebSocket runtime: upgrade response, the read/dispatch
//! loop, and the handle given to application handlers for sending frames.

use crate::{
    errors::ErrorKind,
    http::request::Request,
    limits::WebSocketLimits,
    server::connection::ConnectionData,
    ws::{
        codec::{self, Frame, Opcode},
        handshake,
    },
};
use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// A decoded, reassembled application message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

/// Callbacks invoked over the lifetime of one upgraded connection.
///
/// Kept synchronous (rather than async-fn-in-trait) so it stays object-safe
/// and can be stored as `Arc<dyn WsHandler<S>>` on the connection.
pub trait WsHandler<S: ConnectionData = ()>: Send + Sync + 'static {
    fn on_open(&self, _connection_data: &mut S, _conn: &WebSocketConnection) {}

    fn on_message(&self, connection_data: &mut S, conn: &WebSocketConnection, message: Message);

    fn on_close(&self, _connection_data: &mut S) {}
}

/// Handle given to a [`WsHandler`] for sending frames back to the peer.
///
/// Sends just enqueue onto a channel drained by a single writer loop, so
/// callers never need to hold a write lock across an await point.
#[derive(Clone)]
pub struct WebSocketConnection {
    outbox: mpsc::UnboundedSender<Frame>,
    state: Arc<AtomicU8>,
}

impl WebSocketConnection {
    fn enqueue(&self, fin: bool, opcode: Opcode, payload: Vec<u8>) {
        let _ = self.outbox.send(Frame { fin, opcode, payload });
    }

    pub fn send_text<T: Into<String>>(&self, text: T) {
        self.enqueue(true, Opcode::Text, text.into().into_bytes());
    }

    pub fn send_binary<B: Into<Vec<u8>>>(&self, data: B) {
        self.enqueue(true, Opcode::Binary, data.into());
    }

    pub fn send_ping(&self, payload: Vec<u8>) {
        self.enqueue(true, Opcode::Ping, payload);
    }

    pub fn send_pong(&self, payload: Vec<u8>) {
        self.enqueue(true, Opcode::Pong, payload);
    }

    /// Still open, no close handshake in progress.
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    /// A close frame has gone out (ours or an echo of the peer's) and the
    /// socket hasn't been torn down yet.
    pub fn is_closing(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSING
    }

    /// The connection loop has returned and the TCP socket is shut down.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    /// Starts the close handshake: sends a Close frame carrying `status_code`
    /// and `reason`, then the connection loop waits for the peer's Close
    /// reply (bounded by `close_timeout`) before shutting the socket down.
    /// `status_code` is clamped to 1000 (Normal Closure) if outside the
    /// 1000-1015 range of codes defined for use over the wire.
    pub fn close(&self, status_code: u16, reason: &str) {
        if self.state.swap(CLOSING, Ordering::AcqRel) != OPEN {
            return;
        }

        let status_code = if (1000..=1015).contains(&status_code) { status_code } else { 1000 };
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&status_code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        self.enqueue(true, Opcode::Close, payload);
    }
}

/// Writes the `101 Switching Protocols` response and runs the connection
/// until the peer closes it or sends an invalid frame.
pub(crate) async fn upgrade<S: ConnectionData>(
    stream: &mut TcpStream,
    request: &Request<'_>,
    handler: Arc<dyn WsHandler<S>>,
    connection_data: &mut S,
    limits: &WebSocketLimits,
    write_timeout: Duration,
) -> Result<(), ErrorKind> {
    let key = handshake::validate(request).map_err(ErrorKind::WebSocket)?;
    let accept = handshake::accept_token(key);

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );

    timeout(limits.handshake_timeout, stream.write_all(response.as_bytes()))
        .await
        .map_err(|_| ErrorKind::SocketTimeout)??;

    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
    let conn = WebSocketConnection { outbox: outbox_tx, state: Arc::new(AtomicU8::new(OPEN)) };

    handler.on_open(connection_data, &conn);

    let mut fragments: Vec<u8> = Vec::new();
    let mut fragment_opcode: Option<Opcode> = None;
    let mut write_buf = Vec::new();

    let result = loop {
        tokio::select! {
            biased;

            frame = codec::read_frame(stream, limits.max_frame_size) => {
                match frame {
                    Ok(frame) => {
                        match dispatch(
                            frame,
                            &mut fragments,
                            &mut fragment_opcode,
                            limits,
                            &handler,
                            connection_data,
                            &conn,
                        ) {
                            Ok(true) => {}
                            Ok(false) => {
                                if let Some(reply) = outbox_rx.recv().await {
                                    write_buf.clear();
                                    codec::encode_frame(reply.fin, reply.opcode, &reply.payload, &mut write_buf);
                                    let _ = timeout(write_timeout, stream.write_all(&write_buf)).await;
                                }
                                break Ok(());
                            }
                            Err(e) => break Err(e),
                        }
                    }
                    Err(e) => break Err(ErrorKind::WebSocket(e)),
                }
            }

            outgoing = outbox_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        write_buf.clear();
                        codec::encode_frame(frame.fin, frame.opcode, &frame.payload, &mut write_buf);

                        if timeout(write_timeout, stream.write_all(&write_buf)).await.is_err() {
                            break Err(ErrorKind::SocketTimeout);
                        }

                        if frame.opcode == Opcode::Close {
                            let _ = timeout(
                                limits.close_timeout,
                                codec::read_frame(stream, limits.max_frame_size),
                            )
                            .await;
                            break Ok(());
                        }
                    }
                    None => break Ok(()),
                }
            }
        }
    };

    conn.state.store(CLOSED, Ordering::Release);
    handler.on_close(connection_data);
    let _ = stream.shutdown().await;

    result
}

/// Handles one decoded frame. Returns `Ok(true)` to keep looping, `Ok(false)`
/// on a clean close handshake.
fn dispatch<S: ConnectionData>(
    frame: Frame,
    fragments: &mut Vec<u8>,
    fragment_opcode: &mut Option<Opcode>,
    limits: &WebSocketLimits,
    handler: &Arc<dyn WsHandler<S>>,
    connection_data: &mut S,
    conn: &WebSocketConnection,
) -> Result<bool, ErrorKind> {
    match frame.opcode {
        Opcode::Close => {
            conn.state.store(CLOSING, Ordering::Release);
            conn.enqueue(true, Opcode::Close, frame.payload);
            Ok(false)
        }
        Opcode::Ping => {
            conn.enqueue(true, Opcode::Pong, frame.payload);
            Ok(true)
        }
        Opcode::Pong => Ok(true),
        Opcode::Text | Opcode::Binary => {
            if frame.fin {
                if fragment_opcode.is_some() {
                    return Err(ErrorKind::WebSocket(codec::Error::UnexpectedContinuation));
                }
                deliver(frame.opcode, frame.payload, handler, connection_data, conn)?;
            } else {
                if fragment_opcode.is_some() {
                    return Err(ErrorKind::WebSocket(codec::Error::UnexpectedContinuation));
                }
                *fragment_opcode = Some(frame.opcode);
                fragments.clear();
                push_fragment(fragments, &frame.payload, limits)?;
            }
            Ok(true)
        }
        Opcode::Continuation => {
            let Some(opcode) = *fragment_opcode else {
                return Err(ErrorKind::WebSocket(codec::Error::UnexpectedContinuation));
            };

            push_fragment(fragments, &frame.payload, limits)?;

            if frame.fin {
                *fragment_opcode = None;
                let payload = std::mem::take(fragments);
                deliver(opcode, payload, handler, connection_data, conn)?;
            }
            Ok(true)
        }
    }
}

fn push_fragment(fragments: &mut Vec<u8>, chunk: &[u8], limits: &WebSocketLimits) -> Result<(), ErrorKind> {
    if fragments.len() as u64 + chunk.len() as u64 > limits.max_message_size {
        return Err(ErrorKind::WebSocket(codec::Error::MessageTooLarge));
    }
    fragments.extend_from_slice(chunk);
    Ok(())
}

fn deliver<S: ConnectionData>(
    opcode: Opcode,
    payload: Vec<u8>,
    handler: &Arc<dyn WsHandler<S>>,
    connection_data: &mut S,
    conn: &WebSocketConnection,
) -> Result<(), ErrorKind> {
    let message = match opcode {
        Opcode::Text => {
            let text = simdutf8::basic::from_utf8(&payload)
                .map_err(|_| ErrorKind::WebSocket(codec::Error::InvalidOpcode))?
                .to_owned();
            Message::Text(text)
        }
        Opcode::Binary => Message::Binary(payload),
        _ => unreachable!("deliver only called for Text/Binary"),
    };

    handler.on_message(connection_data, conn, message);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    impl WsHandler<()> for Echo {
        fn on_message(&self, _: &mut (), conn: &WebSocketConnection, message: Message) {
            match message {
                Message::Text(text) => conn.send_text(text),
                Message::Binary(data) => conn.send_binary(data),
            }
        }
    }

    fn test_conn() -> (WebSocketConnection, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WebSocketConnection { outbox: tx, state: Arc::new(AtomicU8::new(OPEN)) }, rx)
    }

    #[test]
    fn send_text_enqueues_a_fin_text_frame() {
        let (conn, mut rx) = test_conn();
        conn.send_text("hi");

        let frame = rx.try_recv().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"hi");
    }

    #[test]
    fn echo_handler_relays_incoming_text() {
        let (conn, mut rx) = test_conn();
        let handler = Echo;
        handler.on_message(&mut (), &conn, Message::Text("ping".into()));

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.payload, b"ping");
    }

    #[test]
    fn fresh_connection_is_open() {
        let (conn, _rx) = test_conn();
        assert!(conn.is_open());
        assert!(!conn.is_closing());
        assert!(!conn.is_closed());
    }

    #[test]
    fn close_transitions_to_closing_and_encodes_status_and_reason() {
        let (conn, mut rx) = test_conn();
        conn.close(1001, "going away");

        assert!(conn.is_closing());
        assert!(!conn.is_open());

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.opcode, Opcode::Close);
        assert_eq!(&frame.payload[..2], &1001u16.to_be_bytes());
        assert_eq!(&frame.payload[2..], b"going away");
    }

    #[test]
    fn close_with_out_of_range_status_falls_back_to_normal_closure() {
        let (conn, mut rx) = test_conn();
        conn.close(4000, "app code");

        let frame = rx.try_recv().unwrap();
        assert_eq!(&frame.payload[..2], &1000u16.to_be_bytes());
    }

    #[test]
    fn closing_twice_only_sends_one_close_frame() {
        let (conn, mut rx) = test_conn();
        conn.close(1000, "bye");
        conn.close(1000, "bye again");

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
