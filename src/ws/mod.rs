//! WebSocket upgrade handshake, frame codec, and post-upgrade runtime.

pub(crate) mod codec;
pub(crate) mod handshake;
pub mod connection;
