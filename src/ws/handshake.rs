//! Upgrade-request validation and accept-token computation.

use crate::{http::request::Request, ws::codec::Error};
use base64::Engine;
use sha1::{Digest, Sha1};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Validates the headers of an upgrade request per RFC 6455 section 4.2.1,
/// returning the raw `Sec-WebSocket-Key` value on success.
pub(crate) fn validate<'r>(request: &'r Request<'r>) -> Result<&'r [u8], Error> {
    let upgrade = request.header(b"upgrade").ok_or(Error::HandshakeInvalid)?;
    if !upgrade.eq_ignore_ascii_case(b"websocket") {
        return Err(Error::HandshakeInvalid);
    }

    let connection = request.header(b"connection").ok_or(Error::HandshakeInvalid)?;
    if !contains_token(connection, b"upgrade") {
        return Err(Error::HandshakeInvalid);
    }

    let version = request.header(b"sec-websocket-version").ok_or(Error::HandshakeInvalid)?;
    if version != b"13" {
        return Err(Error::HandshakeInvalid);
    }

    let key = request.header(b"sec-websocket-key").ok_or(Error::HandshakeInvalid)?;
    if key.is_empty() {
        return Err(Error::HandshakeInvalid);
    }

    Ok(key)
}

/// Computes `base64(SHA1(key + GUID))`, the value of the response's
/// `Sec-WebSocket-Accept` header.
pub(crate) fn accept_token(key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(GUID);
    let digest = hasher.finalize();

    base64::engine::general_purpose::STANDARD.encode(digest)
}

fn contains_token(header: &[u8], token: &[u8]) -> bool {
    header
        .split(|&b| b == b',')
        .map(|part| crate::http::types::trim_ascii(part))
        .any(|part| part.eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_known_accept_token() {
        // RFC 6455 section 1.3 worked example.
        assert_eq!(accept_token(b"dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn connection_header_token_list_is_matched_loosely() {
        assert!(contains_token(b"keep-alive, Upgrade", b"upgrade"));
        assert!(!contains_token(b"keep-alive", b"upgrade"));
    }
}
