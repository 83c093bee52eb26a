//! RFC 6455 frame decode/encode.

use std::{error, fmt};
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    #[inline]
    fn from_byte(byte: u8) -> Option<Self> {
        match byte & 0x0F {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn as_byte(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    #[inline]
    pub(crate) fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Frame {
    pub(crate) fin: bool,
    pub(crate) opcode: Opcode,
    pub(crate) payload: Vec<u8>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Error {
    ReservedBitsSet,
    InvalidOpcode,
    ControlFrameTooLarge,
    FragmentedControlFrame,
    UnmaskedClientFrame,
    UnexpectedContinuation,
    PayloadTooLarge,
    MessageTooLarge,
    HandshakeInvalid,
    NoHandler,
    Io,
}

impl error::Error for Error {}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::Io
    }
}

/// Reads one frame off `stream`, unmasking client payloads in place.
/// `max_frame_size` bounds the single-frame payload length (not the
/// reassembled message length, which the caller enforces separately).
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_frame_size: u64,
) -> Result<Frame, Error> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;

    if head[0] & 0x70 != 0 {
        return Err(Error::ReservedBitsSet);
    }

    let fin = head[0] & 0x80 != 0;
    let opcode = Opcode::from_byte(head[0]).ok_or(Error::InvalidOpcode)?;
    let masked = head[1] & 0x80 != 0;
    let len7 = head[1] & 0x7F;

    if opcode.is_control() && (!fin || len7 == 126 || len7 == 127) {
        return Err(Error::FragmentedControlFrame);
    }

    let len = match len7 {
        126 => {
            let mut buf = [0u8; 2];
            stream.read_exact(&mut buf).await?;
            u16::from_be_bytes(buf) as u64
        }
        127 => {
            let mut buf = [0u8; 8];
            stream.read_exact(&mut buf).await?;
            u64::from_be_bytes(buf)
        }
        n => n as u64,
    };

    if opcode.is_control() && len > 125 {
        return Err(Error::ControlFrameTooLarge);
    }
    if len > max_frame_size {
        return Err(Error::PayloadTooLarge);
    }

    if !masked {
        return Err(Error::UnmaskedClientFrame);
    }
    let mut mask_key = [0u8; 4];
    stream.read_exact(&mut mask_key).await?;

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }

    Ok(Frame { fin, opcode, payload })
}

/// Encodes a server-originated (unmasked) frame.
pub(crate) fn encode_frame(fin: bool, opcode: Opcode, payload: &[u8], buf: &mut Vec<u8>) {
    let mut byte0 = opcode.as_byte();
    if fin {
        byte0 |= 0x80;
    }
    buf.push(byte0);

    let len = payload.len();
    if len < 126 {
        buf.push(len as u8);
    } else if len <= u16::MAX as usize {
        buf.push(126);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(127);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }

    buf.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked_frame(opcode: Opcode, fin: bool, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut byte0 = opcode.as_byte();
        if fin {
            byte0 |= 0x80;
        }
        buf.push(byte0);

        let len = payload.len();
        let mut byte1 = 0x80u8;
        if len < 126 {
            byte1 |= len as u8;
            buf.push(byte1);
        } else {
            buf.push(byte1 | 126);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        }

        buf.extend_from_slice(&key);
        for (i, &b) in payload.iter().enumerate() {
            buf.push(b ^ key[i % 4]);
        }
        buf
    }

    #[tokio::test]
    async fn decodes_masked_text_frame() {
        let wire = masked_frame(Opcode::Text, true, b"Hi", [0x37, 0xfa, 0x21, 0x3d]);
        let mut cursor = std::io::Cursor::new(wire);
        let frame = read_frame(&mut cursor, 1024).await.unwrap();

        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"Hi");
    }

    #[tokio::test]
    async fn rejects_unmasked_client_frame() {
        let mut buf = Vec::new();
        encode_frame(true, Opcode::Text, b"hi", &mut buf);
        let mut cursor = std::io::Cursor::new(buf);

        assert_eq!(
            read_frame(&mut cursor, 1024).await.unwrap_err(),
            Error::UnmaskedClientFrame
        );
    }

    #[tokio::test]
    async fn rejects_oversized_control_frame() {
        let payload = vec![0u8; 126];
        let wire = masked_frame(Opcode::Ping, true, &payload, [1, 2, 3, 4]);
        let mut cursor = std::io::Cursor::new(wire);

        assert_eq!(
            read_frame(&mut cursor, 1024).await.unwrap_err(),
            Error::ControlFrameTooLarge
        );
    }

    #[test]
    fn encode_unmasked_roundtrips_through_decode() {
        let mut buf = Vec::new();
        encode_frame(true, Opcode::Binary, b"payload", &mut buf);

        assert_eq!(buf[0], 0x80 | Opcode::Binary.as_byte());
        assert_eq!(buf[1], 7);
        assert_eq!(&buf[2..], b"payload");
    }
}
