//! Framed handshake parsing
//!
//! The first message a client sends on the TLS listener is
//!
//! ```text
//! [secret: secret_len bytes][host:port][\n][leftover payload...]
//! ```
//!
//! The frame is produced by a single read, so the leftover payload is
//! whatever application bytes arrived in the same read. Those bytes belong to
//! the tunnelled stream and must reach the target before anything else.

use crate::HANDSHAKE_DELIMITER;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("short handshake: read {read} bytes, need at least {required}")]
    ShortRead { read: usize, required: usize },

    #[error("handshake delimiter not found")]
    MissingDelimiter,

    #[error("handshake delimiter at offset {offset} leaves no room for an address")]
    EmptyAddress { offset: usize },
}

/// A parsed handshake frame borrowing from the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake<'a> {
    /// Caller-supplied token, exactly `secret_len` bytes
    pub token: &'a [u8],
    /// Raw `host:port` bytes between the token and the delimiter
    pub target: &'a [u8],
    /// Bytes after the delimiter (possibly empty)
    pub leftover: &'a [u8],
}

impl<'a> Handshake<'a> {
    /// Split the bytes of the initial read into token, target and leftover.
    ///
    /// The token is not compared here; callers authenticate `token`
    /// before acting on `target`.
    pub fn parse(frame: &'a [u8], secret_len: usize) -> Result<Self, HandshakeError> {
        if frame.len() < secret_len {
            return Err(HandshakeError::ShortRead {
                read: frame.len(),
                required: secret_len,
            });
        }

        let offset = frame
            .iter()
            .position(|&b| b == HANDSHAKE_DELIMITER)
            .ok_or(HandshakeError::MissingDelimiter)?;

        if offset <= secret_len {
            return Err(HandshakeError::EmptyAddress { offset });
        }

        Ok(Self {
            token: &frame[..secret_len],
            target: &frame[secret_len..offset],
            leftover: &frame[offset + 1..],
        })
    }
}

/// Build the handshake a client sends: `secret + target + "\n" + payload`.
pub fn encode_handshake(secret: &[u8], target: &str, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(secret.len() + target.len() + 1 + payload.len());
    buf.put_slice(secret);
    buf.put_slice(target.as_bytes());
    buf.put_u8(HANDSHAKE_DELIMITER);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handshake_buffer_len, MAX_DOMAIN_LEN};

    #[test]
    fn test_parse_with_leftover() {
        let hs = Handshake::parse(b"tok1127.0.0.1:9000\nHELLO", 4).unwrap();
        assert_eq!(hs.token, b"tok1");
        assert_eq!(hs.target, b"127.0.0.1:9000");
        assert_eq!(hs.leftover, b"HELLO");
    }

    #[test]
    fn test_parse_without_leftover() {
        let hs = Handshake::parse(b"secretexample.com:443\n", 6).unwrap();
        assert_eq!(hs.target, b"example.com:443");
        assert!(hs.leftover.is_empty());
    }

    #[test]
    fn test_leftover_keeps_later_newlines() {
        let hs = Handshake::parse(b"kh:1\nGET / HTTP/1.1\r\n\r\n", 1).unwrap();
        assert_eq!(hs.target, b"h:1");
        assert_eq!(hs.leftover, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn test_short_read() {
        assert_eq!(
            Handshake::parse(b"tok", 4),
            Err(HandshakeError::ShortRead {
                read: 3,
                required: 4
            })
        );
    }

    #[test]
    fn test_missing_delimiter() {
        assert_eq!(
            Handshake::parse(b"tok1127.0.0.1:9000", 4),
            Err(HandshakeError::MissingDelimiter)
        );
    }

    #[test]
    fn test_delimiter_inside_or_right_after_token() {
        assert_eq!(
            Handshake::parse(b"tok1\nHELLO", 4),
            Err(HandshakeError::EmptyAddress { offset: 4 })
        );
        assert_eq!(
            Handshake::parse(b"to\n1host:1\n", 4),
            Err(HandshakeError::EmptyAddress { offset: 2 })
        );
    }

    #[test]
    fn test_empty_secret_still_requires_address() {
        assert_eq!(
            Handshake::parse(b"\nHELLO", 0),
            Err(HandshakeError::EmptyAddress { offset: 0 })
        );
        let hs = Handshake::parse(b"h:1\n", 0).unwrap();
        assert!(hs.token.is_empty());
        assert_eq!(hs.target, b"h:1");
    }

    #[test]
    fn test_longest_address_fits_buffer() {
        let secret = b"tok1";
        let host = "a".repeat(MAX_DOMAIN_LEN);
        let target = format!("[{host}]:65535");
        let frame = encode_handshake(secret, &target, b"");
        assert_eq!(frame.len(), handshake_buffer_len(secret.len()));

        let hs = Handshake::parse(&frame, secret.len()).unwrap();
        assert_eq!(hs.target, target.as_bytes());
    }

    #[test]
    fn test_one_byte_too_long_is_truncated_by_buffer() {
        let secret = b"tok1";
        let host = "a".repeat(MAX_DOMAIN_LEN + 1);
        let frame = encode_handshake(secret, &format!("[{host}]:65535"), b"");
        let read = &frame[..handshake_buffer_len(secret.len())];

        assert_eq!(
            Handshake::parse(read, secret.len()),
            Err(HandshakeError::MissingDelimiter)
        );
    }

    #[test]
    fn test_encode_layout() {
        let frame = encode_handshake(b"tok1", "127.0.0.1:9000", b"HELLO");
        assert_eq!(&frame[..], b"tok1127.0.0.1:9000\nHELLO");
    }
}
