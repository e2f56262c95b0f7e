//! Tunnel Protocol Definitions
//!
//! Wire-level types shared by the tunrelay servers: the framed handshake a
//! client sends as the first message on the TLS listener, and the
//! `host:port` target address carried by both the framed protocol and
//! HTTP CONNECT.

pub mod handshake;
pub mod target;

pub use handshake::{encode_handshake, Handshake, HandshakeError};
pub use target::{TargetAddr, TargetAddrError};

/// Longest DNS name accepted as a tunnel target
pub const MAX_DOMAIN_LEN: usize = 253;

/// Longest decimal port (`65535`)
pub const MAX_PORT_DIGITS: usize = 5;

/// Handshake delimiter between the target address and the leftover payload
pub const HANDSHAKE_DELIMITER: u8 = b'\n';

/// Bytes a handshake may carry after the secret: domain, two IPv6 brackets,
/// the colon, the port and the delimiter.
pub const MAX_ADDRESS_FRAME_LEN: usize = MAX_DOMAIN_LEN + 2 + 1 + MAX_PORT_DIGITS + 1;

/// Size of the buffer the handshake is read into for a secret of `secret_len` bytes.
pub fn handshake_buffer_len(secret_len: usize) -> usize {
    secret_len + MAX_ADDRESS_FRAME_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_len_matches_frame_budget() {
        assert_eq!(MAX_ADDRESS_FRAME_LEN, 262);
        assert_eq!(handshake_buffer_len(0), 262);
        assert_eq!(handshake_buffer_len(4), 266);
    }
}
