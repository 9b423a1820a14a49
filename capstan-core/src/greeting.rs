//! Connection greeting exchanged before any frame.
//!
//! Layout (12 bytes):
//! ```text
//! [0]      0xFF
//! [1..9]   Padding
//! [9]      0x7F
//! [10]     Protocol version
//! [11]     Socket type
//! ```
//!
//! The signature bytes make an accidental plain-TCP client fail fast, the
//! version pins the framing rules, and the socket type lets each side
//! refuse an incompatible pattern before messages flow. Padding content is
//! ignored on receipt.

use crate::error::{EngineError, Result};
use crate::socket_type::SocketType;

/// A greeting is always exactly 12 bytes.
pub const GREETING_SIZE: usize = 12;

/// The one framing version this engine speaks.
pub const PROTOCOL_VERSION: u8 = 1;

const SIGNATURE_HEAD: u8 = 0xFF;
const SIGNATURE_TAIL: u8 = 0x7F;
const VERSION_POS: usize = 10;
const SOCKET_TYPE_POS: usize = 11;

/// Parsed greeting information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Greeting {
    pub socket_type: SocketType,
}

impl Greeting {
    #[must_use]
    pub const fn new(socket_type: SocketType) -> Self {
        Self { socket_type }
    }

    /// Wire form of this greeting.
    #[must_use]
    pub const fn encode(&self) -> [u8; GREETING_SIZE] {
        let mut buf = [0u8; GREETING_SIZE];
        buf[0] = SIGNATURE_HEAD;
        buf[9] = SIGNATURE_TAIL;
        buf[VERSION_POS] = PROTOCOL_VERSION;
        buf[SOCKET_TYPE_POS] = self.socket_type.wire_id();
        buf
    }

    /// Parse a 12-byte greeting.
    pub fn parse(src: &[u8]) -> Result<Self> {
        if src.len() < GREETING_SIZE {
            return Err(EngineError::invalid_greeting("truncated greeting"));
        }

        if src[0] != SIGNATURE_HEAD || src[9] != SIGNATURE_TAIL {
            return Err(EngineError::invalid_greeting("bad signature"));
        }

        let version = src[VERSION_POS];
        if version != PROTOCOL_VERSION {
            return Err(EngineError::invalid_greeting(format!(
                "unsupported protocol version {version}"
            )));
        }

        let Some(socket_type) = SocketType::from_wire_id(src[SOCKET_TYPE_POS]) else {
            return Err(EngineError::invalid_greeting(format!(
                "unknown socket type {}",
                src[SOCKET_TYPE_POS]
            )));
        };

        Ok(Self { socket_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_socket_type() {
        for id in 0..=8u8 {
            let ty = SocketType::from_wire_id(id).unwrap();
            let wire = Greeting::new(ty).encode();
            assert_eq!(wire.len(), GREETING_SIZE);
            let parsed = Greeting::parse(&wire).unwrap();
            assert_eq!(parsed.socket_type, ty);
        }
    }

    #[test]
    fn rejects_bad_signature() {
        let mut wire = Greeting::new(SocketType::Pair).encode();
        wire[0] = 0x00;
        assert!(Greeting::parse(&wire).is_err());

        let mut wire = Greeting::new(SocketType::Pair).encode();
        wire[9] = 0xFF;
        assert!(Greeting::parse(&wire).is_err());
    }

    #[test]
    fn rejects_version_mismatch() {
        let mut wire = Greeting::new(SocketType::Pull).encode();
        wire[VERSION_POS] = 2;
        assert!(matches!(
            Greeting::parse(&wire),
            Err(EngineError::InvalidGreeting(_))
        ));
    }

    #[test]
    fn rejects_unknown_socket_type() {
        let mut wire = Greeting::new(SocketType::Pull).encode();
        wire[SOCKET_TYPE_POS] = 42;
        assert!(Greeting::parse(&wire).is_err());
    }

    #[test]
    fn padding_content_is_ignored() {
        let mut wire = Greeting::new(SocketType::Pub).encode();
        for byte in &mut wire[1..9] {
            *byte = 0xAA;
        }
        assert_eq!(
            Greeting::parse(&wire).unwrap().socket_type,
            SocketType::Pub
        );
    }

    #[test]
    fn rejects_truncated_input() {
        let wire = Greeting::new(SocketType::Pub).encode();
        assert!(Greeting::parse(&wire[..11]).is_err());
    }
}
