//! Wire-frame codec.
//!
//! A frame on the wire is `[flags][length][payload]`. Flag bit 0 marks a
//! continuation frame of a multipart message; all other flag bits are
//! reserved and must be zero. Payloads up to [`SHORT_MAX`] bytes carry
//! their length in a single byte; longer payloads put the marker `0xFF` in
//! that byte followed by the length as eight bytes in the configured byte
//! order. The two byte values between [`SHORT_MAX`] and the marker are
//! reserved.
//!
//! Fast path:
//! - Entire frame present → zero-copy slice off the receive buffer
//!
//! Slow path:
//! - Fragmented frame → reassemble into `BytesMut`

use crate::error::{EngineError, Result};
use crate::msg::{Msg, MORE};
use bytes::{Buf, BytesMut};

/// Largest payload length the single-byte form can carry.
pub const SHORT_MAX: usize = 252;

/// Length byte announcing the eight-byte form.
pub const LONG_MARKER: u8 = 0xFF;

/// Byte order of the eight-byte length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// Stateful frame decoder.
pub struct Decoder {
    // Fragmentation state
    pending_flags: Option<u8>,
    expected_body_len: usize,
    staging: BytesMut,
    endianness: Endianness,
    max_msg_size: Option<usize>,
}

impl Decoder {
    #[must_use]
    pub fn new(endianness: Endianness, max_msg_size: Option<usize>) -> Self {
        Self {
            pending_flags: None,
            expected_body_len: 0,
            staging: BytesMut::new(),
            endianness,
            max_msg_size,
        }
    }

    /// Decode a single frame from `src`.
    ///
    /// Returns:
    /// - Ok(Some(msg)) → frame decoded
    /// - Ok(None) → need more data
    /// - Err → protocol violation, the connection must go down
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Msg>> {
        // === Reassembly mode ===
        if let Some(flags) = self.pending_flags {
            let needed = self.expected_body_len - self.staging.len();
            let take = needed.min(src.len());

            self.staging.extend_from_slice(&src.split_to(take));

            if self.staging.len() < self.expected_body_len {
                return Ok(None);
            }

            self.pending_flags = None;
            self.expected_body_len = 0;

            return Ok(Some(Self::finish(flags, self.staging.split().freeze().into())));
        }

        // === Header parsing ===
        if src.len() < 2 {
            return Ok(None);
        }

        let flags = src[0];
        if flags & !MORE != 0 {
            return Err(EngineError::invalid_frame("reserved flag bits set"));
        }

        let len_byte = src[1];
        let is_long = len_byte == LONG_MARKER;
        if !is_long && len_byte as usize > SHORT_MAX {
            return Err(EngineError::invalid_frame("reserved length marker"));
        }

        let header_len = if is_long { 10 } else { 2 };
        if src.len() < header_len {
            return Ok(None);
        }

        // === Body length ===
        let body_len = if is_long {
            let mut field = &src[2..10];
            let raw = match self.endianness {
                Endianness::Big => field.get_u64(),
                Endianness::Little => field.get_u64_le(),
            };
            usize::try_from(raw)
                .map_err(|_| EngineError::invalid_frame("length exceeds address space"))?
        } else {
            len_byte as usize
        };

        if let Some(max) = self.max_msg_size {
            if body_len > max {
                return Err(EngineError::MessageTooLarge {
                    size: body_len,
                    max,
                });
            }
        }

        let total_len = header_len + body_len;

        // === Fast path: entire frame present ===
        if src.len() >= total_len {
            src.advance(header_len);
            let payload = src.split_to(body_len);
            return Ok(Some(Self::finish(flags, payload.freeze().into())));
        }

        // === Slow path: fragmentation ===
        src.advance(header_len);
        self.pending_flags = Some(flags);
        self.expected_body_len = body_len;
        self.staging.clear();
        self.staging.reserve(body_len);
        self.staging.extend_from_slice(&src.split_to(src.len()));

        Ok(None)
    }

    fn finish(flags: u8, mut msg: Msg) -> Msg {
        msg.set_more(flags & MORE != 0);
        msg
    }
}

/// Frame encoder. Stateless apart from the configured byte order; the
/// caller owns the output buffer and its drain to the wire.
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    endianness: Endianness,
}

impl Encoder {
    #[must_use]
    pub const fn new(endianness: Endianness) -> Self {
        Self { endianness }
    }

    /// Bytes the encoded form of `msg` will occupy.
    #[must_use]
    pub fn encoded_len(&self, msg: &Msg) -> usize {
        let body = msg.size();
        if body <= SHORT_MAX {
            2 + body
        } else {
            10 + body
        }
    }

    /// Append the encoded frame to `out`.
    pub fn encode_into(&self, msg: &Msg, out: &mut BytesMut) {
        let body = msg.data();
        out.reserve(self.encoded_len(msg));
        out.extend_from_slice(&[msg.flags() & MORE]);
        if body.len() <= SHORT_MAX {
            out.extend_from_slice(&[body.len() as u8]);
        } else {
            out.extend_from_slice(&[LONG_MARKER]);
            match self.endianness {
                Endianness::Big => out.extend_from_slice(&(body.len() as u64).to_be_bytes()),
                Endianness::Little => out.extend_from_slice(&(body.len() as u64).to_le_bytes()),
            }
        }
        out.extend_from_slice(body);
    }
}
