//! A single WebSocket frame and its wire encoding.
use bytes::{BufMut, Bytes, BytesMut};

use super::types::OpCode;
use crate::mask;

/// FIN bit of the first header byte.
pub(crate) const FIN: u8 = 0x80;
/// MASK bit of the second header byte.
pub(crate) const MASK: u8 = 0x80;
/// First reserved bit.
pub(crate) const RSV1: u8 = 0x40;
/// Second reserved bit.
pub(crate) const RSV2: u8 = 0x20;
/// Third reserved bit.
pub(crate) const RSV3: u8 = 0x10;
/// Opcode bits of the first header byte.
pub(crate) const OPCODE: u8 = 0x0F;
/// 7-bit length field of the second header byte.
pub(crate) const LENGTH: u8 = 0x7F;
/// Largest payload a control frame may carry.
pub(crate) const MAX_CONTROL_PAYLOAD: u64 = 125;

/// A frame of a WebSocket message.
///
/// While a frame is being parsed its payload is empty. It is filled in (and
/// unmasked) once all `length` bytes arrived, after which the frame is no
/// longer modified.
#[derive(Clone, Debug)]
pub(crate) struct Frame {
    /// Whether this is the last frame of a message.
    pub is_final: bool,
    /// First reserved bit.
    pub rsv1: bool,
    /// Second reserved bit.
    pub rsv2: bool,
    /// Third reserved bit.
    pub rsv3: bool,
    /// The [`OpCode`] of the frame.
    pub opcode: OpCode,
    /// Whether the payload is masked.
    pub masked: bool,
    /// Masking key, present iff `masked`.
    pub masking_key: Option<[u8; 4]>,
    /// Declared payload length.
    pub length: u64,
    /// The (unmasked) payload bytes of the frame.
    pub payload: Bytes,
}

impl Frame {
    /// Creates an unmasked final frame carrying `payload`.
    pub fn new(opcode: OpCode, payload: Bytes) -> Self {
        Self {
            is_final: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masked: false,
            masking_key: None,
            length: payload.len() as u64,
            payload,
        }
    }

    /// Masks the frame with `key` when it is serialized.
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.masked = true;
        self.masking_key = Some(key);

        self
    }

    /// The reserved bits of this frame as they appear in the first header
    /// byte.
    pub fn reserved_bits(&self) -> u8 {
        (if self.rsv1 { RSV1 } else { 0 })
            | (if self.rsv2 { RSV2 } else { 0 })
            | (if self.rsv3 { RSV3 } else { 0 })
    }

    /// Serializes the frame into `dst`, choosing the shortest length encoding
    /// and masking the payload if a key is present.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self, dst: &mut BytesMut) {
        let length = self.payload.len();
        let mask_bit = if self.masking_key.is_some() { MASK } else { 0 };

        dst.reserve(14 + length);
        dst.put_u8(
            (if self.is_final { FIN } else { 0 }) | self.reserved_bits() | u8::from(self.opcode),
        );

        if length <= 125 {
            dst.put_u8(mask_bit | length as u8);
        } else if let Ok(length) = u16::try_from(length) {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(length);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(length as u64);
        }

        if let Some(key) = self.masking_key {
            dst.extend_from_slice(&key);
        }

        let start_of_data = dst.len();
        dst.extend_from_slice(&self.payload);

        if let Some(key) = self.masking_key {
            mask::frame(key, &mut dst[start_of_data..], 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(length: usize) -> BytesMut {
        let mut dst = BytesMut::new();
        Frame::new(OpCode::Binary, Bytes::from(vec![7; length])).encode(&mut dst);
        dst
    }

    #[test]
    fn short_length_is_inline() {
        let dst = encoded(125);

        assert_eq!(dst[0], 0x82);
        assert_eq!(dst[1], 125);
        assert_eq!(dst.len(), 2 + 125);
    }

    #[test]
    fn medium_length_uses_16_bits() {
        let dst = encoded(126);

        assert_eq!(dst[0], 0x82);
        assert_eq!(dst[1], 126);
        assert_eq!(&dst[2..4], &[0x00, 0x7e]);
        assert_eq!(dst.len(), 4 + 126);

        let dst = encoded(65535);
        assert_eq!(dst[1], 126);
        assert_eq!(&dst[2..4], &[0xff, 0xff]);
    }

    #[test]
    fn long_length_uses_64_bits() {
        let dst = encoded(65536);

        assert_eq!(dst[0], 0x82);
        assert_eq!(dst[1], 127);
        assert_eq!(&dst[2..10], &[0, 0, 0, 0, 0, 1, 0, 0]);
        assert_eq!(dst.len(), 10 + 65536);
    }

    #[test]
    fn masked_frame_layout() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut dst = BytesMut::new();
        Frame::new(OpCode::Text, Bytes::from_static(b"Hello"))
            .with_mask(key)
            .encode(&mut dst);

        assert_eq!(
            &dst[..],
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    #[test]
    fn header_bits() {
        let mut frame = Frame::new(OpCode::Continuation, Bytes::new());
        frame.is_final = false;
        frame.rsv1 = true;
        frame.rsv3 = true;

        let mut dst = BytesMut::new();
        frame.encode(&mut dst);

        assert_eq!(&dst[..], &[0x50, 0x00]);
    }
}
