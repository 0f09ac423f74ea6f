//! Reassembly of fragmented messages.
use bytes::{Bytes, BytesMut};

use super::{frame::Frame, types::OpCode};

/// One logical message, possibly assembled from several frames.
///
/// The opcode and reserved bits are taken from the frame that opened the
/// message. Extensions may rewrite both the reserved bits and `data`.
#[derive(Debug, Clone)]
pub(crate) struct Message {
    /// Text or binary.
    pub opcode: OpCode,
    /// First reserved bit.
    pub rsv1: bool,
    /// Second reserved bit.
    pub rsv2: bool,
    /// Third reserved bit.
    pub rsv3: bool,
    /// Frame payloads appended so far, in arrival order.
    frames: Vec<Bytes>,
    /// Sum of the lengths of `frames`.
    length: usize,
    /// The concatenated payload, valid after [`Message::read`].
    pub data: Bytes,
}

impl Message {
    /// Creates a complete message from a payload, with all reserved bits
    /// cleared.
    pub fn new(opcode: OpCode, data: Bytes) -> Self {
        Self {
            opcode,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            frames: Vec::new(),
            length: data.len(),
            data,
        }
    }

    /// Starts a message from its opening frame.
    pub fn start(frame: &Frame) -> Self {
        let mut message = Self {
            opcode: frame.opcode,
            rsv1: frame.rsv1,
            rsv2: frame.rsv2,
            rsv3: frame.rsv3,
            frames: Vec::new(),
            length: 0,
            data: Bytes::new(),
        };
        message.push_frame(frame);

        message
    }

    /// Appends the payload of a frame belonging to this message.
    pub fn push_frame(&mut self, frame: &Frame) {
        self.length += frame.payload.len();
        self.frames.push(frame.payload.clone());
    }

    /// Number of payload bytes received so far.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Concatenates the appended frame payloads into `data`.
    pub fn read(&mut self) {
        self.data = match self.frames.len() {
            0 => Bytes::new(),
            1 => self.frames.pop().unwrap_or_default(),
            _ => {
                let mut data = BytesMut::with_capacity(self.length);
                for frame in self.frames.drain(..) {
                    data.extend_from_slice(&frame);
                }
                data.freeze()
            }
        };
        self.frames.clear();
    }
}
