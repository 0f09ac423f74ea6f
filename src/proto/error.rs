//! WebSocket protocol error type.
use std::fmt;

use super::types::CloseCode;
use crate::extensions;

/// Error encountered on protocol violations by the other end of the
/// connection, or by a negotiated extension.
///
/// Every variant is fatal to the connection and maps to the close code that is
/// used to terminate it, see [`ProtocolError::close_code`].
#[allow(clippy::module_name_repetitions)]
#[derive(Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    /// A reserved bit was set that no negotiated extension owns.
    InvalidRsv {
        /// Whether RSV1 was set.
        rsv1: bool,
        /// Whether RSV2 was set.
        rsv2: bool,
        /// Whether RSV3 was set.
        rsv3: bool,
    },
    /// An unknown opcode was received.
    InvalidOpcode(u8),
    /// A control frame without the FIN bit was received.
    FragmentedControlFrame(u8),
    /// A new text or binary frame arrived before the previous message was
    /// finished.
    UnfinishedMessage,
    /// A continuation frame arrived while no message was in progress.
    UnexpectedContinuation,
    /// A control frame declared a payload longer than 125 bytes.
    InvalidControlFrameLength(u64),
    /// An unmasked frame was received while masking is required.
    UnmaskedFrame,
    /// A message exceeded the configured maximum length.
    MessageTooBig,
    /// An invalid UTF-8 segment was received when valid UTF-8 was expected.
    InvalidUtf8,
    /// A negotiated extension failed to process a message.
    Extension(extensions::Error),
    /// The client's `Sec-WebSocket-Extensions` offer could not be negotiated.
    Negotiation(extensions::Error),
}

impl ProtocolError {
    /// The close code used to terminate a connection failing with this error.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::UnmaskedFrame => CloseCode::UNSUPPORTED_DATA,
            Self::InvalidUtf8 => CloseCode::INVALID_FRAME_PAYLOAD_DATA,
            Self::MessageTooBig => CloseCode::MESSAGE_TOO_BIG,
            Self::Extension(_) => CloseCode::MANDATORY_EXTENSION,
            Self::InvalidRsv { .. }
            | Self::InvalidOpcode(_)
            | Self::FragmentedControlFrame(_)
            | Self::UnfinishedMessage
            | Self::UnexpectedContinuation
            | Self::InvalidControlFrameLength(_)
            | Self::Negotiation(_) => CloseCode::PROTOCOL_ERROR,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRsv { rsv1, rsv2, rsv3 } => write!(
                f,
                "one or more reserved bits are on: reserved1 = {}, reserved2 = {}, reserved3 = {}",
                u8::from(*rsv1),
                u8::from(*rsv2),
                u8::from(*rsv3)
            ),
            Self::InvalidOpcode(opcode) => write!(f, "unrecognized frame opcode: {opcode}"),
            Self::FragmentedControlFrame(opcode) => {
                write!(f, "received fragmented control frame: opcode = {opcode}")
            }
            Self::UnfinishedMessage => f.write_str(
                "received new data frame but previous continuous frame is unfinished",
            ),
            Self::UnexpectedContinuation => f.write_str("received unexpected continuation frame"),
            Self::InvalidControlFrameLength(length) => {
                write!(f, "received control frame having too long payload: {length}")
            }
            Self::UnmaskedFrame => f.write_str("received unmasked frame but masking is required"),
            Self::MessageTooBig => f.write_str("websocket frame length too large"),
            Self::InvalidUtf8 => f.write_str("could not decode a text frame as utf-8"),
            Self::Extension(e) | Self::Negotiation(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Extension(e) | Self::Negotiation(e) => Some(e),
            _ => None,
        }
    }
}
