//! Types required for the WebSocket protocol implementation.
use std::fmt;

use bytes::Bytes;

use super::error::ProtocolError;
use crate::extensions::{ExtensionConfiguration, Offer};

/// The opcode of a WebSocket frame. It denotes the type of the frame or an
/// assembled message.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum OpCode {
    /// A continuation opcode. A reassembled message never carries it.
    Continuation,
    /// A text opcode.
    Text,
    /// A binary opcode.
    Binary,
    /// A close opcode.
    Close,
    /// A ping opcode.
    Ping,
    /// A pong opcode.
    Pong,
}

impl OpCode {
    /// Whether this is a control opcode (i.e. close, ping or pong).
    pub(crate) fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Whether frames with this opcode carry message data.
    pub(crate) fn is_message(self) -> bool {
        !self.is_control()
    }

    /// Whether this opcode starts a new message.
    pub(crate) fn is_opening(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Continuation),
            1 => Ok(Self::Text),
            2 => Ok(Self::Binary),
            8 => Ok(Self::Close),
            9 => Ok(Self::Ping),
            10 => Ok(Self::Pong),
            _ => Err(ProtocolError::InvalidOpcode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Continuation => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
        }
    }
}

/// Close status code.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CloseCode(u16);

// rustfmt reorders these alphabetically
#[rustfmt::skip]
impl CloseCode {
    /// Normal closure, meaning that the purpose for which the connection was
    /// established has been fulfilled.
    pub const NORMAL_CLOSURE: Self = Self(1000);
    /// Endpoint is "going away", such as a server going down or a browser
    /// having navigated away from a page.
    pub const GOING_AWAY: Self = Self(1001);
    /// Endpoint is terminating the connection due to a protocol error.
    pub const PROTOCOL_ERROR: Self = Self(1002);
    /// Endpoint is terminating the connection because it has received a type of
    /// data it cannot accept.
    pub const UNSUPPORTED_DATA: Self = Self(1003);
    /// The connection was dropped without a close frame. Never sent on the
    /// wire.
    pub const ABNORMAL_CLOSURE: Self = Self(1006);
    /// Endpoint is terminating the connection because it has received data
    /// within a message that was not consistent with the type of the message.
    pub const INVALID_FRAME_PAYLOAD_DATA: Self = Self(1007);
    /// Endpoint is terminating the connection because it has received a message
    /// that violates its policy.
    pub const POLICY_VIOLATION: Self = Self(1008);
    /// Endpoint is terminating the connection because it has received a message
    /// that is too big for it to process.
    pub const MESSAGE_TOO_BIG: Self = Self(1009);
    /// An extension failed to process a message.
    pub const MANDATORY_EXTENSION: Self = Self(1010);
    /// Server is terminating the connection because it encountered an
    /// unexpected condition that prevented it from fulfilling the request.
    pub const INTERNAL_SERVER_ERROR: Self = Self(1011);
}

/// Codes a peer may legitimately send in a close frame, besides the
/// `3000..=4999` range.
const STANDARD_CODES: [u16; 9] = [1000, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011];

impl CloseCode {
    /// Whether a peer is allowed to send this code in a close frame.
    pub(crate) fn is_acceptable(code: u16) -> bool {
        STANDARD_CODES.contains(&code) || (3000..=4999).contains(&code)
    }
}

impl From<CloseCode> for u16 {
    fn from(value: CloseCode) -> Self {
        value.0
    }
}

/// A close code a peer is not allowed to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidCloseCode(pub u16);

impl fmt::Display for InvalidCloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid close code: {}", self.0)
    }
}

impl std::error::Error for InvalidCloseCode {}

impl TryFrom<u16> for CloseCode {
    type Error = InvalidCloseCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if Self::is_acceptable(value) {
            Ok(Self(value))
        } else {
            Err(InvalidCloseCode(value))
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle phase of a [`Driver`](super::Driver).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    /// The handshake has not completed yet. Sends are queued.
    Connecting = 0,
    /// Messages can be exchanged.
    Open = 1,
    /// A close frame was sent and the peer's answer is outstanding.
    Closing = 2,
    /// The connection is finished.
    Closed = 3,
}

/// Role assumed by an endpoint of a connection.
#[cfg(feature = "permessage-deflate")]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum Role {
    /// The client end.
    #[cfg_attr(not(test), allow(dead_code))]
    Client,
    /// The server end.
    Server,
}

/// A fully reassembled application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    /// A text message, validated to be UTF-8.
    Text(String),
    /// A binary message.
    Binary(Bytes),
}

/// Status reported when a connection is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// The close code.
    pub code: CloseCode,
    /// The close reason, empty if none was given.
    pub reason: String,
}

/// Events emitted by a connection, in emission order.
#[derive(Debug)]
pub enum Event {
    /// The handshake completed.
    Open,
    /// A message was received.
    Message(Data),
    /// The connection failed. Always followed by [`Event::Close`].
    Error(String),
    /// The connection was closed.
    Close(CloseEvent),
}

/// Configuration of a [`Driver`](super::Driver), resolved before the
/// connection is accepted and shared read-only across connections.
#[derive(Debug, Clone)]
pub struct Config {
    /// The maximum allowed length of a reassembled message.
    pub(crate) max_length: usize,
    /// Whether inbound frames must be masked.
    pub(crate) require_masking: bool,
    /// Whether outbound frames are masked.
    pub(crate) masking: bool,
    /// Supported sub-protocols.
    pub(crate) protocols: Vec<String>,
    /// Extensions the server is willing to negotiate.
    pub(crate) extensions: ExtensionConfiguration,
}

impl Config {
    /// Sets the maximum allowed length of a reassembled message. `None` equals
    /// no limit. The default is 64 MiB minus one byte.
    #[must_use]
    pub fn max_length(mut self, length: Option<usize>) -> Self {
        self.max_length = length.unwrap_or(usize::MAX);

        self
    }

    /// Sets whether unmasked inbound frames are rejected. The default is
    /// `true`, as clients must mask every frame.
    #[must_use]
    pub fn require_masking(mut self, require_masking: bool) -> Self {
        self.require_masking = require_masking;

        self
    }

    /// Sets whether outbound frames are masked with a fresh random key. The
    /// default is `false`, as servers must not mask.
    #[must_use]
    pub fn masking(mut self, masking: bool) -> Self {
        self.masking = masking;

        self
    }

    /// Sets the supported sub-protocols.
    #[must_use]
    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();

        self
    }

    /// Sets the supported sub-protocols from a comma-separated list.
    #[must_use]
    pub fn protocol_list(self, list: &str) -> Self {
        self.protocols(
            list.split(',')
                .map(str::trim)
                .filter(|protocol| !protocol.is_empty()),
        )
    }

    /// Sets the extensions the server is willing to negotiate.
    #[must_use]
    pub fn extensions(mut self, extensions: ExtensionConfiguration) -> Self {
        self.extensions = extensions;

        self
    }

    /// Adds an extension offer to the ones the server is willing to negotiate.
    #[must_use]
    pub fn extension(mut self, offer: Offer) -> Self {
        self.extensions.push(offer);

        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_length: (1 << 26) - 1,
            require_masking: true,
            masking: false,
            protocols: Vec::new(),
            extensions: ExtensionConfiguration::default(),
        }
    }
}
