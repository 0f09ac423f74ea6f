//! General error type used in the crate.
use std::{fmt, io};

use crate::{proto::ProtocolError, upgrade};

/// Generic error when driving a WebSocket connection with this crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Attempted to send on a connection that is closing or closed.
    AlreadyClosed,
    /// Attempted to start a connection that already left the connecting state.
    AlreadyStarted,
    /// Websocket protocol violation.
    Protocol(ProtocolError),
    /// The HTTP/1.1 Upgrade failed.
    Upgrade(upgrade::Error),
    /// I/O error.
    Io(io::Error),
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl From<upgrade::Error> for Error {
    fn from(err: upgrade::Error) -> Self {
        Self::Upgrade(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyClosed => f.write_str("the connection is already closing or closed"),
            Self::AlreadyStarted => f.write_str("the connection was already started"),
            Self::Protocol(e) => e.fmt(f),
            Self::Upgrade(e) => write!(f, "invalid client upgrade request: {e}"),
            Self::Io(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AlreadyClosed | Self::AlreadyStarted => None,
            Self::Protocol(e) => Some(e),
            Self::Upgrade(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}
