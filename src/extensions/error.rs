use std::fmt;

use super::parser::Error as ParseError;

/// Error raised while negotiating an extension or while an extension
/// processes a message.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The `Sec-WebSocket-Extensions` header is malformed.
    Parsing(ParseError),
    /// An offer contained a parameter the extension does not know.
    UnknownParameter(String),
    /// A parameter that takes no value was given one.
    ParamDisallowsValue(&'static str),
    /// A parameter that requires a value was given none.
    ParamRequiresValue(&'static str),
    /// A parameter appeared twice in one offer.
    DuplicateParameter(&'static str),
    /// A transformed incoming message exceeded the maximum message length.
    MessageTooBig,
    /// Compressing an outgoing message failed.
    #[cfg(feature = "permessage-deflate")]
    Compress(flate2::CompressError),
    /// Decompressing an incoming message failed.
    #[cfg(feature = "permessage-deflate")]
    Decompress(flate2::DecompressError),
    /// A window size parameter was not an integer between 9 and 15.
    #[cfg(feature = "permessage-deflate")]
    InvalidWindowBits(&'static str),
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Self::Parsing(err)
    }
}

#[cfg(feature = "permessage-deflate")]
impl From<flate2::CompressError> for Error {
    fn from(err: flate2::CompressError) -> Self {
        Self::Compress(err)
    }
}

#[cfg(feature = "permessage-deflate")]
impl From<flate2::DecompressError> for Error {
    fn from(err: flate2::DecompressError) -> Self {
        Self::Decompress(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parsing(e) => e.fmt(f),
            Self::UnknownParameter(name) => write!(f, "unknown extension parameter: {name}"),
            Self::ParamDisallowsValue(name) => {
                write!(f, "got value for parameter that does not take values: {name}")
            }
            Self::ParamRequiresValue(name) => write!(f, "missing value for parameter: {name}"),
            Self::DuplicateParameter(name) => write!(f, "parameter was given twice: {name}"),
            Self::MessageTooBig => f.write_str("message too big after processing"),
            #[cfg(feature = "permessage-deflate")]
            Self::Compress(e) => e.fmt(f),
            #[cfg(feature = "permessage-deflate")]
            Self::Decompress(e) => e.fmt(f),
            #[cfg(feature = "permessage-deflate")]
            Self::InvalidWindowBits(name) => {
                write!(f, "{name} must be between 9 and 15")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parsing(e) => Some(e),
            #[cfg(feature = "permessage-deflate")]
            Self::Compress(e) => Some(e),
            #[cfg(feature = "permessage-deflate")]
            Self::Decompress(e) => Some(e),
            _ => None,
        }
    }
}
