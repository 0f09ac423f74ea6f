//! The client's HTTP/1.1 upgrade request, as far as the protocol driver is
//! concerned with it.
use std::fmt;

#[cfg(feature = "server")]
pub(crate) mod client_request;

/// Error encountered when reading a client's upgrade request.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A required header is missing.
    MissingHeader(&'static str),
    /// A header has a value the server cannot accept.
    UnexpectedHeader {
        /// Name of the header.
        name: &'static str,
        /// What the value was expected to be or contain.
        expected: &'static str,
        /// The value the client sent.
        actual: String,
    },
    /// The request is not valid HTTP.
    #[cfg(feature = "server")]
    Parsing(httparse::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingHeader(name) => write!(f, "client didn't provide {name} header"),
            Self::UnexpectedHeader {
                name,
                expected,
                actual,
            } => write!(
                f,
                "client provided incorrect {name} header: expected {expected}, got {actual}"
            ),
            #[cfg(feature = "server")]
            Self::Parsing(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            #[cfg(feature = "server")]
            Self::Parsing(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(feature = "server")]
impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Self {
        Self::Parsing(err)
    }
}

/// The `Sec-WebSocket-*` headers of an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// The `Sec-WebSocket-Key` nonce.
    pub key: String,
    /// The comma-separated `Sec-WebSocket-Protocol` offer.
    pub protocol: Option<String>,
    /// The `Sec-WebSocket-Version`.
    pub version: String,
    /// The raw `Sec-WebSocket-Extensions` offer.
    pub extensions: Option<String>,
}

impl UpgradeRequest {
    /// Creates a version 13 request without protocol or extension offers.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            protocol: None,
            version: String::from("13"),
            extensions: None,
        }
    }

    /// Sets the sub-protocol offer.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());

        self
    }

    /// Sets the protocol version.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();

        self
    }

    /// Sets the extension offer.
    #[must_use]
    pub fn extensions(mut self, extensions: impl Into<String>) -> Self {
        self.extensions = Some(extensions.into());

        self
    }

    /// Collects the request from its header fields.
    ///
    /// Header names are matched case-insensitively. Repeated protocol or
    /// extension headers are joined with `", "`, as if they were sent as one
    /// list.
    ///
    /// # Errors
    ///
    /// This method fails if no `Sec-WebSocket-Key` header is present.
    pub fn from_headers<'a, I>(headers: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut key = None;
        let mut protocol: Option<String> = None;
        let mut version = None;
        let mut extensions: Option<String> = None;

        let join = |list: &mut Option<String>, value: &str| match list {
            Some(list) => {
                list.push_str(", ");
                list.push_str(value);
            }
            None => *list = Some(value.to_owned()),
        };

        for (name, value) in headers {
            let value = value.trim();

            if name.eq_ignore_ascii_case("Sec-WebSocket-Key") {
                key = Some(value.to_owned());
            } else if name.eq_ignore_ascii_case("Sec-WebSocket-Protocol") {
                join(&mut protocol, value);
            } else if name.eq_ignore_ascii_case("Sec-WebSocket-Version") {
                version = Some(value.to_owned());
            } else if name.eq_ignore_ascii_case("Sec-WebSocket-Extensions") {
                join(&mut extensions, value);
            }
        }

        let mut request = Self::new(key.ok_or(Error::MissingHeader("Sec-WebSocket-Key"))?);
        request.protocol = protocol;
        request.extensions = extensions;
        if let Some(version) = version {
            request.version = version;
        }

        Ok(request)
    }
}
