//! Zero-copy parser for `Sec-WebSocket-Extensions` header as specified in [Section 9.1 of RFC6455](https://datatracker.ietf.org/doc/html/rfc6455#section-9.1).

use std::{borrow::Cow, fmt, str::Split};

/// Error encountered when parsing the `Sec-WebSocket-Extensions` header.
#[derive(Debug)]
pub enum Error {
    /// No extension name was provided.
    ExpectedExtensionName,
    /// No parameter name was provided.
    ExpectedParamName,
    /// No parameter value was provided.
    ExpectedParamValue,
    /// A quoted parameter value was not terminated.
    UnterminatedQuote,
}

impl Error {
    /// Stringify this variant.
    pub(super) const fn as_str(&self) -> &'static str {
        match self {
            Self::ExpectedExtensionName => "no extension name provided",
            Self::ExpectedParamName => "no parameter name provided",
            Self::ExpectedParamValue => "no parameter value provided",
            Self::UnterminatedQuote => "unterminated quoted parameter value",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for Error {}

/// One extension offer from the client, with its parameters.
#[derive(Debug)]
pub struct Offered<'a> {
    /// Registered extension name, e.g. `permessage-deflate`.
    pub name: &'a str,
    /// Parameters of this offer.
    pub params: ParamsIterator<'a>,
}

/// Iterator over the `;`-separated parameters of an [`Offered`] extension.
#[derive(Debug, Clone)]
pub struct ParamsIterator<'a> {
    /// Remaining raw parameters.
    iter: Split<'a, char>,
}

impl<'a> ParamsIterator<'a> {
    /// Create a new iterator over parameters specified.
    fn new(params: &'a str) -> Self {
        Self {
            iter: params.split(';'),
        }
    }
}

/// Strips the quotes of a quoted-string parameter value.
fn unquote(value: &str) -> Result<&str, Error> {
    match value.strip_prefix('"') {
        Some(quoted) => quoted.strip_suffix('"').ok_or(Error::UnterminatedQuote),
        None => Ok(value),
    }
}

impl<'a> Iterator for ParamsIterator<'a> {
    type Item = Result<(&'a str, Option<&'a str>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let param = self.iter.next()?.trim();

            if param.is_empty() {
                continue;
            }

            return Some(match param.split_once('=') {
                Some((key, _)) if key.trim().is_empty() => Err(Error::ExpectedParamName),
                Some((key, value)) => match unquote(value.trim()) {
                    Ok("") => Err(Error::ExpectedParamValue),
                    Ok(value) => Ok((key.trim(), Some(value))),
                    Err(e) => Err(e),
                },
                None => Ok((param, None)),
            });
        }
    }
}

/// Iterator over [`Offered`] extensions in a `Sec-WebSocket-Extensions`
/// header, in the order the client listed them.
pub struct ExtensionIterator<'a> {
    /// Remaining raw offers.
    iter: Split<'a, char>,
}

impl<'a> ExtensionIterator<'a> {
    /// Create a new iterator over extensions in a `Sec-WebSocket-Extensions`
    /// header.
    pub fn new(header: &'a str) -> Self {
        ExtensionIterator {
            iter: header.split(','),
        }
    }
}

impl<'a> Iterator for ExtensionIterator<'a> {
    type Item = Result<Offered<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|extension| {
            let (name, params) = extension.split_once(';').unwrap_or((extension, ""));
            let name = name.trim();

            if name.is_empty() {
                Err(Error::ExpectedExtensionName)
            } else {
                Ok(Offered {
                    name,
                    params: ParamsIterator::new(params),
                })
            }
        })
    }
}

/// Builder for one accepted extension in the response header.
pub struct Accepted(Cow<'static, str>);

impl Accepted {
    /// Starts the response entry for `extension_name`.
    pub fn new(extension_name: &'static str) -> Self {
        Self(Cow::Borrowed(extension_name))
    }

    /// Appends `; key` or `; key=value`.
    pub fn add_param(&mut self, key: &str, value: Option<&str>) {
        let buf = self.0.to_mut();

        buf.push_str("; ");
        buf.push_str(key);

        if let Some(value) = value {
            buf.push('=');
            buf.push_str(value);
        }
    }

    /// Returns the finished entry.
    pub fn finish(self) -> String {
        self.0.into_owned()
    }
}
