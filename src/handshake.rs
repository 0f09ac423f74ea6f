//! Construction of the server's `101 Switching Protocols` response.
use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::sha::digest;

/// Status line of a successful upgrade response.
const SWITCHING_PROTOCOLS: &str = "HTTP/1.1 101 Switching Protocols";

/// Computes the `Sec-WebSocket-Accept` value for a client's
/// `Sec-WebSocket-Key`.
#[must_use]
pub fn accept_key(key: &str) -> String {
    STANDARD.encode(digest(key.as_bytes()))
}

/// Picks the first sub-protocol offered by the client that the server
/// supports. The offer is a comma-separated list in order of the client's
/// preference.
pub(crate) fn select_protocol(offered: &str, supported: &[String]) -> Option<String> {
    offered
        .split(',')
        .map(str::trim)
        .find(|candidate| supported.iter().any(|protocol| protocol == candidate))
        .map(ToOwned::to_owned)
}

/// Ordered response headers, serialized in insertion order.
#[derive(Debug, Default, Clone)]
pub(crate) struct Headers {
    /// Header names and values.
    entries: Vec<(&'static str, String)>,
}

impl Headers {
    /// Sets a header, replacing an earlier value of the same name.
    pub fn set(&mut self, name: &'static str, value: impl Into<String>) {
        let value = value.into();

        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Renders the complete response, including the status line and the empty
    /// line terminating the headers.
    pub fn response(&self) -> String {
        format!("{SWITCHING_PROTOCOLS}\r\n{self}\r\n")
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }

        Ok(())
    }
}
