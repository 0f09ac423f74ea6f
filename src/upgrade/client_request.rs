//! A [`Decoder`] for the client's HTTP/1.1 upgrade request.
use bytes::{Buf, BytesMut};
use httparse::Request;
use tokio_util::codec::Decoder;

use super::{Error, UpgradeRequest};
use crate::utf8::parse_str;

/// Returns whether an ASCII byte slice is contained in another one, ignoring
/// capitalization.
fn contains_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty()
        || haystack
            .windows(needle.len())
            .any(|window| window.eq_ignore_ascii_case(needle))
}

/// Checks the headers that make a request a version 13 WebSocket upgrade.
fn validate<'a, F>(header: F) -> Result<(), Error>
where
    F: Fn(&'static str) -> Option<&'a str>,
{
    let find_header = |name| header(name).ok_or(Error::MissingHeader(name));

    let unexpected = |name, expected, actual: &str| Error::UnexpectedHeader {
        name,
        expected,
        actual: actual.to_owned(),
    };

    let upgrade = find_header("Upgrade")?;
    if !upgrade.trim().eq_ignore_ascii_case("websocket") {
        return Err(unexpected("Upgrade", "websocket", upgrade));
    }

    let connection = find_header("Connection")?;
    if !contains_ignore_ascii_case(connection.as_bytes(), b"Upgrade") {
        return Err(unexpected(
            "Connection",
            "string containing Upgrade",
            connection,
        ));
    }

    let version = find_header("Sec-WebSocket-Version")?;
    if version.trim() != "13" {
        return Err(unexpected("Sec-WebSocket-Version", "13", version));
    }

    find_header("Sec-WebSocket-Key")?;

    Ok(())
}

/// Decodes an upgrade request into the [`UpgradeRequest`] a driver is created
/// from. It consumes exactly the request's bytes, anything the client sent
/// after it stays in the buffer.
pub(crate) struct Codec {}

impl Decoder for Codec {
    type Error = crate::Error;
    type Item = UpgradeRequest;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut request = Request::new(&mut headers);
        let status = request.parse(src).map_err(Error::from)?;

        let httparse::Status::Complete(request_len) = status else {
            return Ok(None);
        };

        let fields = || {
            request
                .headers
                .iter()
                .filter_map(|header| Some((header.name, parse_str(header.value).ok()?)))
        };

        validate(|name| {
            fields()
                .find(|(field, _)| field.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })?;
        let upgrade = UpgradeRequest::from_headers(fields())?;

        src.advance(request_len);
        log::debug!("received upgrade request, version {}", upgrade.version);

        Ok(Some(upgrade))
    }
}
