//! The `permessage-deflate` extension, see
//! [RFC7692](https://datatracker.ietf.org/doc/html/rfc7692).
//!
//! The compressor always uses the full 32 KiB window. Offers that restrict the
//! server's window are therefore declined, while any client window can be
//! inflated.
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::{parser::Accepted, Error, ParamsIterator};
use crate::proto::{Message, Role, RSV1};

const PER_MESSAGE_DEFLATE: &str = "permessage-deflate";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

/// Window size of the compressor, as base-2 logarithm.
const MAX_WINDOW_BITS: u8 = 15;

/// Empty stored block a sync flush ends with. Stripped from outgoing and
/// re-appended to incoming payloads.
const TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Parses the value of a max window bits parameter, which must not have
/// leading zeroes and be in the range between 9 and 15.
///
/// This parameter is the base-2 logarithm of the LZ77 sliding window
/// size.
fn parse_window_bits(input: &str) -> Option<u8> {
    match input {
        "9" | "10" | "11" | "12" | "13" | "14" | "15" => input.parse().ok(),
        _ => None,
    }
}

/// Server configuration of the extension.
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Compression level for outgoing messages.
    compression_level: Compression,
    /// Always reset the compressor after each message.
    server_no_context_takeover: bool,
    /// Always ask the client to reset its compressor after each message.
    client_no_context_takeover: bool,
}

impl Configuration {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the compression level of outgoing messages.
    #[must_use]
    pub fn compression_level(mut self, compression_level: Compression) -> Self {
        self.compression_level = compression_level;
        self
    }

    /// Sets whether the server resets its compression context after every
    /// message, even if the client did not ask for it.
    #[must_use]
    pub fn server_no_context_takeover(mut self, server_no_context_takeover: bool) -> Self {
        self.server_no_context_takeover = server_no_context_takeover;
        self
    }

    /// Sets whether the client is asked to reset its compression context after
    /// every message.
    #[must_use]
    pub fn client_no_context_takeover(mut self, client_no_context_takeover: bool) -> Self {
        self.client_no_context_takeover = client_no_context_takeover;
        self
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            compression_level: Compression::default(),
            server_no_context_takeover: false,
            client_no_context_takeover: false,
        }
    }
}

/// Returns an error if `seen` is already set, then sets it.
fn once(seen: &mut bool, name: &'static str) -> Result<(), Error> {
    if *seen {
        return Err(Error::DuplicateParameter(name));
    }
    *seen = true;

    Ok(())
}

impl super::Configuration for Configuration {
    type Extension = Extension;

    fn name() -> &'static str {
        PER_MESSAGE_DEFLATE
    }

    fn accept_client_proposal(
        &self,
        params: ParamsIterator<'_>,
        accepted: &mut Accepted,
    ) -> Result<Option<Self::Extension>, Error> {
        let mut server_no_context_takeover = false;
        let mut client_no_context_takeover = false;
        let mut server_max_window_bits = None;
        let mut client_max_window_bits = false;

        for param in params {
            match param? {
                (SERVER_NO_CONTEXT_TAKEOVER, None) => {
                    once(&mut server_no_context_takeover, SERVER_NO_CONTEXT_TAKEOVER)?;
                }
                (SERVER_NO_CONTEXT_TAKEOVER, Some(_)) => {
                    return Err(Error::ParamDisallowsValue(SERVER_NO_CONTEXT_TAKEOVER));
                }
                (CLIENT_NO_CONTEXT_TAKEOVER, None) => {
                    once(&mut client_no_context_takeover, CLIENT_NO_CONTEXT_TAKEOVER)?;
                }
                (CLIENT_NO_CONTEXT_TAKEOVER, Some(_)) => {
                    return Err(Error::ParamDisallowsValue(CLIENT_NO_CONTEXT_TAKEOVER));
                }
                (SERVER_MAX_WINDOW_BITS, Some(bits)) => {
                    if server_max_window_bits.is_some() {
                        return Err(Error::DuplicateParameter(SERVER_MAX_WINDOW_BITS));
                    }
                    let bits = parse_window_bits(bits)
                        .ok_or(Error::InvalidWindowBits(SERVER_MAX_WINDOW_BITS))?;
                    server_max_window_bits = Some(bits);
                }
                (SERVER_MAX_WINDOW_BITS, None) => {
                    return Err(Error::ParamRequiresValue(SERVER_MAX_WINDOW_BITS));
                }
                (CLIENT_MAX_WINDOW_BITS, bits) => {
                    once(&mut client_max_window_bits, CLIENT_MAX_WINDOW_BITS)?;
                    // Any client window can be inflated with the default one.
                    if let Some(bits) = bits {
                        parse_window_bits(bits)
                            .ok_or(Error::InvalidWindowBits(CLIENT_MAX_WINDOW_BITS))?;
                    }
                }
                (name, _) => return Err(Error::UnknownParameter(name.to_owned())),
            }
        }

        if server_max_window_bits.is_some_and(|bits| bits < MAX_WINDOW_BITS) {
            log::debug!("declining {PER_MESSAGE_DEFLATE} offer with a reduced server window");
            return Ok(None);
        }

        let parameters = Parameters {
            server_no_context_takeover: server_no_context_takeover
                || self.server_no_context_takeover,
            client_no_context_takeover: client_no_context_takeover
                || self.client_no_context_takeover,
        };

        if parameters.server_no_context_takeover {
            accepted.add_param(SERVER_NO_CONTEXT_TAKEOVER, None);
        }
        if parameters.client_no_context_takeover {
            accepted.add_param(CLIENT_NO_CONTEXT_TAKEOVER, None);
        }
        if server_max_window_bits.is_some() {
            accepted.add_param(SERVER_MAX_WINDOW_BITS, Some("15"));
        }

        Ok(Some(Extension::new(
            self.compression_level,
            parameters,
            Role::Server,
        )))
    }
}

/// Parameters agreed on for one connection.
#[derive(Clone, Copy, Debug)]
struct Parameters {
    /// The server resets its compressor after each message.
    server_no_context_takeover: bool,
    /// The client resets its compressor after each message.
    client_no_context_takeover: bool,
}

/// A negotiated `permessage-deflate` session.
pub(crate) struct Extension {
    /// Agreed parameters.
    parameters: Parameters,
    /// Which end of the connection this session compresses for.
    role: Role,
    /// Compressor for outgoing messages.
    compress: Compress,
    /// Decompressor for incoming messages.
    decompress: Decompress,
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extension")
            .field("parameters", &self.parameters)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl Extension {
    /// Creates a session with fresh compression contexts.
    fn new(compression_level: Compression, parameters: Parameters, role: Role) -> Self {
        Self {
            parameters,
            role,
            compress: Compress::new(compression_level, false),
            decompress: Decompress::new(false),
        }
    }

    /// Whether the local compressor is reset after each message.
    fn no_local_context_takeover(&self) -> bool {
        match self.role {
            Role::Client => self.parameters.client_no_context_takeover,
            Role::Server => self.parameters.server_no_context_takeover,
        }
    }

    /// Whether the remote compressor is reset after each message.
    fn no_remote_context_takeover(&self) -> bool {
        match self.role {
            Role::Client => self.parameters.server_no_context_takeover,
            Role::Server => self.parameters.client_no_context_takeover,
        }
    }

    /// Compress the payload of a websocket message.
    #[allow(clippy::cast_possible_truncation)]
    fn compress(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let mut output = Vec::with_capacity(payload.len() / 2 + 64);
        let before_in = self.compress.total_in();

        // 1. Compress all the octets of the payload of the message using DEFLATE,
        //    ending in an empty stored block.
        loop {
            let offset = (self.compress.total_in() - before_in) as usize;
            self.compress
                .compress_vec(&payload[offset..], &mut output, FlushCompress::Sync)?;

            let offset = (self.compress.total_in() - before_in) as usize;
            if offset == payload.len() && output.len() < output.capacity() {
                break;
            }

            output.reserve(output.capacity().max(64));
        }

        // 2. Remove 4 octets (that are 0x00 0x00 0xff 0xff) from the tail end.
        if output.ends_with(&TRAILER) {
            output.truncate(output.len() - TRAILER.len());
        }

        if self.no_local_context_takeover() {
            self.compress.reset();
        }

        Ok(output)
    }

    /// Inflate the payload of a websocket message, failing once the output
    /// grows beyond `max_length`.
    #[allow(clippy::cast_possible_truncation)]
    fn decompress(&mut self, payload: &[u8], max_length: usize) -> Result<Vec<u8>, Error> {
        let mut input = Vec::with_capacity(payload.len() + TRAILER.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&TRAILER);

        let mut output = Vec::with_capacity(payload.len().saturating_mul(2).clamp(64, 1 << 20));
        let before_in = self.decompress.total_in();
        let mut offset = 0;

        loop {
            let before_out = self.decompress.total_out();
            let status =
                self.decompress
                    .decompress_vec(&input[offset..], &mut output, FlushDecompress::Sync)?;

            let consumed = (self.decompress.total_in() - before_in) as usize;
            let progressed = consumed != offset || self.decompress.total_out() != before_out;
            offset = consumed;

            if output.len() > max_length {
                return Err(Error::MessageTooBig);
            }

            if matches!(status, Status::StreamEnd)
                || (offset == input.len() && output.len() < output.capacity())
            {
                break;
            }

            if output.len() == output.capacity() {
                output.reserve(output.capacity());
            } else if !progressed {
                break;
            }
        }

        if self.no_remote_context_takeover() {
            self.decompress.reset(false);
        }

        Ok(output)
    }
}

impl super::Extension for Extension {
    fn name(&self) -> &'static str {
        PER_MESSAGE_DEFLATE
    }

    fn reserved_bits(&self) -> u8 {
        RSV1
    }

    fn process_outgoing(&mut self, mut message: Message) -> Result<Message, Error> {
        message.data = self.compress(&message.data)?.into();
        message.rsv1 = true;

        Ok(message)
    }

    fn process_incoming(
        &mut self,
        mut message: Message,
        max_length: usize,
    ) -> Result<Message, Error> {
        if !message.rsv1 {
            return Ok(message);
        }

        message.data = self.decompress(&message.data, max_length)?.into();
        message.rsv1 = false;

        Ok(message)
    }
}
