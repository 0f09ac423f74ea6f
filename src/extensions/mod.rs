//! Negotiation and processing of WebSocket extensions.
//!
//! The server holds an ordered [`ExtensionConfiguration`] of [`Offer`]s. During
//! the handshake the client's `Sec-WebSocket-Extensions` header is matched
//! against them, producing the response header value and the [`Extensions`]
//! pipeline of negotiated sessions. Outgoing messages pass through the
//! sessions in negotiation order, incoming messages in reverse order.
pub use self::error::Error;
pub(crate) use self::parser::ExtensionIterator;
use self::parser::{Accepted, ParamsIterator};
use crate::proto::Message;

mod error;
mod parser;
#[cfg(feature = "permessage-deflate")]
pub mod permessage_deflate;

/// Server side negotiation of one extension.
trait Configuration {
    /// The session created when the extension is accepted.
    type Extension;

    /// Name of the extension as negotiated in the `Sec-WebSocket-Extensions`
    /// header.
    fn name() -> &'static str;

    /// Parse extension parameters proposed by the client in the
    /// `Sec-WebSocket-Extensions` header.
    ///
    /// The response parameters should get written to the [`Accepted`]
    /// provided. `Ok(None)` declines this particular offer.
    ///
    /// Invalid or unknown parameters received here must result in an error.
    fn accept_client_proposal(
        &self,
        params: ParamsIterator<'_>,
        accepted: &mut Accepted,
    ) -> Result<Option<Self::Extension>, Error>;
}

/// Capabilities of a negotiated extension session.
pub(crate) trait Extension {
    /// Registered name of the extension.
    fn name(&self) -> &'static str;

    /// Reserved header bits this extension may set.
    fn reserved_bits(&self) -> u8;

    /// Transforms a message before it is framed.
    fn process_outgoing(&mut self, message: Message) -> Result<Message, Error>;

    /// Transforms a reassembled message before it is delivered. The result
    /// must not exceed `max_length` bytes.
    fn process_incoming(&mut self, message: Message, max_length: usize)
        -> Result<Message, Error>;

    /// Releases resources when the connection closes.
    fn close(&mut self) {}
}

/// An extension the server is willing to negotiate.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Offer {
    /// `permessage-deflate` as specified in [RFC7692](https://datatracker.ietf.org/doc/html/rfc7692).
    #[cfg(feature = "permessage-deflate")]
    PerMessageDeflate(permessage_deflate::Configuration),
}

impl Offer {
    /// Registered name of the offered extension.
    fn name(&self) -> &'static str {
        match *self {
            #[cfg(feature = "permessage-deflate")]
            Self::PerMessageDeflate(_) => permessage_deflate::Configuration::name(),
        }
    }

    /// Negotiates one client offer for this extension.
    fn accept(
        &self,
        params: ParamsIterator<'_>,
        accepted: &mut Accepted,
    ) -> Result<Option<Session>, Error> {
        match *self {
            #[cfg(feature = "permessage-deflate")]
            Self::PerMessageDeflate(ref configuration) => Ok(configuration
                .accept_client_proposal(params, accepted)?
                .map(Session::PerMessageDeflate)),
        }
    }
}

/// A negotiated extension session.
#[derive(Debug)]
pub(crate) enum Session {
    /// A `permessage-deflate` session.
    #[cfg(feature = "permessage-deflate")]
    PerMessageDeflate(permessage_deflate::Extension),
}

impl Extension for Session {
    fn name(&self) -> &'static str {
        match *self {
            #[cfg(feature = "permessage-deflate")]
            Self::PerMessageDeflate(ref session) => session.name(),
        }
    }

    fn reserved_bits(&self) -> u8 {
        match *self {
            #[cfg(feature = "permessage-deflate")]
            Self::PerMessageDeflate(ref session) => session.reserved_bits(),
        }
    }

    fn process_outgoing(&mut self, message: Message) -> Result<Message, Error> {
        match *self {
            #[cfg(feature = "permessage-deflate")]
            Self::PerMessageDeflate(ref mut session) => session.process_outgoing(message),
        }
    }

    fn process_incoming(
        &mut self,
        message: Message,
        max_length: usize,
    ) -> Result<Message, Error> {
        match *self {
            #[cfg(feature = "permessage-deflate")]
            Self::PerMessageDeflate(ref mut session) => {
                session.process_incoming(message, max_length)
            }
        }
    }

    fn close(&mut self) {
        match *self {
            #[cfg(feature = "permessage-deflate")]
            Self::PerMessageDeflate(ref mut session) => session.close(),
        }
    }
}

/// Ordered set of extensions a server attempts to negotiate. By default, all
/// extensions are disabled.
#[derive(Clone, Debug, Default)]
pub struct ExtensionConfiguration {
    /// Offers in order of preference.
    offers: Vec<Offer>,
}

impl ExtensionConfiguration {
    /// Enables `permessage-deflate` with the given configuration.
    #[cfg(feature = "permessage-deflate")]
    #[must_use]
    pub fn permessage_deflate(mut self, configuration: permessage_deflate::Configuration) -> Self {
        self.push(Offer::PerMessageDeflate(configuration));

        self
    }

    /// Appends an offer.
    pub fn push(&mut self, offer: Offer) {
        self.offers.push(offer);
    }

    /// Whether no extension is enabled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    /// Generate the value of the `Sec-WebSocket-Extensions` response header
    /// and the negotiated pipeline for the client's offers.
    ///
    /// Offers for unsupported extensions are ignored. The first acceptable
    /// offer per extension wins, and an extension is skipped if it would share
    /// a reserved bit with one accepted before it.
    pub(crate) fn accept_client_proposals(
        &self,
        client_extensions: ExtensionIterator<'_>,
    ) -> Result<(Option<String>, Extensions), Error> {
        let mut agreed_proposals: Vec<String> = Vec::new();
        let mut extensions = Extensions::default();

        for offered in client_extensions {
            let offered = offered?;

            let Some(offer) = self.offers.iter().find(|offer| offer.name() == offered.name)
            else {
                continue;
            };

            // Suggesting multiple possible parameters for the same extension is possible.
            // The first accepted one has the highest priority.
            if extensions.sessions.iter().any(|s| s.name() == offered.name) {
                continue;
            }

            let mut accepted = Accepted::new(offer.name());
            let Some(session) = offer.accept(offered.params, &mut accepted)? else {
                continue;
            };

            if session.reserved_bits() & extensions.reserved_bits() != 0 {
                log::debug!("declining {} as its reserved bits are taken", offered.name);
                continue;
            }

            extensions.sessions.push(session);
            agreed_proposals.push(accepted.finish());
        }

        let proposals = if agreed_proposals.is_empty() {
            None
        } else {
            Some(agreed_proposals.join(", "))
        };

        Ok((proposals, extensions))
    }
}

/// The negotiated extension pipeline of one connection.
#[derive(Debug, Default)]
pub(crate) struct Extensions {
    /// Sessions in negotiation order.
    sessions: Vec<Session>,
    /// Whether [`Extensions::close`] ran.
    closed: bool,
}

impl Extensions {
    /// Union of the reserved bits owned by the negotiated extensions.
    pub fn reserved_bits(&self) -> u8 {
        self.sessions
            .iter()
            .fold(0, |bits, session| bits | session.reserved_bits())
    }

    /// Whether a frame with `opcode` may carry the reserved bits `rsv`.
    /// Only the opening frame of a message may carry negotiated bits.
    pub fn valid_frame_rsv(&self, opcode: u8, rsv: u8) -> bool {
        let allowed = if matches!(opcode, 1 | 2) {
            self.reserved_bits()
        } else {
            0
        };

        rsv & !allowed == 0
    }

    /// Runs an outgoing message through every session in negotiation order.
    pub fn process_outgoing(&mut self, message: Message) -> Result<Message, Error> {
        self.sessions
            .iter_mut()
            .try_fold(message, |message, session| session.process_outgoing(message))
    }

    /// Runs an incoming message through every session in reverse negotiation
    /// order.
    pub fn process_incoming(
        &mut self,
        message: Message,
        max_length: usize,
    ) -> Result<Message, Error> {
        self.sessions.iter_mut().rev().try_fold(message, |message, session| {
            session.process_incoming(message, max_length)
        })
    }

    /// Closes every session. Subsequent calls do nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        self.closed = true;
        for session in &mut self.sessions {
            session.close();
        }
    }

    /// Names of the negotiated extensions, in order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.sessions.iter().map(|session| session.name())
    }
}
