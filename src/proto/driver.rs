//! The per-connection protocol state machine of a WebSocket server.
//!
//! A [`Driver`] performs no I/O. Bytes received from the transport are handed
//! to [`Driver::parse`], and every serialized frame is handed back through
//! [`Handler::write`]. Application events are delivered synchronously to the
//! same [`Handler`], in the order the bytes causing them were received.
use std::collections::{HashMap, VecDeque};

use bytes::{Buf, Bytes, BytesMut};

use super::{
    error::ProtocolError,
    frame::{Frame, FIN, LENGTH, MASK, MAX_CONTROL_PAYLOAD, OPCODE, RSV1, RSV2, RSV3},
    message::Message,
    reader::ByteReader,
    types::{CloseCode, CloseEvent, Config, Data, OpCode, ReadyState},
};
use crate::{
    extensions::{self, ExtensionIterator, Extensions, Offer},
    handshake::{self, Headers},
    mask, rand,
    upgrade::UpgradeRequest,
    utf8, Error,
};

/// Longest close reason that fits into a close frame next to the status code.
const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD as usize - 2;

/// Receiver of a connection's output and events.
///
/// Only [`Handler::write`] is required. The event callbacks default to
/// ignoring the event.
pub trait Handler {
    /// Writes serialized bytes to the transport. Called once per frame, and
    /// once for the handshake response.
    fn write(&mut self, bytes: Bytes);

    /// The handshake response was written and the connection is open.
    fn on_open(&mut self) {}

    /// A complete message was received.
    fn on_message(&mut self, _data: Data) {}

    /// The connection failed. [`Handler::on_close`] follows immediately.
    fn on_error(&mut self, _error: &ProtocolError) {}

    /// The connection is closed. Called exactly once per connection.
    fn on_close(&mut self, _event: CloseEvent) {}
}

/// Callback run when the pong answering a ping arrives.
type PingCallback = Box<dyn FnOnce() + Send>;

/// Position of the parser within the current frame.
#[derive(Debug)]
enum Stage {
    /// Expecting the first header byte.
    Opcode,
    /// Expecting the byte with the mask bit and the 7-bit length.
    Length(Frame),
    /// Expecting a 16- or 64-bit extended length of this many bytes.
    ExtendedLength(Frame, usize),
    /// Expecting the masking key.
    MaskingKey(Frame),
    /// Expecting the payload.
    Payload(Frame),
    /// The connection was shut down, input is ignored.
    Closed,
}

/// Server side protocol driver of one WebSocket connection.
pub struct Driver<H> {
    /// Receiver of output and events.
    handler: H,
    /// Configuration this connection was accepted with.
    config: Config,
    /// Current lifecycle phase.
    ready_state: ReadyState,
    /// The client's `Sec-WebSocket-Key`.
    key: String,
    /// `hybi-` followed by the requested protocol version.
    version: String,
    /// Negotiated sub-protocol.
    protocol: Option<String>,
    /// The client's extension offer.
    offered_extensions: Option<String>,
    /// Handshake response headers.
    headers: Headers,
    /// The negotiated extension pipeline.
    extensions: Extensions,
    /// Received bytes not parsed yet.
    reader: ByteReader,
    /// Parser position.
    stage: Stage,
    /// Message being reassembled.
    message: Option<Message>,
    /// Frames requested before the connection opened.
    queue: VecDeque<(OpCode, Bytes)>,
    /// Ping callbacks keyed by the ping payload.
    ping_callbacks: HashMap<Bytes, PingCallback>,
}

impl<H: Handler> Driver<H> {
    /// Creates the driver for an accepted upgrade request.
    ///
    /// The sub-protocol is selected immediately. Extensions are negotiated
    /// when the connection is [started](Driver::start).
    pub fn new(request: &UpgradeRequest, config: Config, handler: H) -> Self {
        let protocol = request
            .protocol
            .as_deref()
            .and_then(|offered| handshake::select_protocol(offered, &config.protocols));

        let mut headers = Headers::default();
        headers.set("Upgrade", "websocket");
        headers.set("Connection", "Upgrade");
        headers.set("Sec-WebSocket-Accept", handshake::accept_key(&request.key));
        if let Some(protocol) = &protocol {
            headers.set("Sec-WebSocket-Protocol", protocol.as_str());
        }

        Self {
            handler,
            config,
            ready_state: ReadyState::Connecting,
            key: request.key.clone(),
            version: format!("hybi-{}", request.version),
            protocol,
            offered_extensions: request.extensions.clone(),
            headers,
            extensions: Extensions::default(),
            reader: ByteReader::default(),
            stage: Stage::Opcode,
            message: None,
            queue: VecDeque::new(),
            ping_callbacks: HashMap::new(),
        }
    }

    /// Adds an extension offer to negotiate during the handshake.
    ///
    /// # Errors
    ///
    /// This method fails with [`Error::AlreadyStarted`] once the handshake was
    /// performed.
    pub fn add_extension(&mut self, offer: Offer) -> Result<(), Error> {
        if self.ready_state != ReadyState::Connecting {
            return Err(Error::AlreadyStarted);
        }

        self.config.extensions.push(offer);

        Ok(())
    }

    /// Completes the handshake: negotiates extensions, writes the
    /// `101 Switching Protocols` response and opens the connection. Frames
    /// queued while connecting are sent in order, then bytes received while
    /// connecting are parsed.
    ///
    /// # Errors
    ///
    /// This method fails with [`Error::AlreadyStarted`] if the connection is
    /// not connecting. If the client's extension offer is invalid the
    /// connection is failed with a protocol error, which is also returned.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.ready_state != ReadyState::Connecting {
            return Err(Error::AlreadyStarted);
        }

        let offer = self
            .offered_extensions
            .as_deref()
            .filter(|offer| !offer.trim().is_empty());

        let negotiated = match offer {
            Some(offer) => self
                .config
                .extensions
                .accept_client_proposals(ExtensionIterator::new(offer)),
            None => Ok((None, Extensions::default())),
        };

        let (accepted, extensions) = match negotiated {
            Ok(negotiated) => negotiated,
            Err(e) => {
                let error = ProtocolError::Negotiation(e);
                self.fail(&error);

                return Err(error.into());
            }
        };

        if let Some(accepted) = accepted {
            self.headers.set("Sec-WebSocket-Extensions", accepted);
        }
        self.extensions = extensions;

        log::debug!(
            "accepted {}, protocol {:?}, extensions {:?}",
            self.version,
            self.protocol,
            self.extensions.names().collect::<Vec<_>>()
        );

        self.handler.write(Bytes::from(self.headers.response()));
        self.ready_state = ReadyState::Open;

        while let Some((opcode, payload)) = self.queue.pop_front() {
            if self.frame(opcode, payload).is_err() {
                break;
            }
        }

        if self.ready_state == ReadyState::Open {
            self.handler.on_open();
        }
        self.advance();

        Ok(())
    }

    /// Feeds bytes received from the transport.
    ///
    /// Bytes received before [`Driver::start`] are buffered and parsed once
    /// the connection opens. Input after the connection closed is discarded.
    pub fn parse(&mut self, chunk: &[u8]) {
        if self.ready_state == ReadyState::Closed {
            return;
        }

        self.reader.put(chunk);

        if self.ready_state != ReadyState::Connecting {
            self.advance();
        }
    }

    /// Sends a text message.
    ///
    /// # Errors
    ///
    /// This method fails with [`Error::AlreadyClosed`] if the connection is
    /// closing or closed, or with [`Error::Protocol`] if an extension failed
    /// to process the message.
    pub fn text(&mut self, text: impl Into<String>) -> Result<(), Error> {
        self.send(OpCode::Text, Bytes::from(text.into()))
    }

    /// Sends a binary message.
    ///
    /// # Errors
    ///
    /// Fails like [`Driver::text`].
    pub fn binary(&mut self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.send(OpCode::Binary, data.into())
    }

    /// Sends a ping.
    ///
    /// # Errors
    ///
    /// This method fails with [`Error::AlreadyClosed`] if the connection is
    /// closing or closed, or with [`Error::Protocol`] if the payload is longer
    /// than 125 bytes.
    pub fn ping(&mut self, payload: impl Into<Bytes>) -> Result<(), Error> {
        self.send(OpCode::Ping, payload.into())
    }

    /// Sends a ping and runs `callback` once a pong with the exact same
    /// payload is received. A callback registered earlier for the same payload
    /// is replaced.
    ///
    /// # Errors
    ///
    /// Fails like [`Driver::ping`], in which case the callback is dropped.
    pub fn ping_with<F>(&mut self, payload: impl Into<Bytes>, callback: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let payload = payload.into();
        self.send(OpCode::Ping, payload.clone())?;
        self.ping_callbacks.insert(payload, Box::new(callback));

        Ok(())
    }

    /// Sends an unsolicited pong.
    ///
    /// # Errors
    ///
    /// Fails like [`Driver::ping`].
    pub fn pong(&mut self, payload: impl Into<Bytes>) -> Result<(), Error> {
        self.send(OpCode::Pong, payload.into())
    }

    /// Starts the closing handshake with `code`, by default
    /// [`CloseCode::NORMAL_CLOSURE`].
    ///
    /// While connecting, the connection is closed right away without sending
    /// a frame. While open, a close frame is sent and the connection closes
    /// once the peer answers it.
    ///
    /// # Errors
    ///
    /// This method fails with [`Error::AlreadyClosed`] if the connection is
    /// already closing or closed.
    pub fn close(&mut self, reason: &str, code: Option<CloseCode>) -> Result<(), Error> {
        let code = code.unwrap_or(CloseCode::NORMAL_CLOSURE);

        match self.ready_state {
            ReadyState::Connecting => {
                self.discard();
                self.ready_state = ReadyState::Closed;
                log::debug!("closed before opening with {code}");
                self.handler.on_close(CloseEvent {
                    code,
                    reason: reason.to_owned(),
                });

                Ok(())
            }
            ReadyState::Open => {
                self.ready_state = ReadyState::Closing;
                self.extensions.close();
                log::debug!("closing with {code}");
                self.send_frame(close_frame(code, reason));

                Ok(())
            }
            ReadyState::Closing | ReadyState::Closed => Err(Error::AlreadyClosed),
        }
    }

    /// Closes the connection immediately because the transport went away. No
    /// frame is sent and the close event reports
    /// [`CloseCode::ABNORMAL_CLOSURE`].
    pub fn force_close(&mut self) {
        if self.ready_state == ReadyState::Closed {
            return;
        }

        self.discard();
        self.extensions.close();
        self.ready_state = ReadyState::Closed;
        log::debug!("transport closed without close handshake");
        self.handler.on_close(CloseEvent {
            code: CloseCode::ABNORMAL_CLOSURE,
            reason: String::new(),
        });
    }

    /// The current lifecycle phase.
    pub fn ready_state(&self) -> ReadyState {
        self.ready_state
    }

    /// The client's `Sec-WebSocket-Key`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The protocol version, e.g. `hybi-13`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The negotiated sub-protocol, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Names of the negotiated extensions, in negotiation order.
    pub fn extensions(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.extensions.names()
    }

    /// The handler receiving output and events.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The handler receiving output and events.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Queues or sends a frame on behalf of the application.
    fn send(&mut self, opcode: OpCode, payload: Bytes) -> Result<(), Error> {
        if opcode.is_control() && payload.len() as u64 > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::InvalidControlFrameLength(payload.len() as u64).into());
        }

        match self.ready_state {
            ReadyState::Connecting => {
                self.queue.push_back((opcode, payload));

                Ok(())
            }
            ReadyState::Open => self.frame(opcode, payload),
            ReadyState::Closing | ReadyState::Closed => Err(Error::AlreadyClosed),
        }
    }

    /// Runs a message through the extension pipeline and sends it as a single
    /// final frame. Control frames bypass the pipeline.
    fn frame(&mut self, opcode: OpCode, payload: Bytes) -> Result<(), Error> {
        let mut message = Message::new(opcode, payload);

        if opcode.is_message() {
            message = match self.extensions.process_outgoing(message) {
                Ok(message) => message,
                Err(e) => {
                    let error = ProtocolError::Extension(e);
                    self.fail(&error);

                    return Err(error.into());
                }
            };
        }

        let mut frame = Frame::new(message.opcode, message.data);
        frame.rsv1 = message.rsv1;
        frame.rsv2 = message.rsv2;
        frame.rsv3 = message.rsv3;
        self.send_frame(frame);

        Ok(())
    }

    /// Serializes a frame, masking it if configured, and writes it.
    fn send_frame(&mut self, mut frame: Frame) {
        if self.config.masking {
            frame = frame.with_mask(rand::get_mask());
        }

        let mut dst = BytesMut::new();
        frame.encode(&mut dst);
        log::trace!("sending {:?} frame of {} bytes", frame.opcode, frame.length);

        self.handler.write(dst.freeze());
    }

    /// Parses buffered input until it runs out or the connection shuts down.
    fn advance(&mut self) {
        loop {
            let needed = match &self.stage {
                Stage::Opcode | Stage::Length(_) => 1,
                Stage::ExtendedLength(_, bytes) => *bytes,
                Stage::MaskingKey(_) => 4,
                // The length was checked against `max_length` before
                Stage::Payload(frame) => usize::try_from(frame.length).unwrap_or(usize::MAX),
                Stage::Closed => return,
            };

            let Some(bytes) = self.reader.read(needed) else {
                return;
            };

            let result = match std::mem::replace(&mut self.stage, Stage::Opcode) {
                Stage::Opcode => self.parse_opcode(bytes[0]),
                Stage::Length(frame) => self.parse_length(frame, bytes[0]),
                Stage::ExtendedLength(frame, _) => self.parse_extended_length(frame, bytes),
                Stage::MaskingKey(mut frame) => {
                    let mut key = [0; 4];
                    key.copy_from_slice(&bytes);
                    frame.masking_key = Some(key);

                    Ok(Stage::Payload(frame))
                }
                Stage::Payload(frame) => self.emit_frame(frame, bytes).map(|()| Stage::Opcode),
                Stage::Closed => {
                    self.stage = Stage::Closed;
                    return;
                }
            };

            match result {
                Ok(stage) if self.ready_state != ReadyState::Closed => self.stage = stage,
                Ok(_) => {}
                Err(error) => self.fail(&error),
            }
        }
    }

    /// Parses the first header byte of a frame.
    fn parse_opcode(&mut self, octet: u8) -> Result<Stage, ProtocolError> {
        let rsv = octet & (RSV1 | RSV2 | RSV3);
        let opcode = octet & OPCODE;

        if !self.extensions.valid_frame_rsv(opcode, rsv) {
            return Err(ProtocolError::InvalidRsv {
                rsv1: rsv & RSV1 != 0,
                rsv2: rsv & RSV2 != 0,
                rsv3: rsv & RSV3 != 0,
            });
        }

        let mut frame = Frame::new(OpCode::try_from(opcode)?, Bytes::new());
        frame.is_final = octet & FIN == FIN;
        frame.rsv1 = rsv & RSV1 != 0;
        frame.rsv2 = rsv & RSV2 != 0;
        frame.rsv3 = rsv & RSV3 != 0;

        if frame.opcode.is_control() && !frame.is_final {
            return Err(ProtocolError::FragmentedControlFrame(opcode));
        }

        if self.message.is_some() && frame.opcode.is_opening() {
            return Err(ProtocolError::UnfinishedMessage);
        }

        Ok(Stage::Length(frame))
    }

    /// Parses the mask bit and the 7-bit length.
    fn parse_length(&mut self, mut frame: Frame, octet: u8) -> Result<Stage, ProtocolError> {
        frame.masked = octet & MASK == MASK;
        let length = octet & LENGTH;
        let masked = frame.masked;

        let stage = if u64::from(length) <= MAX_CONTROL_PAYLOAD {
            frame.length = length.into();
            self.check_frame_length(&frame)?;

            payload_stage(frame)
        } else {
            Stage::ExtendedLength(frame, if length == 126 { 2 } else { 8 })
        };

        if self.config.require_masking && !masked {
            return Err(ProtocolError::UnmaskedFrame);
        }

        Ok(stage)
    }

    /// Parses a 16- or 64-bit big-endian extended length.
    fn parse_extended_length(
        &mut self,
        mut frame: Frame,
        mut bytes: BytesMut,
    ) -> Result<Stage, ProtocolError> {
        frame.length = if bytes.len() == 2 {
            bytes.get_u16().into()
        } else {
            bytes.get_u64()
        };

        if frame.opcode.is_control() && frame.length > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::InvalidControlFrameLength(frame.length));
        }

        self.check_frame_length(&frame)?;

        Ok(payload_stage(frame))
    }

    /// Fails if the frame would grow its message beyond `max_length`.
    fn check_frame_length(&self, frame: &Frame) -> Result<(), ProtocolError> {
        let buffered = match &self.message {
            Some(message) if frame.opcode.is_message() => message.len() as u64,
            _ => 0,
        };

        if buffered.saturating_add(frame.length) > self.config.max_length as u64 {
            return Err(ProtocolError::MessageTooBig);
        }

        Ok(())
    }

    /// Handles a completely received frame.
    fn emit_frame(&mut self, mut frame: Frame, mut payload: BytesMut) -> Result<(), ProtocolError> {
        if let Some(key) = frame.masking_key {
            mask::frame(key, &mut payload, 0);
        }
        frame.payload = payload.freeze();
        log::trace!(
            "received {:?} frame of {} bytes, final: {}",
            frame.opcode,
            frame.length,
            frame.is_final
        );

        match frame.opcode {
            OpCode::Continuation => match &mut self.message {
                Some(message) => message.push_frame(&frame),
                None => return Err(ProtocolError::UnexpectedContinuation),
            },
            OpCode::Text | OpCode::Binary => self.message = Some(Message::start(&frame)),
            OpCode::Close | OpCode::Ping | OpCode::Pong => {}
        }

        if frame.is_final && frame.opcode.is_message() {
            return self.emit_message();
        }

        match frame.opcode {
            OpCode::Close => {
                let (code, reason) = close_status(&frame.payload);
                self.shutdown(code, reason, None);
            }
            OpCode::Ping => self.send_frame(Frame::new(OpCode::Pong, frame.payload)),
            OpCode::Pong => {
                if let Some(callback) = self.ping_callbacks.remove(&frame.payload) {
                    callback();
                }
            }
            OpCode::Continuation | OpCode::Text | OpCode::Binary => {}
        }

        Ok(())
    }

    /// Delivers the reassembled message after the extension pipeline
    /// processed it.
    fn emit_message(&mut self) -> Result<(), ProtocolError> {
        let Some(mut message) = self.message.take() else {
            return Ok(());
        };
        message.read();

        let message = self
            .extensions
            .process_incoming(message, self.config.max_length)
            .map_err(|e| match e {
                extensions::Error::MessageTooBig => ProtocolError::MessageTooBig,
                e => ProtocolError::Extension(e),
            })?;

        if message.data.len() > self.config.max_length {
            return Err(ProtocolError::MessageTooBig);
        }

        let data = if message.opcode == OpCode::Text {
            Data::Text(utf8::parse_str(&message.data)?.to_owned())
        } else {
            Data::Binary(message.data)
        };

        self.handler.on_message(data);

        Ok(())
    }

    /// Drops all parser and queue state.
    fn discard(&mut self) {
        self.stage = Stage::Closed;
        self.message = None;
        self.reader.clear();
        self.queue.clear();
        self.ping_callbacks.clear();
    }

    /// Closes the connection, answering with a close frame if it was open.
    fn shutdown(&mut self, code: CloseCode, reason: String, error: Option<&ProtocolError>) {
        self.discard();

        let send_close_frame = self.ready_state == ReadyState::Open;
        self.ready_state = ReadyState::Closing;
        self.extensions.close();

        if send_close_frame {
            self.send_frame(close_frame(code, &reason));
        }

        self.ready_state = ReadyState::Closed;
        log::debug!("connection closed with {code}");

        if let Some(error) = error {
            self.handler.on_error(error);
        }
        self.handler.on_close(CloseEvent { code, reason });
    }

    /// Shuts the connection down because of a fatal error.
    fn fail(&mut self, error: &ProtocolError) {
        if self.ready_state == ReadyState::Closed {
            return;
        }

        log::debug!("failing connection: {error}");
        self.shutdown(error.close_code(), error.to_string(), Some(error));
    }
}

impl<H: std::fmt::Debug> std::fmt::Debug for Driver<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("handler", &self.handler)
            .field("ready_state", &self.ready_state)
            .field("version", &self.version)
            .field("protocol", &self.protocol)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

/// The stage following a complete length.
fn payload_stage(frame: Frame) -> Stage {
    if frame.masked {
        Stage::MaskingKey(frame)
    } else {
        Stage::Payload(frame)
    }
}

/// Builds a close frame, truncating the reason at a character boundary to fit
/// into a control frame.
fn close_frame(code: CloseCode, reason: &str) -> Frame {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = BytesMut::with_capacity(2 + end);
    payload.extend_from_slice(&u16::from(code).to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);

    Frame::new(OpCode::Close, payload.freeze())
}

/// Reads the status code and reason of a received close frame. Malformed
/// payloads turn into a protocol error code.
fn close_status(payload: &[u8]) -> (CloseCode, String) {
    match payload {
        [] => (CloseCode::NORMAL_CLOSURE, String::new()),
        [_] => (CloseCode::PROTOCOL_ERROR, String::new()),
        [high, low, reason @ ..] => {
            let code = CloseCode::try_from(u16::from_be_bytes([*high, *low]))
                .unwrap_or(CloseCode::PROTOCOL_ERROR);

            match utf8::parse_str(reason) {
                Ok(reason) => (code, reason.to_owned()),
                Err(_) => (CloseCode::PROTOCOL_ERROR, String::new()),
            }
        }
    }
}
