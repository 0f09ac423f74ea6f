//! A tokio transport for the protocol [`Driver`].
//!
//! [`Builder::accept`] performs the HTTP/1.1 upgrade handshake on an
//! established stream and returns a [`Connection`], which reads from the
//! stream, feeds the driver and hands out the resulting [`Event`]s.
use std::{collections::VecDeque, future::poll_fn, io, pin::Pin};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::FramedRead;

use crate::{
    extensions::Offer,
    proto::{CloseCode, CloseEvent, Config, Data, Driver, Event, Handler, ProtocolError, ReadyState},
    upgrade::client_request,
    Error,
};

/// HTTP/1.1 400 Bad Request response payload.
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

/// Size of the buffer the stream is read into.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Collects a driver's output and events until the connection gets to them.
#[derive(Debug, Default)]
pub struct Outbox {
    /// Bytes to write to the stream.
    output: BytesMut,
    /// Events not handed out yet.
    events: VecDeque<Event>,
}

impl Handler for Outbox {
    fn write(&mut self, bytes: Bytes) {
        self.output.extend_from_slice(&bytes);
    }

    fn on_open(&mut self) {
        self.events.push_back(Event::Open);
    }

    fn on_message(&mut self, data: Data) {
        self.events.push_back(Event::Message(data));
    }

    fn on_error(&mut self, error: &ProtocolError) {
        self.events.push_back(Event::Error(error.to_string()));
    }

    fn on_close(&mut self, event: CloseEvent) {
        self.events.push_back(Event::Close(event));
    }
}

/// Builder for WebSocket server connections.
#[derive(Debug, Default)]
pub struct Builder {
    /// Configuration of every accepted connection.
    config: Config,
}

impl Builder {
    /// Creates a [`Builder`] with the default [`Config`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration of accepted connections.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;

        self
    }

    /// Adds an extension offer to negotiate with clients.
    #[must_use]
    pub fn extension(mut self, offer: Offer) -> Self {
        self.config = self.config.extension(offer);

        self
    }

    /// Performs a HTTP upgrade handshake on an already established stream and
    /// opens a connection on it.
    ///
    /// # Errors
    ///
    /// This method returns an [`Error`] if the request is not a valid upgrade
    /// request, in which case a `400 Bad Request` is written, or if the
    /// client's extension offer cannot be negotiated.
    pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: S,
    ) -> Result<Connection<S>, Error> {
        let mut framed = FramedRead::new(stream, client_request::Codec {});
        let request = poll_fn(|cx| Pin::new(&mut framed).poll_next(cx)).await;

        let request = match request {
            Some(Ok(request)) => request,
            Some(Err(e)) => {
                log::debug!("rejecting upgrade request: {e}");
                framed.get_mut().write_all(BAD_REQUEST).await?;

                return Err(e);
            }
            None => return Err(Error::Io(io::ErrorKind::UnexpectedEof.into())),
        };

        let pipelined = framed.read_buffer_mut().split();
        let mut connection = Connection {
            stream: framed.into_inner(),
            driver: Driver::new(&request, self.config.clone(), Outbox::default()),
            read_buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
        };

        if let Err(e) = connection.driver.start() {
            connection.stream.write_all(BAD_REQUEST).await?;

            return Err(e);
        }

        connection.driver.parse(&pipelined);
        connection.flush().await?;

        Ok(connection)
    }
}

/// An open WebSocket connection on a stream.
#[derive(Debug)]
pub struct Connection<S> {
    /// The underlying stream.
    stream: S,
    /// Protocol state of the connection.
    driver: Driver<Outbox>,
    /// Buffer the stream is read into.
    read_buffer: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Waits for the next event. Returns `None` once the [`Event::Close`] was
    /// handed out.
    ///
    /// # Errors
    ///
    /// This method fails if reading from or writing to the stream fails. The
    /// connection is closed abnormally in that case.
    pub async fn next(&mut self) -> Option<Result<Event, Error>> {
        loop {
            if let Err(e) = self.flush().await {
                self.driver.force_close();

                return Some(Err(e));
            }

            if let Some(event) = self.driver.handler_mut().events.pop_front() {
                return Some(Ok(event));
            }

            if self.driver.ready_state() == ReadyState::Closed {
                return None;
            }

            self.read_buffer.reserve(READ_BUFFER_SIZE);
            match self.stream.read_buf(&mut self.read_buffer).await {
                Ok(0) => self.driver.force_close(),
                Ok(_) => {
                    let chunk = self.read_buffer.split();
                    self.driver.parse(&chunk);
                }
                Err(e) => {
                    self.driver.force_close();

                    return Some(Err(e.into()));
                }
            }
        }
    }

    /// Sends a text message.
    ///
    /// # Errors
    ///
    /// Fails like [`Driver::text`] or if writing to the stream fails.
    pub async fn text(&mut self, text: impl Into<String>) -> Result<(), Error> {
        self.driver.text(text)?;
        self.flush().await
    }

    /// Sends a binary message.
    ///
    /// # Errors
    ///
    /// Fails like [`Driver::binary`] or if writing to the stream fails.
    pub async fn binary(&mut self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.driver.binary(data)?;
        self.flush().await
    }

    /// Sends a ping.
    ///
    /// # Errors
    ///
    /// Fails like [`Driver::ping`] or if writing to the stream fails.
    pub async fn ping(&mut self, payload: impl Into<Bytes>) -> Result<(), Error> {
        self.driver.ping(payload)?;
        self.flush().await
    }

    /// Sends a ping and runs `callback` once the matching pong arrives.
    ///
    /// # Errors
    ///
    /// Fails like [`Driver::ping_with`] or if writing to the stream fails.
    pub async fn ping_with<F>(
        &mut self,
        payload: impl Into<Bytes>,
        callback: F,
    ) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.driver.ping_with(payload, callback)?;
        self.flush().await
    }

    /// Sends a pong.
    ///
    /// # Errors
    ///
    /// Fails like [`Driver::pong`] or if writing to the stream fails.
    pub async fn pong(&mut self, payload: impl Into<Bytes>) -> Result<(), Error> {
        self.driver.pong(payload)?;
        self.flush().await
    }

    /// Starts the closing handshake. Keep calling [`Connection::next`] to
    /// receive the peer's answer.
    ///
    /// # Errors
    ///
    /// Fails like [`Driver::close`] or if writing to the stream fails.
    pub async fn close(&mut self, reason: &str, code: Option<CloseCode>) -> Result<(), Error> {
        self.driver.close(reason, code)?;
        self.flush().await
    }

    /// The protocol driver of this connection.
    pub fn driver(&self) -> &Driver<Outbox> {
        &self.driver
    }

    /// Returns the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Writes pending output to the stream.
    async fn flush(&mut self) -> Result<(), Error> {
        let output = self.driver.handler_mut().output.split();

        if !output.is_empty() {
            self.stream.write_all(&output).await?;
            self.stream.flush().await?;
        }

        Ok(())
    }
}
