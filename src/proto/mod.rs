//! This module contains the server side of the [RFC6455](https://datatracker.ietf.org/doc/html/rfc6455)
//! framing protocol, driven by [`Driver`].
#[cfg(feature = "permessage-deflate")]
pub(crate) use self::{frame::RSV1, types::Role};
pub(crate) use self::message::Message;
#[cfg(test)]
pub(crate) use self::types::OpCode;
pub use self::{
    driver::{Driver, Handler},
    error::ProtocolError,
    types::{CloseCode, CloseEvent, Config, Data, Event, InvalidCloseCode, ReadyState},
};

mod driver;
mod error;
mod frame;
mod message;
mod reader;
mod types;
