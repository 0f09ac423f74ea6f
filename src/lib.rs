#![warn(
    clippy::pedantic,
    clippy::missing_docs_in_private_items,
    clippy::missing_errors_doc,
    rustdoc::broken_intra_doc_links
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod error;
pub mod extensions;
pub mod handshake;
mod mask;
pub mod proto;
mod rand;
#[cfg(feature = "server")]
pub mod server;
mod sha;
pub mod upgrade;
mod utf8;

pub use error::Error;
pub use extensions::{ExtensionConfiguration, Offer};
pub use proto::{
    CloseCode, CloseEvent, Config, Data, Driver, Event, Handler, ProtocolError, ReadyState,
};
#[cfg(feature = "server")]
pub use server::Builder as ServerBuilder;
pub use upgrade::UpgradeRequest;
