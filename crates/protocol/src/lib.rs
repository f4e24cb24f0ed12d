//! Boundary between the session manager and the messaging-network client.
//!
//! The network protocol itself (framing, encryption, multi-device pairing) lives
//! behind [`ProtocolClient`]. A client turns credential material into a live
//! [`Connection`]: a [`ConnectionHandle`] for commands plus an ordered stream of
//! [`ProtocolEvent`]s for that one connection.

pub mod address;
pub mod client;
pub mod event;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use {
    address::{Address, AddressError, AddressRules},
    client::{Connection, ConnectionHandle, Presence, ProtocolClient, ProtocolError},
    event::{Credentials, DisconnectCause, InboundMessage, ProtocolEvent},
};
