use std::sync::Arc;

use {async_trait::async_trait, tokio::sync::mpsc};

use crate::{
    address::Address,
    event::{Credentials, ProtocolEvent},
};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("credentials rejected by the network")]
    InvalidCredentials,
    #[error("connection is closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
    #[error("request timed out")]
    Timeout,
}

/// Chat-state indicator shown to the recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Available,
    Composing,
    Paused,
}

impl Presence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Composing => "composing",
            Self::Paused => "paused",
        }
    }
}

/// Commands accepted by one live connection.
///
/// Implementations serialize concurrent sends themselves and must tolerate
/// `close` being called more than once.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Send a text message, returning the network-assigned message id.
    async fn send_text(&self, to: &Address, text: &str) -> Result<String, ProtocolError>;

    async fn send_presence(&self, to: &Address, presence: Presence) -> Result<(), ProtocolError>;

    async fn close(&self);
}

/// A freshly established connection.
pub struct Connection {
    pub handle: Arc<dyn ConnectionHandle>,
    /// Events for this connection only, in the order the network produced them.
    /// The sender side is dropped when the connection goes away.
    pub events: mpsc::UnboundedReceiver<ProtocolEvent>,
}

/// Opens connections to the messaging network.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Connect with the given credential material. Empty material starts pairing.
    async fn connect(
        &self,
        session_id: &str,
        credentials: Credentials,
    ) -> Result<Connection, ProtocolError>;
}
