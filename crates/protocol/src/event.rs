use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// Opaque authentication material that lets a connection resume without re-pairing.
///
/// Empty material means the session has never been paired.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials(Vec<u8>);

impl Credentials {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials([REDACTED; {} bytes])", self.0.len())
    }
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The account logged this device out. Credentials are dead.
    LoggedOut,
    ConnectionReset,
    ConnectionLost,
    TimedOut,
    /// Another client took over the connection.
    Replaced,
    /// The server asked for a fresh connection, typically right after pairing.
    RestartRequired,
    BadSession,
    Other(String),
}

impl DisconnectCause {
    /// Everything except logout can be retried with the stored credentials.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::LoggedOut)
    }

    /// Map a network close status code (HTTP-style, as reported by the client library).
    pub fn from_status_code(code: Option<u16>, reason: Option<&str>) -> Self {
        match code {
            Some(401) => Self::LoggedOut,
            Some(408) => Self::TimedOut,
            Some(428) => Self::ConnectionReset,
            Some(440) => Self::Replaced,
            Some(500) => Self::BadSession,
            Some(515) => Self::RestartRequired,
            None if reason.is_none() => Self::ConnectionLost,
            Some(other) => Self::Other(reason.map_or_else(|| format!("status {other}"), str::to_string)),
            None => Self::Other(reason.unwrap_or_default().to_string()),
        }
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::ConnectionReset => f.write_str("connection reset"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Replaced => f.write_str("connection replaced"),
            Self::RestartRequired => f.write_str("restart required"),
            Self::BadSession => f.write_str("bad session"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

/// A message delivered to this connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    /// Chat the message arrived in.
    pub from: Address,
    /// Sent by this account from another device.
    pub from_me: bool,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    pub text: Option<String>,
    /// Content kind as named by the network (`conversation`, `imageMessage`, ...).
    pub kind: String,
}

/// Everything a connection reports, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// A code for a human to scan. May be issued repeatedly while unpaired.
    PairingCode(String),
    Connected { self_address: Option<Address> },
    Disconnected(DisconnectCause),
    /// Fresh credential material to persist.
    CredentialsUpdated(Credentials),
    Inbound(InboundMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_logout_is_unrecoverable() {
        assert!(!DisconnectCause::LoggedOut.is_recoverable());
        assert!(DisconnectCause::ConnectionReset.is_recoverable());
        assert!(DisconnectCause::RestartRequired.is_recoverable());
        assert!(DisconnectCause::Other("boom".into()).is_recoverable());
    }

    #[test]
    fn status_codes_map_to_causes() {
        assert_eq!(
            DisconnectCause::from_status_code(Some(401), None),
            DisconnectCause::LoggedOut
        );
        assert_eq!(
            DisconnectCause::from_status_code(Some(515), Some("restart")),
            DisconnectCause::RestartRequired
        );
        assert_eq!(
            DisconnectCause::from_status_code(None, None),
            DisconnectCause::ConnectionLost
        );
        assert_eq!(
            DisconnectCause::from_status_code(Some(499), None),
            DisconnectCause::Other("status 499".into())
        );
        assert_eq!(
            DisconnectCause::from_status_code(None, Some("stream errored")),
            DisconnectCause::Other("stream errored".into())
        );
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials::new(b"secret-noise".to_vec());
        let shown = format!("{creds:?}");
        assert!(!shown.contains("secret"));
        assert!(shown.contains("12 bytes"));
    }
}
