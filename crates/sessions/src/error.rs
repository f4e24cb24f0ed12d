use wagate_protocol::{AddressError, ProtocolError};

use crate::{credentials::StoreError, model::SessionStatus};

/// Failures surfaced to callers of the session manager.
///
/// Background failures (reconnects, webhook deliveries, stats) are logged and
/// never turn into one of these.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to create session: {0}")]
    CreationFailure(String),

    #[error("session '{0}' not found or expired")]
    NotFound(String),

    #[error("instance '{instance_key}' does not belong to '{owner_id}'")]
    OwnerMismatch {
        instance_key: String,
        owner_id: String,
    },

    #[error("session '{id}' is not connected (status: {status})")]
    NotConnected { id: String, status: SessionStatus },

    #[error("failed to restore session '{id}': {reason}")]
    RestoreFailed { id: String, reason: String },

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("send failed: {0}")]
    Send(#[from] ProtocolError),

    #[error("credential store: {0}")]
    Store(StoreError),

    #[error("tenant directory: {0}")]
    Directory(#[source] anyhow::Error),
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidId(id) => Self::InvalidSessionId(id),
            other => Self::Store(other),
        }
    }
}
