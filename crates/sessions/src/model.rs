use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Where a session is in its lifecycle.
///
/// `Pending → Connected → Disconnected → Reconnecting → Connected`, or
/// `Expired` (terminal) after logout, explicit disconnect or abandoned pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Connected,
    Disconnected,
    Reconnecting,
    Expired,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Expired
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub owner_id: Option<String>,
    pub instance_key: Option<String>,
    pub status: SessionStatus,
    pub created_at: u64,
    pub last_activity_at: u64,
    /// Only ever set while `Pending`.
    pub pairing_code: Option<String>,
    pub webhook_target: Option<String>,
    pub self_address: Option<String>,
    pub reconnect_attempts: u32,
}

/// Result of `create_session`: either a code to scan or an already-live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: String,
    pub status: SessionStatus,
    pub pairing_code: Option<String>,
    /// The pairing code rendered as a `data:` URL QR image.
    pub qr_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub message_id: String,
    pub to: String,
}

/// One item of a bulk send request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutboundText {
    pub to: String,
    #[serde(alias = "text")]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemResult {
    pub to: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
