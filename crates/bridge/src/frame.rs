//! JSON frames exchanged with the sidecar.

use {
    base64::{Engine as _, engine::general_purpose::STANDARD},
    serde::{Deserialize, Serialize},
    tracing::warn,
    wagate_protocol::{Address, Credentials, DisconnectCause, InboundMessage, ProtocolEvent},
};

/// Gateway → sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Outgoing {
    Connect {
        session: String,
        /// Base64 credential material; empty to start pairing.
        credentials: String,
    },
    #[serde(rename_all = "camelCase")]
    Send {
        request_id: u64,
        to: String,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Presence {
        request_id: u64,
        to: String,
        presence: String,
    },
    Close,
}

impl Outgoing {
    pub fn connect(session: &str, credentials: &Credentials) -> Self {
        Self::Connect {
            session: session.to_string(),
            credentials: STANDARD.encode(credentials.as_bytes()),
        }
    }

    pub(crate) fn with_request_id(mut self, id: u64) -> Self {
        match &mut self {
            Self::Send { request_id, .. } | Self::Presence { request_id, .. } => *request_id = id,
            Self::Connect { .. } | Self::Close => {},
        }
        self
    }
}

/// Sidecar → gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Incoming {
    Qr {
        code: String,
    },
    Open {
        #[serde(default)]
        me: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Close {
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
    },
    Creds {
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    Message {
        id: String,
        from: String,
        #[serde(default)]
        from_me: bool,
        #[serde(default)]
        timestamp: i64,
        #[serde(default)]
        text: Option<String>,
        #[serde(default = "default_kind")]
        kind: String,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        request_id: u64,
        #[serde(default)]
        message_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default)]
        request_id: Option<u64>,
        message: String,
    },
}

fn default_kind() -> String {
    "conversation".into()
}

impl Incoming {
    /// The session event this frame carries, if any. Acks and errors are replies,
    /// not events.
    pub fn into_event(self) -> Option<ProtocolEvent> {
        match self {
            Self::Qr { code } => Some(ProtocolEvent::PairingCode(code)),
            Self::Open { me } => Some(ProtocolEvent::Connected {
                self_address: me.map(Address::from_raw),
            }),
            Self::Close {
                status_code,
                reason,
            } => Some(ProtocolEvent::Disconnected(DisconnectCause::from_status_code(
                status_code,
                reason.as_deref(),
            ))),
            Self::Creds { data } => match STANDARD.decode(data.as_bytes()) {
                Ok(bytes) => Some(ProtocolEvent::CredentialsUpdated(Credentials::new(bytes))),
                Err(e) => {
                    warn!(error = %e, "dropping undecodable credentials frame");
                    None
                },
            },
            Self::Message {
                id,
                from,
                from_me,
                timestamp,
                text,
                kind,
            } => Some(ProtocolEvent::Inbound(InboundMessage {
                id,
                from: Address::from_raw(from),
                from_me,
                timestamp,
                text,
                kind,
            })),
            Self::Ack { .. } | Self::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_frames_are_tagged() {
        let v = serde_json::to_value(Outgoing::connect("s1", &Credentials::new(b"k".to_vec())))
            .unwrap();
        assert_eq!(v, serde_json::json!({"op": "connect", "session": "s1", "credentials": "aw=="}));

        let v = serde_json::to_value(
            Outgoing::Send {
                request_id: 0,
                to: "1@s.whatsapp.net".into(),
                text: "hi".into(),
            }
            .with_request_id(7),
        )
        .unwrap();
        assert_eq!(v["op"], "send");
        assert_eq!(v["requestId"], 7);

        assert_eq!(
            serde_json::to_string(&Outgoing::Close).unwrap(),
            r#"{"op":"close"}"#
        );
    }

    #[test]
    fn close_frames_map_to_causes() {
        let frame: Incoming =
            serde_json::from_str(r#"{"event":"close","statusCode":401,"reason":"logged out"}"#)
                .unwrap();
        assert_eq!(
            frame.into_event(),
            Some(ProtocolEvent::Disconnected(DisconnectCause::LoggedOut))
        );

        let frame: Incoming = serde_json::from_str(r#"{"event":"close","statusCode":428}"#).unwrap();
        assert_eq!(
            frame.into_event(),
            Some(ProtocolEvent::Disconnected(DisconnectCause::ConnectionReset))
        );
    }

    #[test]
    fn message_frame_defaults() {
        let frame: Incoming =
            serde_json::from_str(r#"{"event":"message","id":"M1","from":"9@s.whatsapp.net","text":"hi"}"#)
                .unwrap();
        let Some(ProtocolEvent::Inbound(msg)) = frame.into_event() else {
            panic!("expected inbound message");
        };
        assert_eq!(msg.kind, "conversation");
        assert!(!msg.from_me);
        assert_eq!(msg.text.as_deref(), Some("hi"));
    }

    #[test]
    fn creds_frames_decode_base64() {
        let frame: Incoming = serde_json::from_str(r#"{"event":"creds","data":"aw=="}"#).unwrap();
        assert_eq!(
            frame.into_event(),
            Some(ProtocolEvent::CredentialsUpdated(Credentials::new(b"k".to_vec())))
        );
        let bad: Incoming = serde_json::from_str(r#"{"event":"creds","data":"%%%"}"#).unwrap();
        assert_eq!(bad.into_event(), None);
    }

    #[test]
    fn replies_carry_no_event() {
        let ack: Incoming =
            serde_json::from_str(r#"{"event":"ack","requestId":3,"messageId":"X"}"#).unwrap();
        assert_eq!(ack.clone().into_event(), None);
        assert_eq!(
            ack,
            Incoming::Ack {
                request_id: 3,
                message_id: Some("X".into())
            }
        );
    }
}
