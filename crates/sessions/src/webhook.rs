//! Outbound delivery of inbound messages to tenant callback endpoints.

use std::time::Duration;

use {
    async_trait::async_trait,
    hmac::{Hmac, Mac},
    secrecy::{ExposeSecret, Secret},
    serde::Serialize,
    sha2::Sha256,
    tracing::debug,
};

pub const SIGNATURE_HEADER: &str = "X-Wagate-Signature";

/// Normalized inbound message as delivered to a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub session_id: String,
    pub sender_address: String,
    pub message: WebhookMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookMessage {
    pub id: String,
    pub timestamp: i64,
    pub text: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid webhook target '{0}'")]
    InvalidTarget(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("endpoint answered {0}")]
    Status(reqwest::StatusCode),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid signing key")]
    Signing,
}

/// Delivers one payload to one target. Callers never retry.
#[async_trait]
pub trait WebhookDispatcher: Send + Sync {
    async fn dispatch(&self, target: &str, payload: &WebhookPayload) -> Result<(), DispatchError>;
}

pub struct NoopDispatcher;

#[async_trait]
impl WebhookDispatcher for NoopDispatcher {
    async fn dispatch(&self, _target: &str, _payload: &WebhookPayload) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// JSON `POST` over HTTP(S), optionally signed with HMAC-SHA256.
pub struct HttpWebhookDispatcher {
    client: reqwest::Client,
    signing_secret: Option<Secret<String>>,
}

impl HttpWebhookDispatcher {
    pub fn new(timeout: Duration, signing_secret: Option<Secret<String>>) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("wagate/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            signing_secret,
        })
    }

    fn sign(&self, body: &[u8]) -> Result<Option<String>, DispatchError> {
        let Some(secret) = &self.signing_secret else {
            return Ok(None);
        };
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|_| DispatchError::Signing)?;
        mac.update(body);
        let digest = mac.finalize().into_bytes();
        Ok(Some(format!("sha256={}", hex::encode(digest))))
    }
}

fn parse_target(target: &str) -> Result<url::Url, DispatchError> {
    let url = url::Url::parse(target).map_err(|_| DispatchError::InvalidTarget(target.into()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(DispatchError::InvalidTarget(target.into())),
    }
}

#[async_trait]
impl WebhookDispatcher for HttpWebhookDispatcher {
    async fn dispatch(&self, target: &str, payload: &WebhookPayload) -> Result<(), DispatchError> {
        let url = parse_target(target)?;
        let body = serde_json::to_vec(payload)?;

        let mut req = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(signature) = self.sign(&body)? {
            req = req.header(SIGNATURE_HEADER, signature);
        }

        let resp = req.body(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DispatchError::Status(status));
        }
        debug!(session_id = %payload.session_id, %status, "webhook delivered");
        Ok(())
    }
}
