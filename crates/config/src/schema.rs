/// Config schema types (server, credentials, database, webhook, messaging, sessions, bridge).
use std::path::PathBuf;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, Serializer},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WagateConfig {
    pub server: ServerConfig,
    pub credentials: CredentialsConfig,
    pub database: DatabaseConfig,
    pub webhook: WebhookConfig,
    pub messaging: MessagingConfig,
    pub sessions: SessionsConfig,
    pub bridge: BridgeConfig,
}

fn serialize_option_secret<S: Serializer>(
    value: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(secret) => serializer.serialize_some(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Bearer token required on `/api` routes. `WAGATE_TOKEN` takes precedence.
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_token: Option<Secret<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8000,
            api_token: None,
        }
    }
}

/// Where per-session credential material lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    /// One directory per session id.
    #[default]
    File,
    /// A single embedded sled database.
    Sled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub backend: CredentialBackend,
    /// Root directory (file backend) or database path (sled backend).
    /// Defaults to `<data_dir>/auth`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite URL for instance records and message stats.
    /// Defaults to `sqlite://<data_dir>/wagate.db?mode=rwc`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Fallback callback URL for tenants without one. `WEBHOOK_URL` takes precedence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_url: Option<String>,
    pub timeout_secs: u64,
    /// When set, deliveries carry an `X-Wagate-Signature: sha256=<hex>` header.
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub signing_secret: Option<Secret<String>>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            default_url: None,
            timeout_secs: 10,
            signing_secret: None,
        }
    }
}

/// Outbound addressing and pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Prepended to bare numbers that don't already start with it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_country_code: Option<String>,
    pub address_suffix: String,
    pub typing_indicator: bool,
    pub typing_delay_ms: u64,
    pub bulk_delay_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            default_country_code: Some("91".into()),
            address_suffix: "s.whatsapp.net".into(),
            typing_indicator: false,
            typing_delay_ms: 5_000,
            bulk_delay_ms: 2_000,
        }
    }
}

/// What happens to an owner's previous session when they create a new one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupersedePolicy {
    /// Leave the previous connection running; it fails independently.
    #[default]
    Keep,
    /// Tear the previous session down before registering the new one.
    ClosePrevious,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Consecutive failed attempts before giving up. `None` retries forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// How long `create` waits for a pairing code. `None` waits indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_timeout_secs: Option<u64>,
    pub supersede: SupersedePolicy,
    pub reconnect: ReconnectConfig,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            pairing_timeout_secs: Some(120),
            supersede: SupersedePolicy::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Protocol sidecar endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub url: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787/sessions".into(),
        }
    }
}
