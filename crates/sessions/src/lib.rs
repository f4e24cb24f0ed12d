//! Session lifecycle management for many concurrent messaging-network connections.
//!
//! Each session owns one protocol connection, its credential material and a
//! worker task that handles the connection's events in order. The
//! [`SessionManager`] is the only writer of the [`SessionRegistry`]; it creates,
//! pairs, reconnects and tears sessions down, and routes inbound messages to
//! the tenant's webhook and the message stats.
//!
//! Persistent state is limited to credential material ([`credentials`]); the
//! registry is rebuilt from it on restart.

pub mod credentials;
pub mod directory;
pub mod error;
pub mod manager;
pub mod model;
pub mod pairing;
pub mod registry;
mod routing;
pub mod stats;
mod telemetry;
pub mod webhook;
mod worker;

pub use {
    credentials::{
        CredentialStore, FileCredentialStore, SledCredentialStore, StoreError, validate_session_id,
    },
    directory::{NoopDirectory, SqliteTenantDirectory, TenantBinding, TenantDirectory},
    error::SessionError,
    manager::{
        ManagerOptions, ReconnectPolicy, RestoreReport, SessionManager, SessionManagerBuilder,
    },
    model::{
        BulkItemResult, CreatedSession, OutboundText, SentMessage, Session, SessionStatus,
        StatusReport,
    },
    registry::SessionRegistry,
    stats::{MessageStatsRecorder, MonthlyStats, NoopStats, SqliteMessageStats, current_month},
    webhook::{
        DispatchError, HttpWebhookDispatcher, NoopDispatcher, WebhookDispatcher, WebhookMessage,
        WebhookPayload,
    },
};
