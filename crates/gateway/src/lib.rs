//! HTTP surface over the session manager.
//!
//! Lifecycle:
//! 1. Load config, open the credential store and the database
//! 2. Build the session manager around the protocol bridge
//! 3. Restore every session with stored credentials
//! 4. Serve the `/api/v1` routes until Ctrl-C, then drain the sessions
//!
//! Handlers are transport only; every session decision lives in
//! `wagate-sessions`.

pub mod auth;
pub mod error;
#[cfg(feature = "prometheus")]
pub mod metrics;
pub mod routes;
pub mod server;
pub mod state;

pub use {
    server::{build_gateway_app, open_database, start_gateway},
    state::GatewayState,
};
