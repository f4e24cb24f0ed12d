//! WebSocket client for the protocol sidecar.
//!
//! The sidecar speaks the messaging network's wire protocol. Each session gets
//! its own WebSocket; commands go out as JSON frames tagged with `op`, and the
//! sidecar answers with frames tagged with `event`.

mod client;
pub mod frame;

pub use client::BridgeClient;
