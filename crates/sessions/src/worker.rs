//! Per-session event loop.
//!
//! One task per session consumes its connection's events in emission order and
//! owns the reconnect loop. The task ends when the session is torn down.

use std::sync::Arc;

use {
    tokio::sync::mpsc::UnboundedReceiver,
    tracing::{debug, error, info, warn},
    wagate_protocol::{Credentials, DisconnectCause, ProtocolError, ProtocolEvent},
};

use crate::{
    manager::{Inner, Teardown},
    model::SessionStatus,
    registry::{Resolution, SessionEntry},
    routing, telemetry,
};

pub(crate) async fn run(
    inner: Arc<Inner>,
    entry: Arc<SessionEntry>,
    mut events: UnboundedReceiver<ProtocolEvent>,
) {
    let cancel = entry.cancel_token();
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        let cause = match event {
            Some(ProtocolEvent::Disconnected(cause)) => cause,
            Some(event) => {
                handle_event(&inner, &entry, event).await;
                continue;
            },
            // The client dropped its side without saying why.
            None => DisconnectCause::ConnectionLost,
        };

        if !cause.is_recoverable() {
            info!(session_id = %entry.id, %cause, "session logged out");
            inner.expire(&entry, Teardown::LoggedOut).await;
            break;
        }

        match reconnect(&inner, &entry, &cause).await {
            Some(next) => events = next,
            None => break,
        }
    }
    debug!(session_id = %entry.id, "session worker stopped");
}

async fn handle_event(inner: &Arc<Inner>, entry: &Arc<SessionEntry>, event: ProtocolEvent) {
    match event {
        ProtocolEvent::PairingCode(code) => {
            if entry.set_pairing_code(&code) {
                debug!(session_id = %entry.id, "pairing code issued");
                entry.resolve(Resolution::PairingCode(code));
            } else {
                debug!(session_id = %entry.id, status = %entry.status(), "ignoring pairing code");
            }
        },
        ProtocolEvent::Connected { self_address } => {
            entry.mark_connected(self_address);
            entry.resolve(Resolution::Connected);
            info!(session_id = %entry.id, "session connected");
            if let Err(e) = inner.directory.set_connected(&entry.id, true).await {
                warn!(session_id = %entry.id, error = %e, "failed to update instance state");
            }
        },
        ProtocolEvent::CredentialsUpdated(credentials) => {
            save_credentials(inner, entry, credentials).await;
        },
        ProtocolEvent::Inbound(message) => routing::route_inbound(inner, entry, message),
        ProtocolEvent::Disconnected(_) => {},
    }
}

/// Persist fresh material unless the session was torn down meanwhile, so a
/// late update can't resurrect deleted credentials.
async fn save_credentials(
    inner: &Inner,
    entry: &SessionEntry,
    credentials: Credentials,
) {
    let guard = inner.registry.lock(&entry.id).await;
    if !entry.is_cancelled()
        && let Err(e) = inner.store.save(&entry.id, &credentials).await
    {
        error!(session_id = %entry.id, error = %e, "failed to persist credentials");
    }
    drop(guard);
    inner.registry.release_lock(&entry.id);
}

/// Reconnect with stored credentials. Returns the new connection's events, or
/// `None` once the session has been torn down.
async fn reconnect(
    inner: &Arc<Inner>,
    entry: &Arc<SessionEntry>,
    cause: &DisconnectCause,
) -> Option<UnboundedReceiver<ProtocolEvent>> {
    let cancel = entry.cancel_token();
    entry.set_status(SessionStatus::Disconnected);
    entry.close_handle().await;
    if let Err(e) = inner.directory.set_connected(&entry.id, false).await {
        warn!(session_id = %entry.id, error = %e, "failed to update instance state");
    }
    warn!(session_id = %entry.id, %cause, "session disconnected, reconnecting");

    let policy = &inner.options.reconnect;
    let mut attempt = entry.reconnect_attempts();
    loop {
        let delay = policy.delay(attempt);
        if !delay.is_zero() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {},
            }
        }
        if cancel.is_cancelled() {
            return None;
        }

        let credentials = match inner.store.load(&entry.id).await {
            Ok(Some(credentials)) if !credentials.is_empty() => Some(credentials),
            Ok(_) => {
                info!(session_id = %entry.id, "no stored credentials, abandoning session");
                inner.expire(entry, Teardown::Abandoned).await;
                return None;
            },
            Err(e) => {
                error!(session_id = %entry.id, error = %e, "failed to load credentials");
                None
            },
        };

        attempt += 1;
        entry.begin_reconnect_attempt(attempt);
        telemetry::reconnect_attempt();

        let result = match credentials {
            Some(credentials) => inner.client.connect(&entry.id, credentials).await,
            None => Err(ProtocolError::Connect("credentials unavailable".into())),
        };

        match result {
            Ok(conn) => {
                let guard = inner.registry.lock(&entry.id).await;
                if entry.is_cancelled() {
                    drop(guard);
                    inner.registry.release_lock(&entry.id);
                    // Torn down while connecting; the new connection is ours to close.
                    conn.handle.close().await;
                    return None;
                }
                entry.install_handle(conn.handle);
                drop(guard);
                inner.registry.release_lock(&entry.id);
                info!(session_id = %entry.id, attempt, "reconnected");
                return Some(conn.events);
            },
            Err(ProtocolError::InvalidCredentials) => {
                warn!(session_id = %entry.id, "stored credentials rejected");
                inner.expire(entry, Teardown::LoggedOut).await;
                return None;
            },
            Err(e) => {
                warn!(session_id = %entry.id, attempt, error = %e, "reconnect attempt failed");
                if policy.exhausted(attempt) {
                    warn!(session_id = %entry.id, attempt, "giving up on session, keeping credentials");
                    inner.expire(entry, Teardown::Exhausted).await;
                    return None;
                }
            },
        }
    }
}
