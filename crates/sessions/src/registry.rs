//! Run-time index of live sessions.
//!
//! The registry holds one [`SessionEntry`] per session id. Entries carry their
//! own small locks for mutable fields; structural changes for one id
//! (create, restore, teardown) are serialized through [`SessionRegistry::lock`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use {
    dashmap::DashMap,
    tokio::sync::{OwnedMutexGuard, oneshot},
    tokio_util::sync::CancellationToken,
    wagate_protocol::{Address, ConnectionHandle},
};

use crate::model::{Session, SessionStatus, now_ms};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What unblocks a pending `create_session` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    PairingCode(String),
    Connected,
}

struct SessionState {
    status: SessionStatus,
    pairing_code: Option<String>,
    last_activity_at: u64,
    self_address: Option<Address>,
    reconnect_attempts: u32,
}

/// One registered session and the resources it exclusively owns.
pub struct SessionEntry {
    pub id: String,
    pub owner_id: Option<String>,
    pub instance_key: Option<String>,
    /// Resolved once at creation; a new session picks up a fresh lookup.
    pub webhook_target: Option<String>,
    pub created_at: u64,
    state: Mutex<SessionState>,
    handle: Mutex<Option<Arc<dyn ConnectionHandle>>>,
    waiter: Mutex<Option<oneshot::Sender<Resolution>>>,
    cancel: CancellationToken,
}

impl SessionEntry {
    pub(crate) fn new(
        id: String,
        owner_id: Option<String>,
        instance_key: Option<String>,
        webhook_target: Option<String>,
        waiter: Option<oneshot::Sender<Resolution>>,
    ) -> Self {
        let now = now_ms();
        Self {
            id,
            owner_id,
            instance_key,
            webhook_target,
            created_at: now,
            state: Mutex::new(SessionState {
                status: SessionStatus::Pending,
                pairing_code: None,
                last_activity_at: now,
                self_address: None,
                reconnect_attempts: 0,
            }),
            handle: Mutex::new(None),
            waiter: Mutex::new(waiter),
            cancel: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.state).status
    }

    pub fn snapshot(&self) -> Session {
        let state = lock(&self.state);
        Session {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            instance_key: self.instance_key.clone(),
            status: state.status,
            created_at: self.created_at,
            last_activity_at: state.last_activity_at,
            pairing_code: state.pairing_code.clone(),
            webhook_target: self.webhook_target.clone(),
            self_address: state.self_address.as_ref().map(ToString::to_string),
            reconnect_attempts: state.reconnect_attempts,
        }
    }

    pub(crate) fn touch(&self) {
        lock(&self.state).last_activity_at = now_ms();
    }

    /// Move to a non-connected status. Pairing codes only survive in `Pending`.
    pub(crate) fn set_status(&self, status: SessionStatus) {
        let mut state = lock(&self.state);
        state.status = status;
        if status != SessionStatus::Pending {
            state.pairing_code = None;
        }
    }

    /// Store a pairing code. Ignored unless the session is `Pending`.
    pub(crate) fn set_pairing_code(&self, code: &str) -> bool {
        let mut state = lock(&self.state);
        if state.status != SessionStatus::Pending {
            return false;
        }
        state.pairing_code = Some(code.to_string());
        true
    }

    pub(crate) fn mark_connected(&self, self_address: Option<Address>) {
        let mut state = lock(&self.state);
        state.status = SessionStatus::Connected;
        state.pairing_code = None;
        state.reconnect_attempts = 0;
        state.last_activity_at = now_ms();
        if self_address.is_some() {
            state.self_address = self_address;
        }
    }

    /// Failed reconnect attempts since the last successful connect.
    pub(crate) fn reconnect_attempts(&self) -> u32 {
        lock(&self.state).reconnect_attempts
    }

    pub(crate) fn begin_reconnect_attempt(&self, attempt: u32) {
        let mut state = lock(&self.state);
        state.status = SessionStatus::Reconnecting;
        state.pairing_code = None;
        state.reconnect_attempts = attempt;
    }

    /// Unblock the creating caller. Only the first resolution gets through.
    pub(crate) fn resolve(&self, resolution: Resolution) -> bool {
        match lock(&self.waiter).take() {
            Some(tx) => tx.send(resolution).is_ok(),
            None => false,
        }
    }

    /// Drop the creating caller's channel so it fails instead of waiting forever.
    pub(crate) fn abandon_waiter(&self) {
        lock(&self.waiter).take();
    }

    /// Install a new connection handle, returning any previous one.
    pub(crate) fn install_handle(
        &self,
        handle: Arc<dyn ConnectionHandle>,
    ) -> Option<Arc<dyn ConnectionHandle>> {
        lock(&self.handle).replace(handle)
    }

    pub(crate) fn handle(&self) -> Option<Arc<dyn ConnectionHandle>> {
        lock(&self.handle).clone()
    }

    /// Close the current handle, if any. Safe to call repeatedly and concurrently:
    /// whoever takes the handle out of the slot is the only one to close it.
    pub(crate) async fn close_handle(&self) {
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            handle.close().await;
        }
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Concurrent map of session id → entry, plus per-id serialization locks.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionEntry>>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Register an entry under its id, returning whatever it replaced.
    pub(crate) fn insert(&self, entry: Arc<SessionEntry>) -> Option<Arc<SessionEntry>> {
        self.sessions.insert(entry.id.clone(), entry)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.remove(id).map(|(_, entry)| entry)
    }

    /// Remove `entry` only if it is still the one registered under its id.
    pub(crate) fn remove_entry(&self, entry: &Arc<SessionEntry>) -> bool {
        self.sessions
            .remove_if(&entry.id, |_, current| Arc::ptr_eq(current, entry))
            .is_some()
    }

    pub fn all(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.entries().iter().map(|e| e.snapshot()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub(crate) fn entries(&self) -> Vec<Arc<SessionEntry>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Serialize structural changes for one session id.
    pub(crate) async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let mutex = Arc::clone(self.locks.entry(id.to_string()).or_default().value());
        mutex.lock_owned().await
    }

    /// Drop the lock slot for `id` once nobody else holds or waits on it.
    pub(crate) fn release_lock(&self, id: &str) {
        self.locks
            .remove_if(id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
