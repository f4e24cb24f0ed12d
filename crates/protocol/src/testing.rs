//! In-memory protocol client for exercising the session lifecycle in tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::sync::{Notify, mpsc},
};

use crate::{
    address::Address,
    client::{Connection, ConnectionHandle, Presence, ProtocolClient, ProtocolError},
    event::{Credentials, ProtocolEvent},
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One connection handed out by [`ScriptedClient`], driven by the test.
pub struct ScriptedConnection {
    pub session_id: String,
    pub credentials: Credentials,
    events: mpsc::UnboundedSender<ProtocolEvent>,
    sent: Mutex<Vec<(Address, String)>>,
    presence: Mutex<Vec<(Address, Presence)>>,
    closes: AtomicUsize,
    fail_sends: AtomicBool,
}

impl ScriptedConnection {
    /// Push an event as if the network produced it. False once the receiver is gone.
    pub fn emit(&self, event: ProtocolEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn sent(&self) -> Vec<(Address, String)> {
        lock(&self.sent).clone()
    }

    pub fn presence_updates(&self) -> Vec<(Address, Presence)> {
        lock(&self.presence).clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionHandle for ScriptedConnection {
    async fn send_text(&self, to: &Address, text: &str) -> Result<String, ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ProtocolError::Send("scripted failure".into()));
        }
        let mut sent = lock(&self.sent);
        sent.push((to.clone(), text.to_string()));
        Ok(format!("MSG{}", sent.len()))
    }

    async fn send_presence(&self, to: &Address, presence: Presence) -> Result<(), ProtocolError> {
        lock(&self.presence).push((to.clone(), presence));
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ClientState {
    connections: Vec<Arc<ScriptedConnection>>,
    failures: VecDeque<ProtocolError>,
    auto_events: Vec<ProtocolEvent>,
}

/// A [`ProtocolClient`] whose connections are fully controlled by the test.
#[derive(Clone, Default)]
pub struct ScriptedClient {
    state: Arc<Mutex<ClientState>>,
    connected: Arc<Notify>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `connect` call fail with `error`. Failures queue up.
    pub fn fail_next_connect(&self, error: ProtocolError) {
        lock(&self.state).failures.push_back(error);
    }

    /// Events emitted on every new connection as soon as it is handed out.
    pub fn auto_emit(&self, events: Vec<ProtocolEvent>) {
        lock(&self.state).auto_events = events;
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn connection(&self, index: usize) -> Option<Arc<ScriptedConnection>> {
        lock(&self.state).connections.get(index).cloned()
    }

    pub fn last_connection(&self) -> Option<Arc<ScriptedConnection>> {
        lock(&self.state).connections.last().cloned()
    }

    pub fn connections_for(&self, session_id: &str) -> Vec<Arc<ScriptedConnection>> {
        lock(&self.state)
            .connections
            .iter()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Wait until at least `count` connections have been handed out.
    pub async fn wait_for_connections(&self, count: usize) -> Option<Arc<ScriptedConnection>> {
        let wait = async {
            loop {
                let notified = self.connected.notified();
                if let Some(conn) = self.connection(count.saturating_sub(1))
                    && self.connect_count() >= count
                {
                    return conn;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.ok()
    }
}

#[async_trait]
impl ProtocolClient for ScriptedClient {
    async fn connect(
        &self,
        session_id: &str,
        credentials: Credentials,
    ) -> Result<Connection, ProtocolError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = {
            let mut state = lock(&self.state);
            if let Some(error) = state.failures.pop_front() {
                return Err(error);
            }
            let conn = Arc::new(ScriptedConnection {
                session_id: session_id.to_string(),
                credentials,
                events: tx,
                sent: Mutex::new(Vec::new()),
                presence: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
                fail_sends: AtomicBool::new(false),
            });
            for event in &state.auto_events {
                conn.emit(event.clone());
            }
            state.connections.push(Arc::clone(&conn));
            conn
        };
        self.connected.notify_waiters();

        Ok(Connection {
            handle: conn,
            events: rx,
        })
    }
}
