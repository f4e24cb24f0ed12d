use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt},
    tokio::{
        net::TcpStream,
        sync::{mpsc, oneshot},
        task::JoinHandle,
    },
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message},
    tracing::{debug, trace, warn},
    wagate_protocol::{
        Address, Connection, ConnectionHandle, Credentials, Presence, ProtocolClient,
        ProtocolError, ProtocolEvent,
    },
};

use crate::frame::{Incoming, Outgoing};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reply to one request: the sidecar's message id, or its error text.
type PendingTx = oneshot::Sender<Result<Option<String>, String>>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Requests awaiting an ack, keyed by request id.
#[derive(Default)]
struct PendingRequests {
    slots: HashMap<u64, PendingTx>,
}

impl PendingRequests {
    /// Track `reply` under `id`, dropping slots whose caller stopped waiting.
    fn insert(&mut self, id: u64, reply: PendingTx) {
        self.slots.retain(|_, tx| !tx.is_closed());
        self.slots.insert(id, reply);
    }

    fn resolve(&mut self, id: u64, result: Result<Option<String>, String>) {
        if let Some(tx) = self.slots.remove(&id) {
            let _ = tx.send(result);
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

enum Command {
    Request { frame: Outgoing, reply: PendingTx },
    Close,
}

/// [`ProtocolClient`] that opens one sidecar WebSocket per connection.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    url: String,
    request_timeout: Duration,
}

impl BridgeClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    async fn connect(
        &self,
        session_id: &str,
        credentials: Credentials,
    ) -> Result<Connection, ProtocolError> {
        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ProtocolError::Connect(format!("{}: {e}", self.url)))?;

        let hello = serde_json::to_string(&Outgoing::connect(session_id, &credentials))
            .map_err(|e| ProtocolError::Connect(e.to_string()))?;
        ws.send(Message::Text(hello.into()))
            .await
            .map_err(|e| ProtocolError::Connect(e.to_string()))?;
        debug!(session_id, url = %self.url, "bridge connection opened");

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(handler_loop(session_id.to_string(), ws, cmd_rx, event_tx));

        Ok(Connection {
            handle: Arc::new(BridgeConnection {
                cmd_tx,
                closed: AtomicBool::new(false),
                request_timeout: self.request_timeout,
                task: Mutex::new(Some(task)),
            }),
            events: event_rx,
        })
    }
}

struct BridgeConnection {
    cmd_tx: mpsc::Sender<Command>,
    closed: AtomicBool,
    request_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeConnection {
    async fn request(&self, frame: Outgoing) -> Result<Option<String>, ProtocolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request { frame, reply: tx })
            .await
            .map_err(|_| ProtocolError::Closed)?;

        tokio::time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| ProtocolError::Timeout)?
            .map_err(|_| ProtocolError::Closed)?
            .map_err(ProtocolError::Send)
    }
}

#[async_trait]
impl ConnectionHandle for BridgeConnection {
    async fn send_text(&self, to: &Address, text: &str) -> Result<String, ProtocolError> {
        let id = self
            .request(Outgoing::Send {
                request_id: 0,
                to: to.to_string(),
                text: text.to_string(),
            })
            .await?;
        id.ok_or_else(|| ProtocolError::Send("ack carried no message id".into()))
    }

    async fn send_presence(&self, to: &Address, presence: Presence) -> Result<(), ProtocolError> {
        self.request(Outgoing::Presence {
            request_id: 0,
            to: to.to_string(),
            presence: presence.as_str().to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // The handler may already be gone; nothing left to close then.
        let _ = self.cmd_tx.send(Command::Close).await;
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && tokio::time::timeout(self.request_timeout, task).await.is_err()
        {
            warn!("bridge handler did not stop in time");
        }
    }
}

async fn handler_loop(
    session_id: String,
    ws: WsStream,
    mut cmd_rx: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<ProtocolEvent>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut pending = PendingRequests::default();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Request { frame, reply }) => {
                        let id = next_id;
                        next_id += 1;
                        let frame = frame.with_request_id(id);
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(e) => {
                                let _ = reply.send(Err(e.to_string()));
                                continue;
                            },
                        };
                        pending.insert(id, reply);
                        trace!(session_id = %session_id, id, "gateway -> bridge");
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    },
                    Some(Command::Close) | None => {
                        if let Ok(text) = serde_json::to_string(&Outgoing::Close) {
                            let _ = ws_tx.send(Message::Text(text.into())).await;
                        }
                        let _ = ws_tx.close().await;
                        break;
                    },
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let frame: Incoming = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "unparseable bridge frame");
                        continue;
                    },
                };
                match frame {
                    Incoming::Ack { request_id, message_id } => {
                        pending.resolve(request_id, Ok(message_id));
                    },
                    Incoming::Error { request_id: Some(id), message } => {
                        pending.resolve(id, Err(message));
                    },
                    Incoming::Error { request_id: None, message } => {
                        warn!(session_id = %session_id, error = %message, "bridge error");
                    },
                    frame => {
                        let closing = matches!(frame, Incoming::Close { .. });
                        if let Some(event) = frame.into_event()
                            && events.send(event).is_err()
                        {
                            break;
                        }
                        if closing {
                            break;
                        }
                    },
                }
            }
        }
    }
    debug!(session_id = %session_id, abandoned = pending.len(), "bridge connection closed");
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        tokio::net::TcpListener,
        tokio_tungstenite::accept_async,
        wagate_protocol::DisconnectCause,
    };

    /// One-connection sidecar: pairs, acks one send, then logs the device out.
    async fn fake_bridge() -> (String, JoinHandle<Vec<serde_json::Value>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/sessions", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut seen = Vec::new();

            let next = |msg: Message| -> serde_json::Value {
                serde_json::from_str(msg.to_text().unwrap()).unwrap()
            };

            seen.push(next(ws.next().await.unwrap().unwrap()));
            ws.send(Message::Text(r#"{"event":"qr","code":"ABC123"}"#.into()))
                .await
                .unwrap();

            let send = next(ws.next().await.unwrap().unwrap());
            let ack = serde_json::json!({
                "event": "ack",
                "requestId": send["requestId"],
                "messageId": "WAMID.1",
            });
            ws.send(Message::Text(ack.to_string().into())).await.unwrap();
            seen.push(send);

            let send = next(ws.next().await.unwrap().unwrap());
            let err = serde_json::json!({
                "event": "error",
                "requestId": send["requestId"],
                "message": "not on network",
            });
            ws.send(Message::Text(err.to_string().into())).await.unwrap();
            seen.push(send);

            ws.send(Message::Text(
                r#"{"event":"close","statusCode":401,"reason":"logged out"}"#.into(),
            ))
            .await
            .unwrap();
            seen
        });
        (url, server)
    }

    #[tokio::test]
    async fn round_trip_against_sidecar() {
        let (url, server) = fake_bridge().await;
        let client = BridgeClient::new(url);
        let mut conn = client
            .connect("s1", Credentials::new(b"k".to_vec()))
            .await
            .unwrap();

        assert_eq!(
            conn.events.recv().await,
            Some(ProtocolEvent::PairingCode("ABC123".into()))
        );

        let to = Address::from_raw("919876543210@s.whatsapp.net");
        assert_eq!(conn.handle.send_text(&to, "hi").await.unwrap(), "WAMID.1");
        assert!(matches!(
            conn.handle.send_text(&to, "again").await,
            Err(ProtocolError::Send(msg)) if msg == "not on network"
        ));

        assert_eq!(
            conn.events.recv().await,
            Some(ProtocolEvent::Disconnected(DisconnectCause::LoggedOut))
        );

        let seen = server.await.unwrap();
        assert_eq!(seen[0]["op"], "connect");
        assert_eq!(seen[0]["session"], "s1");
        assert_eq!(seen[0]["credentials"], "aw==");
        assert_eq!(seen[1]["op"], "send");
        assert_eq!(seen[1]["to"], "919876543210@s.whatsapp.net");
        assert_eq!(seen[1]["text"], "hi");

        conn.handle.close().await;
        conn.handle.close().await;
        assert!(matches!(
            conn.handle.send_text(&to, "late").await,
            Err(ProtocolError::Closed)
        ));
    }

    #[test]
    fn abandoned_requests_are_pruned() {
        let mut pending = PendingRequests::default();
        let (tx, rx) = oneshot::channel();
        pending.insert(1, tx);
        drop(rx);

        let (tx, mut rx) = oneshot::channel();
        pending.insert(2, tx);
        assert_eq!(pending.len(), 1);

        pending.resolve(2, Ok(Some("WAMID.2".into())));
        assert_eq!(rx.try_recv().unwrap(), Ok(Some("WAMID.2".into())));
        assert_eq!(pending.len(), 0);
        pending.resolve(2, Err("late".into()));
    }

    #[tokio::test]
    async fn close_waits_for_handler_to_stop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let client = BridgeClient::new(url);
        let mut conn = client.connect("s1", Credentials::default()).await.unwrap();
        conn.handle.close().await;

        assert_eq!(
            conn.events.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        );
    }

    #[tokio::test]
    async fn unreachable_bridge_fails_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = BridgeClient::new(format!("ws://{addr}/sessions"));
        assert!(matches!(
            client.connect("s1", Credentials::default()).await,
            Err(ProtocolError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn unanswered_requests_time_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let client = BridgeClient::new(url).with_request_timeout(Duration::from_millis(50));
        let conn = client.connect("s1", Credentials::default()).await.unwrap();
        let to = Address::from_raw("1@s.whatsapp.net");
        assert!(matches!(
            conn.handle.send_presence(&to, Presence::Composing).await,
            Err(ProtocolError::Timeout)
        ));
    }
}
