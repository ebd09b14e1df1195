//! WebSocket bridge to a protocol sidecar.
//!
//! The sidecar runs the messaging protocol itself; this side exchanges JSON
//! frames with it. One WebSocket per session:
//!
//! - `hello` (out): identity, socket overrides and the stored credentials
//! - `batch` (in): one [`EventBatch`]
//! - `keysGet` / `keysSet` (in): key-store access, answered with `keysResult`
//! - `request` (out) / `response` (in): commands correlated by id
//!
//! Pausing reads stops polling the socket, so the sidecar sees TCP
//! backpressure instead of an unbounded in-process queue.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    base64::{Engine, engine::general_purpose::STANDARD as B64},
    futures::{SinkExt, StreamExt},
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tokio::sync::{Mutex, mpsc, oneshot, watch},
    tokio_tungstenite::tungstenite::Message as WsMessage,
    tokio_util::sync::CancellationToken,
    tracing::{debug, trace, warn},
};

use crate::{
    ProtocolError,
    client::{
        ClientConfig, ClientConnection, Connector, FlowControl, KeyStore, ProtocolClient,
        ReadyState, SocketOptions,
    },
    disconnect::DisconnectReason,
    events::{ConnectionState, ConnectionUpdate, EventBatch, MessageKey},
};

/// Buffered batches between the socket reader and the session pump.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Outbound<'a> {
    #[serde(rename_all = "camelCase")]
    Hello {
        session_id: &'a str,
        browser: [&'a str; 2],
        socket: &'a SocketOptions,
        creds: Option<&'a Value>,
    },
    Request {
        id: u64,
        method: &'a str,
        params: Value,
    },
    KeysResult {
        id: u64,
        data: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Inbound {
    Batch {
        events: EventBatch,
    },
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    KeysGet { id: u64, blob_id: String },
    #[serde(rename_all = "camelCase")]
    KeysSet {
        blob_id: String,
        #[serde(default)]
        data: Option<String>,
    },
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// [`Connector`] that opens one sidecar WebSocket per session.
#[derive(Debug, Clone)]
pub struct BridgeConnector {
    base_url: String,
}

impl BridgeConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn session_url(&self, session_id: &str) -> String {
        format!(
            "{}/sessions/{session_id}",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn connect(
        &self,
        config: ClientConfig,
        keys: Arc<dyn KeyStore>,
    ) -> Result<ClientConnection, ProtocolError> {
        let url = self.session_url(&config.session_id);
        debug!(url = %url, "connecting to protocol bridge");

        let (ws, _) = tokio::time::timeout(
            config.effective_connect_timeout(),
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| ProtocolError::ConnectTimeout)??;
        let (mut sink, mut stream) = ws.split();

        let hello = serde_json::to_string(&Outbound::Hello {
            session_id: &config.session_id,
            browser: [config.browser.0.as_str(), config.browser.1.as_str()],
            socket: &config.socket,
            creds: config.creds.as_ref(),
        })?;
        sink.send(WsMessage::Text(hello.into())).await?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (paused_tx, mut paused_rx) = watch::channel(false);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let state = Arc::new(AtomicU8::new(STATE_CONNECTING));
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = out_rx.recv() => msg,
                    _ = writer_cancel.cancelled() => None,
                };
                let Some(msg) = msg else {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                };
                if let Err(e) = sink.send(msg).await {
                    warn!(error = %e, "bridge write failed");
                    break;
                }
            }
        });

        let reader = Reader {
            session_id: config.session_id.clone(),
            keys,
            events: events_tx,
            outbound: out_tx.clone(),
            pending: Arc::clone(&pending),
            state: Arc::clone(&state),
        };
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut close_reason = DisconnectReason::ConnectionLost;
            loop {
                // Backpressure gate: while paused the socket is not polled.
                while *paused_rx.borrow() {
                    tokio::select! {
                        changed = paused_rx.changed() => if changed.is_err() { return },
                        _ = reader_cancel.cancelled() => break,
                    }
                }
                let next = tokio::select! {
                    next = stream.next() => next,
                    _ = reader_cancel.cancelled() => {
                        close_reason = DisconnectReason::ConnectionClosed;
                        break;
                    },
                };
                match next {
                    Some(Ok(WsMessage::Text(text))) => {
                        if reader.handle_frame(&text).await.is_break() {
                            return;
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {},
                    Some(Err(e)) => {
                        warn!(session_id = %reader.session_id, error = %e, "bridge read failed");
                        break;
                    },
                }
            }
            reader.finish(close_reason).await;
        });

        let client = Arc::new(BridgeClient {
            outbound: out_tx,
            pending,
            next_id: AtomicU64::new(1),
            state,
            paused: paused_tx,
            cancel,
            request_timeout: config.request_timeout,
        });

        Ok(ClientConnection {
            client,
            events: events_rx,
        })
    }
}

struct Reader {
    session_id: String,
    keys: Arc<dyn KeyStore>,
    events: mpsc::Sender<EventBatch>,
    outbound: mpsc::UnboundedSender<WsMessage>,
    pending: PendingMap,
    state: Arc<AtomicU8>,
}

impl Reader {
    async fn handle_frame(&self, text: &str) -> std::ops::ControlFlow<()> {
        use std::ops::ControlFlow;

        trace!(session_id = %self.session_id, raw = %text, "bridge -> client");
        let frame: Inbound = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "dropping malformed bridge frame");
                return ControlFlow::Continue(());
            },
        };

        match frame {
            Inbound::Batch { events } => {
                if let Some(conn) = events.connection_update.as_ref().and_then(|u| u.connection) {
                    let next = match conn {
                        ConnectionState::Connecting => STATE_CONNECTING,
                        ConnectionState::Open => STATE_OPEN,
                        ConnectionState::Close => STATE_CLOSED,
                    };
                    self.state.store(next, Ordering::SeqCst);
                }
                if self.events.send(events).await.is_err() {
                    // Nobody consumes this session's events anymore.
                    return ControlFlow::Break(());
                }
            },
            Inbound::Response { id, result, error } => {
                if let Some(tx) = self.pending.lock().await.remove(&id) {
                    let _ = tx.send(match error {
                        Some(e) => Err(e),
                        None => Ok(result.unwrap_or(Value::Null)),
                    });
                } else {
                    warn!(id, "received response for unknown request id");
                }
            },
            Inbound::KeysGet { id, blob_id } => {
                let data = self.keys.get(&blob_id).await.map(|bytes| B64.encode(bytes));
                if let Ok(frame) = serde_json::to_string(&Outbound::KeysResult { id, data }) {
                    let _ = self.outbound.send(WsMessage::Text(frame.into()));
                }
            },
            Inbound::KeysSet { blob_id, data } => {
                let result = match data.map(|d| B64.decode(d)) {
                    Some(Ok(bytes)) => self.keys.set(&blob_id, &bytes).await,
                    Some(Err(e)) => Err(anyhow::anyhow!("invalid base64: {e}")),
                    None => self.keys.delete(&blob_id).await,
                };
                if let Err(e) = result {
                    warn!(session_id = %self.session_id, blob_id = %blob_id, error = %e, "key-store write failed");
                }
            },
        }
        ControlFlow::Continue(())
    }

    /// Socket gone: fail pending requests and make sure the session sees a
    /// close event.
    async fn finish(self, reason: DisconnectReason) {
        let previous = self.state.swap(STATE_CLOSED, Ordering::SeqCst);
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err("connection closed".into()));
        }
        if previous != STATE_CLOSED {
            debug!(session_id = %self.session_id, %reason, "bridge socket ended");
            let _ = self
                .events
                .send(EventBatch::connection(ConnectionUpdate::closed(reason)))
                .await;
        }
    }
}

/// [`ProtocolClient`] backed by a bridge WebSocket.
pub struct BridgeClient {
    outbound: mpsc::UnboundedSender<WsMessage>,
    pending: PendingMap,
    next_id: AtomicU64,
    state: Arc<AtomicU8>,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    request_timeout: Duration,
}

impl BridgeClient {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = serde_json::to_string(&Outbound::Request { id, method, params })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        trace!(method, id, "client -> bridge");
        if self.outbound.send(WsMessage::Text(payload.into())).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ProtocolError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(ProtocolError::Remote(e)),
            Ok(Err(_)) => Err(ProtocolError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ProtocolError::RequestTimeout(method.to_string()))
            },
        }
    }
}

impl FlowControl for BridgeClient {
    fn pause_reads(&self) {
        self.paused.send_replace(true);
    }

    fn resume_reads(&self) {
        self.paused.send_replace(false);
    }

    fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    fn ready_state(&self) -> ReadyState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTING => ReadyState::Connecting,
            STATE_OPEN => ReadyState::Open,
            STATE_CLOSING => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.request("logout", Value::Null).await.map(|_| ())
    }

    async fn query(&self, node: Value) -> Result<Value, ProtocolError> {
        self.request("query", node).await
    }

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<(), ProtocolError> {
        self.request("readMessages", serde_json::to_value(keys)?)
            .await
            .map(|_| ())
    }

    async fn send_message(&self, jid: &str, content: Value) -> Result<Value, ProtocolError> {
        self.request(
            "sendMessage",
            serde_json::json!({ "jid": jid, "content": content }),
        )
        .await
    }

    async fn end(&self) {
        let _ = self.state.compare_exchange(
            STATE_OPEN,
            STATE_CLOSING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let _ = self.state.compare_exchange(
            STATE_CONNECTING,
            STATE_CLOSING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_url_joins_cleanly() {
        let c = BridgeConnector::new("ws://127.0.0.1:7400/");
        assert_eq!(c.session_url("s1"), "ws://127.0.0.1:7400/sessions/s1");
    }

    #[test]
    fn parses_inbound_frames() {
        let frame: Inbound = serde_json::from_str(
            r#"{"type":"batch","events":{"connection.update":{"qr":"2@xyz"}}}"#,
        )
        .unwrap();
        match frame {
            Inbound::Batch { events } => {
                assert_eq!(
                    events.connection_update.and_then(|u| u.qr).as_deref(),
                    Some("2@xyz")
                );
            },
            other => panic!("unexpected frame {other:?}"),
        }

        let frame: Inbound =
            serde_json::from_str(r#"{"type":"keysGet","id":7,"blobId":"pre-key-1"}"#).unwrap();
        assert!(matches!(frame, Inbound::KeysGet { id: 7, ref blob_id } if blob_id == "pre-key-1"));
    }

    #[test]
    fn hello_frame_shape() {
        let socket = SocketOptions::default();
        let raw = serde_json::to_value(Outbound::Hello {
            session_id: "s1",
            browser: ["Switchboard", "1.0"],
            socket: &socket,
            creds: None,
        })
        .unwrap();
        assert_eq!(raw["type"], "hello");
        assert_eq!(raw["sessionId"], "s1");
        assert_eq!(raw["browser"][0], "Switchboard");
    }
}
