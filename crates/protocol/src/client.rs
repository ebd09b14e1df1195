use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tokio::sync::mpsc,
};

use crate::{ProtocolError, events::{EventBatch, MessageKey}};

/// Blob id under which the credential document is stored.
pub const CREDS_BLOB_ID: &str = "creds";

/// Underlying socket ready-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Read-side flow control of the client's transport.
pub trait FlowControl: Send + Sync {
    /// Stop reading from the network socket.
    fn pause_reads(&self);
    fn resume_reads(&self);
    fn is_paused(&self) -> bool;
}

/// Live handle to one protocol connection.
#[async_trait]
pub trait ProtocolClient: FlowControl {
    fn ready_state(&self) -> ReadyState;

    /// Log the device out on the service side. Emits a close event.
    async fn logout(&self) -> Result<(), ProtocolError>;

    async fn query(&self, node: Value) -> Result<Value, ProtocolError>;

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<(), ProtocolError>;

    async fn send_message(&self, jid: &str, content: Value) -> Result<Value, ProtocolError>;

    /// Close the socket without logging out. Idempotent.
    async fn end(&self);
}

/// Per-session key material backing the client's signal state.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Missing or unreadable blobs yield `None`.
    async fn get(&self, blob_id: &str) -> Option<Vec<u8>>;
    async fn set(&self, blob_id: &str, data: &[u8]) -> anyhow::Result<()>;
    async fn delete(&self, blob_id: &str) -> anyhow::Result<()>;
}

/// Caller-supplied socket tuning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SocketOptions {
    pub connect_timeout_ms: Option<u64>,
    pub keep_alive_interval_ms: Option<u64>,
    pub mark_online_on_connect: Option<bool>,
    pub sync_full_history: Option<bool>,
}

/// Connection-time configuration handed to a [`Connector`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub session_id: String,
    /// Identity strings announced to the service (name, version).
    pub browser: (String, String),
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub socket: SocketOptions,
    /// Previously stored credential document, if any.
    pub creds: Option<Value>,
}

impl ClientConfig {
    /// Connect timeout after applying the socket override.
    pub fn effective_connect_timeout(&self) -> Duration {
        self.socket
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.connect_timeout)
    }
}

/// A freshly opened client plus its ordered event stream.
pub struct ClientConnection {
    pub client: Arc<dyn ProtocolClient>,
    pub events: mpsc::Receiver<EventBatch>,
}

/// Factory for protocol clients.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: ClientConfig,
        keys: Arc<dyn KeyStore>,
    ) -> Result<ClientConnection, ProtocolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_override_wins() {
        let mut cfg = ClientConfig {
            session_id: "s1".into(),
            browser: ("Switchboard".into(), "1".into()),
            connect_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(30),
            socket: SocketOptions::default(),
            creds: None,
        };
        assert_eq!(cfg.effective_connect_timeout(), Duration::from_secs(20));
        cfg.socket.connect_timeout_ms = Some(500);
        assert_eq!(cfg.effective_connect_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn socket_options_parse_camel_case() {
        let opts: SocketOptions =
            serde_json::from_str(r#"{"markOnlineOnConnect":false,"syncFullHistory":true}"#)
                .unwrap();
        assert_eq!(opts.mark_online_on_connect, Some(false));
        assert_eq!(opts.sync_full_history, Some(true));
        assert!(opts.keep_alive_interval_ms.is_none());
    }
}
