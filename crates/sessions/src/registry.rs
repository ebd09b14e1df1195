//! In-memory index of live sessions on this worker.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, RwLock as StdRwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    serde::Serialize,
    switchboard_common::{SessionId, SessionStatus},
    switchboard_protocol::{ProtocolClient, ReadyState, SocketOptions},
    tokio::sync::{Mutex, RwLock},
    tokio_util::sync::CancellationToken,
};

use crate::{error::SessionError, handshake::Handshake};

// ── Live connection ──────────────────────────────────────────────────────────

/// One protocol connection of a session, assembled once when the connector
/// hands back a client. A reconnect builds a new one.
pub struct LiveConnection {
    pub client: Arc<dyn ProtocolClient>,
    authenticated: AtomicBool,
    cancel: CancellationToken,
}

impl LiveConnection {
    pub fn new(client: Arc<dyn ProtocolClient>, authenticated: bool) -> Self {
        Self {
            client,
            authenticated: AtomicBool::new(authenticated),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    /// Stop the supervisor pumping this connection's events.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn status(&self) -> SessionStatus {
        match self.client.ready_state() {
            ReadyState::Connecting => SessionStatus::Connecting,
            ReadyState::Open if self.is_authenticated() => SessionStatus::Authenticated,
            ReadyState::Open => SessionStatus::Open,
            ReadyState::Closing | ReadyState::Closed => SessionStatus::Closing,
        }
    }
}

// ── Session handle ───────────────────────────────────────────────────────────

/// A session for its whole lifetime on this worker, across reconnects.
pub struct SessionHandle {
    pub id: SessionId,
    pub tenant_id: String,
    pub created_at: u64,
    pub(crate) socket: SocketOptions,
    connection: StdRwLock<Option<Arc<LiveConnection>>>,
    destroyed: AtomicBool,
    pub(crate) handshake: Mutex<Handshake>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        tenant_id: String,
        socket: SocketOptions,
        handshake: Handshake,
        created_at: u64,
    ) -> Self {
        Self {
            id,
            tenant_id,
            created_at,
            socket,
            connection: StdRwLock::new(None),
            destroyed: AtomicBool::new(false),
            handshake: Mutex::new(handshake),
        }
    }

    pub fn connection(&self) -> Option<Arc<LiveConnection>> {
        self.connection
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_connection(&self, live: Arc<LiveConnection>) -> Option<Arc<LiveConnection>> {
        self.connection
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(live)
    }

    pub(crate) fn take_connection(&self) -> Option<Arc<LiveConnection>> {
        self.connection
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Drop `live` from the slot unless a newer connection replaced it.
    pub(crate) fn release(&self, live: &Arc<LiveConnection>) {
        let mut slot = self.connection.write().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, live)) {
            *slot = None;
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Returns true for the caller that actually flipped the flag.
    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::SeqCst)
    }

    /// Live status: the transport's ready-state, upgraded to `Authenticated`
    /// once the credentials are confirmed.
    pub fn status(&self) -> SessionStatus {
        if self.is_destroyed() {
            return SessionStatus::Destroyed;
        }
        match self.connection() {
            Some(live) => live.status(),
            None => SessionStatus::Closing,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            status: self.status(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub tenant_id: String,
    pub status: SessionStatus,
    pub created_at: u64,
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Entries {
    sessions: HashMap<SessionId, Arc<SessionHandle>>,
    /// Ids with a connect in flight.
    connecting: HashSet<SessionId>,
}

/// Both maps sit behind one lock so that the duplicate check and the
/// insertion happen without another create interleaving.
#[derive(Default)]
pub struct SessionRegistry {
    entries: RwLock<Entries>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for a fresh creation.
    ///
    /// `Ok(false)` means a connect for the id is already in flight and the
    /// caller should do nothing.
    pub async fn begin_create(&self, id: &SessionId) -> Result<bool, SessionError> {
        let mut entries = self.entries.write().await;
        if entries.sessions.contains_key(id) {
            return Err(SessionError::AlreadyExists(id.to_string()));
        }
        Ok(entries.connecting.insert(id.clone()))
    }

    /// Claim `id` for reconnecting an already registered session.
    pub async fn begin_reconnect(&self, id: &SessionId) -> bool {
        self.entries.write().await.connecting.insert(id.clone())
    }

    pub async fn finish_connect(&self, id: &SessionId) {
        self.entries.write().await.connecting.remove(id);
    }

    /// Insert the handle and release its connecting claim.
    pub async fn register(&self, handle: Arc<SessionHandle>) -> Result<(), SessionError> {
        let mut entries = self.entries.write().await;
        entries.connecting.remove(&handle.id);
        if entries.sessions.contains_key(&handle.id) {
            return Err(SessionError::AlreadyExists(handle.id.to_string()));
        }
        entries.sessions.insert(handle.id.clone(), handle);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.entries.read().await.sessions.get(id).cloned()
    }

    /// Whether `handle` is still the registered handle for its id.
    pub async fn holds(&self, handle: &Arc<SessionHandle>) -> bool {
        self.entries
            .read()
            .await
            .sessions
            .get(&handle.id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
    }

    /// Remove `handle`, leaving any newer handle for the same id alone.
    pub async fn remove(&self, handle: &Arc<SessionHandle>) -> bool {
        let mut entries = self.entries.write().await;
        let matches = entries
            .sessions
            .get(&handle.id)
            .is_some_and(|current| Arc::ptr_eq(current, handle));
        if matches {
            entries.sessions.remove(&handle.id);
        }
        matches
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.entries.read().await.sessions.values().cloned().collect()
    }

    /// Snapshot of every session with its live status.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<_> = self.handles().await.iter().map(|h| h.summary()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}
