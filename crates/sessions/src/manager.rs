//! Control surface of one worker: create, query, restart and delete
//! sessions, and the reconnect bookkeeping behind them.

use std::{sync::Arc, time::Duration};

use {
    dashmap::{DashMap, DashSet},
    serde::Deserialize,
    switchboard_common::{SessionId, SessionStatus},
    switchboard_config::{HandshakeConfig, IngestConfig, ProtocolConfig, SwitchboardConfig},
    switchboard_protocol::{
        ClientConfig, ClientConnection, Connector, DisconnectReason, KeyStore, SocketOptions,
        creds_registered,
    },
    switchboard_store::{
        CredentialStore, EventStore, MemorySampler, SessionIngest, SessionKeys, SessionRows,
        SysinfoSampler,
    },
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{
    backoff::{CloseDecision, ReconnectPolicy, RetryState},
    bus::{EventBus, SessionEvent, Subscription},
    clock::{Clock, Jitter, SystemClock, random_jitter},
    error::SessionError,
    handshake::{Handshake, HandshakeMessage, HandshakeMode, HandshakeReply},
    registry::{LiveConnection, SessionHandle, SessionRegistry, SessionSummary},
    supervisor::Supervisor,
};

// ── Options and outcomes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOptions {
    pub tenant_id: String,
    /// Generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub mode: HandshakeMode,
    #[serde(default)]
    pub socket: SocketOptions,
}

#[derive(Debug)]
pub enum CreateOutcome {
    /// Single-shot: the first pairing QR code.
    Qr { session_id: SessionId, code: String },
    /// Single-shot: stored credentials were accepted, no pairing needed.
    Opened { session_id: SessionId },
    Stream {
        session_id: SessionId,
        messages: mpsc::UnboundedReceiver<HandshakeMessage>,
    },
    /// A create for this id is already connecting. Nothing was done.
    InFlight { session_id: SessionId },
}

impl CreateOutcome {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Qr { session_id, .. }
            | Self::Opened { session_id }
            | Self::Stream { session_id, .. }
            | Self::InFlight { session_id } => session_id,
        }
    }
}

enum Started {
    Connected,
    InFlight,
}

/// A connected client waiting for its supervisor.
pub(crate) struct Opened {
    connection: ClientConnection,
    keys: SessionKeys,
    registered: bool,
}

/// Which side effects a teardown performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Teardown {
    logout: bool,
    wipe_credentials: bool,
    /// Remove the session row and its stored traffic instead of only
    /// marking the row inactive.
    forget: bool,
}

impl Teardown {
    /// Handshake abandoned before any login completed.
    pub(crate) const ABANDONED: Self = Self {
        logout: false,
        wipe_credentials: true,
        forget: false,
    };
    pub(crate) const DELETE: Self = Self {
        logout: true,
        wipe_credentials: true,
        forget: true,
    };
    pub(crate) const SOFT_STOP: Self = Self {
        logout: false,
        wipe_credentials: false,
        forget: false,
    };

    pub(crate) fn terminal(wipe_credentials: bool) -> Self {
        Self {
            wipe_credentials,
            ..Self::SOFT_STOP
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub reconnect: ReconnectPolicy,
    pub handshake: HandshakeConfig,
    pub ingest: IngestConfig,
    pub protocol: ProtocolConfig,
}

impl From<&SwitchboardConfig> for ManagerConfig {
    fn from(config: &SwitchboardConfig) -> Self {
        Self {
            reconnect: ReconnectPolicy::from(&config.reconnect),
            handshake: config.handshake.clone(),
            ingest: config.ingest.clone(),
            protocol: config.protocol.clone(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&SwitchboardConfig::default())
    }
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Owns every session of this worker.
pub struct SessionManager {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    credentials: CredentialStore,
    rows: SessionRows,
    events: EventStore,
    sampler: Arc<dyn MemorySampler>,
    clock: Arc<dyn Clock>,
    jitter: Jitter,
    registry: SessionRegistry,
    retries: DashMap<SessionId, RetryState>,
    /// Bumped by restart and shutdown. Reconnect timers compare it with the
    /// value captured when they were scheduled. Teardown drops the entry;
    /// the destroyed flag already stops that handle's timers.
    generations: DashMap<SessionId, u64>,
    restarting: DashSet<SessionId>,
    bus: EventBus<SessionEvent>,
}

impl SessionManager {
    pub fn new(config: ManagerConfig, connector: Arc<dyn Connector>, pool: sqlx::SqlitePool) -> Self {
        let sampler = Arc::new(SysinfoSampler::new(config.ingest.memory_budget_bytes));
        Self {
            config,
            connector,
            credentials: CredentialStore::new(pool.clone()),
            rows: SessionRows::new(pool.clone()),
            events: EventStore::new(pool),
            sampler,
            clock: Arc::new(SystemClock),
            jitter: random_jitter(),
            registry: SessionRegistry::new(),
            retries: DashMap::new(),
            generations: DashMap::new(),
            restarting: DashSet::new(),
            bus: EventBus::new(256),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn rows(&self) -> &SessionRows {
        &self.rows
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn subscribe(&self) -> Subscription<SessionEvent> {
        self.bus.subscribe()
    }

    /// Snapshot of the retry bookkeeping of a session.
    pub fn retry_state(&self, id: &SessionId) -> RetryState {
        self.retries
            .get(id)
            .map(|state| state.value().clone())
            .unwrap_or_default()
    }

    // ── Control surface ──────────────────────────────────────────────────

    pub async fn create_session(
        self: &Arc<Self>,
        opts: CreateOptions,
    ) -> Result<CreateOutcome, SessionError> {
        let session_id = match opts.session_id {
            Some(id) => SessionId::new(id)?,
            None => SessionId::new(uuid::Uuid::new_v4().to_string())?,
        };

        match opts.mode {
            HandshakeMode::SingleShot => {
                let (handshake, reply) = Handshake::single_shot();
                if let Started::InFlight = self
                    .start(session_id.clone(), opts.tenant_id, opts.socket, handshake)
                    .await?
                {
                    return Ok(CreateOutcome::InFlight { session_id });
                }
                match tokio::time::timeout(self.config.handshake.timeout(), reply).await {
                    Ok(Ok(Ok(HandshakeReply::Qr(code)))) => Ok(CreateOutcome::Qr { session_id, code }),
                    Ok(Ok(Ok(HandshakeReply::Open))) => Ok(CreateOutcome::Opened { session_id }),
                    Ok(Ok(Err(e))) => Err(e),
                    Ok(Err(_)) => Err(SessionError::HandshakeFailed(
                        "session closed before the handshake completed".into(),
                    )),
                    Err(_) => {
                        warn!(%session_id, "no qr or open within the handshake timeout");
                        Err(SessionError::HandshakeTimeout)
                    },
                }
            },
            HandshakeMode::Stream => {
                let (handshake, messages) =
                    Handshake::stream(self.config.handshake.max_qr_generations);
                match self
                    .start(session_id.clone(), opts.tenant_id, opts.socket, handshake)
                    .await?
                {
                    Started::InFlight => Ok(CreateOutcome::InFlight { session_id }),
                    Started::Connected => Ok(CreateOutcome::Stream {
                        session_id,
                        messages,
                    }),
                }
            },
        }
    }

    pub async fn get(&self, id: &str) -> Result<Arc<SessionHandle>, SessionError> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub async fn get_status(&self, id: &str) -> Result<SessionStatus, SessionError> {
        Ok(self.get(id).await?.status())
    }

    /// Sessions on this worker, optionally restricted to one tenant.
    pub async fn list(&self, tenant_id: Option<&str>) -> Vec<SessionSummary> {
        self.registry
            .list()
            .await
            .into_iter()
            .filter(|s| tenant_id.is_none_or(|t| s.tenant_id == t))
            .collect()
    }

    /// Log out, wipe credentials and stored traffic, and forget the session.
    pub async fn delete_session(&self, id: &str) -> Result<(), SessionError> {
        let handle = self.get(id).await?;
        info!(session_id = %handle.id, "deleting session");
        self.teardown(&handle, Teardown::DELETE, "deleted").await;
        Ok(())
    }

    /// Drop the current connection and connect again right away.
    pub async fn restart_session(self: &Arc<Self>, id: &str) -> Result<(), SessionError> {
        let handle = self.get(id).await?;
        let Some(_guard) = RestartGuard::acquire(&self.restarting, &handle.id) else {
            return Err(SessionError::AlreadyRestarting(id.to_string()));
        };
        info!(session_id = %handle.id, "restarting session");

        self.bump_generation(&handle.id);
        self.reset_retries(&handle.id);
        if let Some(live) = handle.take_connection() {
            live.cancel();
            live.client.end().await;
        }
        self.publish(&handle, SessionStatus::Connecting, None);

        if !self.registry.begin_reconnect(&handle.id).await {
            debug!(session_id = %handle.id, "reconnect already in flight");
            return Ok(());
        }
        let result = self.open(&handle).await;
        self.registry.finish_connect(&handle.id).await;
        match result {
            Ok(opened) => {
                self.attach(&handle, opened);
                Ok(())
            },
            Err(e) => {
                warn!(session_id = %handle.id, error = %e, "restart failed to connect");
                self.handle_close(&handle, DisconnectReason::ConnectionLost).await;
                Err(e)
            },
        }
    }

    /// Reconnect every active session row this worker owns, unattended.
    pub async fn recover(
        self: &Arc<Self>,
        owns: impl Fn(&SessionId) -> bool,
    ) -> Result<usize, SessionError> {
        let mut started = 0;
        for row in self.rows.list_active().await? {
            let id = match SessionId::new(row.id.clone()) {
                Ok(id) => id,
                Err(e) => {
                    warn!(session_id = %row.id, error = %e, "skipping unusable session row");
                    continue;
                },
            };
            if !owns(&id) {
                continue;
            }
            match self
                .start(id, row.tenant_id, SocketOptions::default(), Handshake::Unattended)
                .await
            {
                Ok(Started::Connected) => started += 1,
                Ok(Started::InFlight) => {},
                Err(e) => warn!(session_id = %row.id, error = %e, "failed to recover session"),
            }
        }
        info!(started, "session recovery finished");
        Ok(started)
    }

    /// Close every connection without touching credentials or rows, so the
    /// next start recovers them.
    pub async fn shutdown(&self) {
        for handle in self.registry.handles().await {
            self.bump_generation(&handle.id);
            if let Some(live) = handle.take_connection() {
                live.cancel();
                live.client.end().await;
            }
        }
    }

    // ── Lifecycle internals ──────────────────────────────────────────────

    async fn start(
        self: &Arc<Self>,
        id: SessionId,
        tenant_id: String,
        socket: SocketOptions,
        handshake: Handshake,
    ) -> Result<Started, SessionError> {
        if !self.registry.begin_create(&id).await? {
            info!(session_id = %id, "session already connecting, ignoring duplicate create");
            return Ok(Started::InFlight);
        }
        if let Err(e) = self.rows.activate(id.as_str(), &tenant_id).await {
            self.registry.finish_connect(&id).await;
            return Err(e.into());
        }

        let handle = Arc::new(SessionHandle::new(
            id.clone(),
            tenant_id,
            socket,
            handshake,
            self.clock.now_ms(),
        ));
        let result = self.open(&handle).await;
        if let Err(e) = self.registry.register(Arc::clone(&handle)).await {
            if let Ok(opened) = result {
                opened.connection.client.end().await;
            }
            return Err(e);
        }
        self.publish(&handle, SessionStatus::Connecting, None);

        match result {
            Ok(opened) => self.attach(&handle, opened),
            Err(e) => {
                warn!(session_id = %id, error = %e, "initial connect failed");
                self.handle_close(&handle, DisconnectReason::ConnectionLost).await;
            },
        }
        Ok(Started::Connected)
    }

    async fn open(&self, handle: &SessionHandle) -> Result<Opened, SessionError> {
        let keys = self.credentials.for_session(handle.id.as_str());
        let creds = keys.load_creds().await;
        let registered = creds.as_ref().is_some_and(creds_registered);
        let protocol = &self.config.protocol;
        let config = ClientConfig {
            session_id: handle.id.to_string(),
            browser: (protocol.browser_name.clone(), protocol.browser_version.clone()),
            connect_timeout: Duration::from_millis(protocol.connect_timeout_ms),
            request_timeout: Duration::from_millis(protocol.request_timeout_ms),
            socket: handle.socket.clone(),
            creds,
        };
        let key_store: Arc<dyn KeyStore> = Arc::new(keys.clone());
        let connection = self.connector.connect(config, key_store).await?;
        debug!(session_id = %handle.id, registered, "client connected");
        Ok(Opened {
            connection,
            keys,
            registered,
        })
    }

    /// Bind a freshly opened client to the session and start pumping it.
    fn attach(self: &Arc<Self>, handle: &Arc<SessionHandle>, opened: Opened) {
        let Opened {
            connection,
            keys,
            registered,
        } = opened;
        if handle.is_destroyed() {
            debug!(session_id = %handle.id, "session destroyed while connecting, closing client");
            tokio::spawn(async move { connection.client.end().await });
            return;
        }

        let live = Arc::new(LiveConnection::new(connection.client, registered));
        if let Some(previous) = handle.set_connection(Arc::clone(&live)) {
            previous.cancel();
        }
        let supervisor = Supervisor {
            manager: Arc::clone(self),
            handle: Arc::clone(handle),
            live,
            keys,
            ingest: SessionIngest::new(
                handle.id.as_str(),
                self.events.clone(),
                Arc::clone(&self.sampler),
                &self.config.ingest,
            ),
            events: connection.events,
        };
        tokio::spawn(supervisor.run());
    }

    /// React to a closed connection: reconnect later, or tear down.
    pub(crate) async fn handle_close(
        self: &Arc<Self>,
        handle: &Arc<SessionHandle>,
        reason: DisconnectReason,
    ) {
        if handle.is_destroyed() {
            return;
        }
        match self.decide(&handle.id, reason) {
            CloseDecision::Retry { delay, attempt } => {
                info!(
                    session_id = %handle.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "scheduling reconnect"
                );
                let status = handle.handshake.lock().await.on_status(SessionStatus::Closing);
                if let Err(abort) = status {
                    self.teardown(handle, Teardown::ABANDONED, abort.reason()).await;
                    return;
                }
                self.publish(handle, SessionStatus::Closing, Some(reason.to_string()));
                self.spawn_retry(Arc::clone(handle), delay);
            },
            decision => self.stop(handle, decision, reason).await,
        }
    }

    fn decide(&self, id: &SessionId, reason: DisconnectReason) -> CloseDecision {
        let mut state = self.retries.entry(id.clone()).or_default();
        self.config
            .reconnect
            .decide(&mut state, reason, self.clock.now_ms(), (self.jitter)())
    }

    async fn stop(&self, handle: &Arc<SessionHandle>, decision: CloseDecision, reason: DisconnectReason) {
        match decision {
            CloseDecision::Destroy { wipe_credentials } => {
                warn!(session_id = %handle.id, code = reason.code(), %reason, "terminal disconnect, destroying session");
                self.teardown(handle, Teardown::terminal(wipe_credentials), &reason.to_string())
                    .await;
            },
            CloseDecision::GiveUp => {
                warn!(
                    session_id = %handle.id,
                    max_retries = self.config.reconnect.max_retries,
                    "reconnect attempts exhausted, stopping session"
                );
                self.teardown(handle, Teardown::SOFT_STOP, "reconnect attempts exhausted")
                    .await;
            },
            CloseDecision::Retry { .. } => {},
        }
    }

    fn spawn_retry(self: &Arc<Self>, handle: Arc<SessionHandle>, delay: Duration) {
        let generation = self.generation(&handle.id);
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.retry(handle, generation, delay).await });
    }

    async fn retry(self: Arc<Self>, handle: Arc<SessionHandle>, generation: u64, mut delay: Duration) {
        loop {
            tokio::time::sleep(delay).await;

            if handle.is_destroyed()
                || self.generation(&handle.id) != generation
                || !self.registry.holds(&handle).await
            {
                debug!(session_id = %handle.id, "stale reconnect timer, skipping");
                return;
            }
            if !self.registry.begin_reconnect(&handle.id).await {
                debug!(session_id = %handle.id, "reconnect already in flight");
                return;
            }
            self.publish(&handle, SessionStatus::Connecting, None);
            let result = self.open(&handle).await;
            self.registry.finish_connect(&handle.id).await;

            let error = match result {
                Ok(opened) => {
                    self.attach(&handle, opened);
                    return;
                },
                Err(e) => e,
            };
            warn!(session_id = %handle.id, error = %error, "reconnect failed");
            let reason = DisconnectReason::ConnectionLost;
            match self.decide(&handle.id, reason) {
                CloseDecision::Retry { delay: next, attempt } => {
                    info!(
                        session_id = %handle.id,
                        attempt,
                        delay_ms = next.as_millis() as u64,
                        "scheduling reconnect"
                    );
                    delay = next;
                },
                decision => {
                    self.stop(&handle, decision, reason).await;
                    return;
                },
            }
        }
    }

    /// Destroy a session. Every step is best-effort; failures are logged
    /// and the remaining steps still run. Only the first call has effect.
    pub(crate) async fn teardown(&self, handle: &Arc<SessionHandle>, mode: Teardown, reason: &str) {
        if !handle.mark_destroyed() {
            return;
        }
        let id = handle.id.clone();
        self.generations.remove(&id);
        self.registry.remove(handle).await;
        self.retries.remove(&id);
        handle.handshake.lock().await.fail(reason);

        if let Some(live) = handle.take_connection() {
            live.cancel();
            if mode.logout
                && let Err(e) = live.client.logout().await
            {
                warn!(session_id = %id, error = %e, "logout failed");
            }
            live.client.end().await;
        }

        if mode.wipe_credentials {
            match self.credentials.wipe(id.as_str()).await {
                Ok(removed) => debug!(session_id = %id, removed, "credentials wiped"),
                Err(e) => warn!(session_id = %id, error = %e, "failed to wipe credentials"),
            }
        }

        if mode.forget {
            if let Err(e) = self.events.purge(id.as_str()).await {
                warn!(session_id = %id, error = %e, "failed to purge stored events");
            }
            if let Err(e) = self.rows.remove(id.as_str()).await {
                warn!(session_id = %id, error = %e, "failed to remove session row");
            }
        } else if let Err(e) = self.rows.deactivate(id.as_str()).await {
            warn!(session_id = %id, error = %e, "failed to deactivate session row");
        }

        info!(session_id = %id, reason, "session destroyed");
        self.publish(handle, SessionStatus::Destroyed, Some(reason.to_string()));
    }

    // ── Bookkeeping ──────────────────────────────────────────────────────

    pub(crate) fn publish(&self, handle: &SessionHandle, status: SessionStatus, reason: Option<String>) {
        self.bus.publish(SessionEvent {
            session_id: handle.id.clone(),
            tenant_id: handle.tenant_id.clone(),
            status,
            reason,
        });
    }

    pub(crate) fn reset_retries(&self, id: &SessionId) {
        if let Some(mut state) = self.retries.get_mut(id) {
            state.reset();
        }
    }

    fn generation(&self, id: &SessionId) -> u64 {
        self.generations.get(id).map(|g| *g).unwrap_or(0)
    }

    fn bump_generation(&self, id: &SessionId) {
        *self.generations.entry(id.clone()).or_insert(0) += 1;
    }
}

/// Holds the per-session restart lock until dropped.
struct RestartGuard<'a> {
    set: &'a DashSet<SessionId>,
    id: SessionId,
}

impl<'a> RestartGuard<'a> {
    fn acquire(set: &'a DashSet<SessionId>, id: &SessionId) -> Option<Self> {
        set.insert(id.clone()).then(|| Self {
            set,
            id: id.clone(),
        })
    }
}

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}
