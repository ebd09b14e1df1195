use std::{sync::Arc, time::Instant};

use {
    switchboard_routing::shard_for, switchboard_sessions::SessionManager,
    tokio_util::sync::CancellationToken,
};

// ── Worker identity ──────────────────────────────────────────────────────────

/// Position of this process in the worker fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub index: usize,
    pub count: usize,
}

impl WorkerIdentity {
    pub fn new(index: usize, count: usize) -> Self {
        Self {
            index,
            count: count.max(1),
        }
    }

    /// A single worker owning every session.
    pub fn standalone() -> Self {
        Self::new(0, 1)
    }

    pub fn owner_of(&self, session_id: &str) -> usize {
        shard_for(session_id, self.count)
    }

    pub fn owns(&self, session_id: &str) -> bool {
        self.owner_of(session_id) == self.index
    }

    /// Random id that routes back to this worker, for creates that did not
    /// name one.
    pub fn fresh_session_id(&self) -> String {
        loop {
            let id = uuid::Uuid::new_v4().to_string();
            if self.owns(&id) {
                return id;
            }
        }
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

pub struct GatewayState {
    pub manager: Arc<SessionManager>,
    pub worker: WorkerIdentity,
    pub version: String,
    started_at: Instant,
    /// Cancelled on shutdown; ends open event streams so the server can drain.
    shutdown: CancellationToken,
}

impl GatewayState {
    pub fn new(manager: Arc<SessionManager>, worker: WorkerIdentity) -> Arc<Self> {
        Arc::new(Self {
            manager,
            worker,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
