//! Per-connection event pump.
//!
//! One task per live connection drains the client's batches in arrival
//! order: credentials are saved, connection ticks drive the handshake and
//! the reconnect policy, and store events go through the ingestion path.

use std::{sync::Arc, time::Duration};

use {
    switchboard_common::SessionStatus,
    switchboard_protocol::{
        ConnectionState, ConnectionUpdate, DisconnectReason, EventBatch, FlowControl,
    },
    switchboard_store::{SessionIngest, SessionKeys},
    tokio::{
        sync::mpsc,
        time::{self, Instant, MissedTickBehavior},
    },
    tracing::{debug, info, warn},
};

use crate::{
    handshake::Abort,
    manager::{SessionManager, Teardown},
    registry::{LiveConnection, SessionHandle},
};

/// How often memory is re-sampled while the transport's reads are paused.
const PAUSED_RECHECK: Duration = Duration::from_millis(250);

/// How a batch left the connection.
enum Flow {
    Continue,
    Closed(DisconnectReason),
    Abort(Abort),
}

pub(crate) struct Supervisor {
    pub(crate) manager: Arc<SessionManager>,
    pub(crate) handle: Arc<SessionHandle>,
    pub(crate) live: Arc<LiveConnection>,
    pub(crate) keys: SessionKeys,
    pub(crate) ingest: SessionIngest,
    pub(crate) events: mpsc::Receiver<EventBatch>,
}

impl Supervisor {
    pub(crate) async fn run(mut self) {
        let cancel = self.live.cancel_token();
        let mut recheck = time::interval_at(Instant::now() + PAUSED_RECHECK, PAUSED_RECHECK);
        recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let flow = loop {
            let paused = self.live.client.is_paused();
            let batch = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(session_id = %self.handle.id, "connection superseded, supervisor stopping");
                    self.ingest.detach();
                    return;
                },
                batch = self.events.recv() => batch,
                _ = recheck.tick(), if paused => {
                    self.ingest.recheck(self.live.client.as_ref());
                    continue;
                },
            };
            let Some(batch) = batch else {
                break Flow::Closed(DisconnectReason::ConnectionLost);
            };
            match self.handle_batch(batch).await {
                Flow::Continue => {},
                other => break other,
            }
        };

        self.ingest.detach();
        self.handle.release(&self.live);
        self.live.client.end().await;

        match flow {
            Flow::Closed(reason) => self.manager.handle_close(&self.handle, reason).await,
            Flow::Abort(abort) => {
                warn!(session_id = %self.handle.id, reason = abort.reason(), "handshake abandoned, tearing session down");
                self.manager
                    .teardown(&self.handle, Teardown::ABANDONED, abort.reason())
                    .await;
            },
            Flow::Continue => {},
        }
    }

    async fn handle_batch(&mut self, batch: EventBatch) -> Flow {
        if let Some(update) = &batch.creds_update {
            // Every tick is written, even if nothing changed.
            if let Err(e) = self.keys.save_creds(&update.creds).await {
                warn!(session_id = %self.handle.id, error = %e, "failed to persist credentials");
            }
            if update.is_registered() && !self.live.is_authenticated() {
                info!(session_id = %self.handle.id, "credentials confirmed");
                self.live.mark_authenticated();
                self.manager.publish(&self.handle, SessionStatus::Authenticated, None);
            }
        }

        let mut closed = None;
        if let Some(update) = &batch.connection_update {
            match self.on_connection_update(update).await {
                Ok(reason) => closed = reason,
                Err(abort) => return Flow::Abort(abort),
            }
        }

        let flow: &dyn FlowControl = self.live.client.as_ref();
        self.ingest.tick(flow);
        if batch.has_store_events() {
            if let Err(e) = self.ingest.process(&batch).await {
                warn!(session_id = %self.handle.id, error = %e, "failed to persist event batch");
            }
        }
        if let Err(e) = self.manager.rows().touch(self.handle.id.as_str()).await {
            debug!(session_id = %self.handle.id, error = %e, "failed to refresh last-active");
        }

        match closed {
            Some(reason) => Flow::Closed(reason),
            None => Flow::Continue,
        }
    }

    /// Returns the close reason if the tick closed the connection.
    async fn on_connection_update(
        &mut self,
        update: &ConnectionUpdate,
    ) -> Result<Option<DisconnectReason>, Abort> {
        if let Some(code) = &update.qr {
            debug!(session_id = %self.handle.id, "qr code received");
            self.handle.handshake.lock().await.on_qr(code)?;
        }

        match update.connection {
            Some(ConnectionState::Connecting) => {
                self.handle
                    .handshake
                    .lock()
                    .await
                    .on_status(SessionStatus::Connecting)?;
                Ok(None)
            },
            Some(ConnectionState::Open) => {
                info!(session_id = %self.handle.id, new_login = ?update.is_new_login, "connection open");
                self.manager.reset_retries(&self.handle.id);
                self.handle.handshake.lock().await.on_open();
                self.ingest.attach();
                let status = self.live.status();
                self.manager.publish(&self.handle, status, None);
                Ok(None)
            },
            Some(ConnectionState::Close) => {
                let reason = update
                    .last_disconnect
                    .unwrap_or(DisconnectReason::ConnectionClosed);
                info!(session_id = %self.handle.id, code = reason.code(), %reason, "connection closed");
                Ok(Some(reason))
            },
            None => Ok(None),
        }
    }
}
