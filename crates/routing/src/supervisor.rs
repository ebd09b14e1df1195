//! Worker process supervision.
//!
//! Each shard slot gets one child process. When it exits for any reason the
//! slot is marked down and a replacement is started on the same port, so the
//! partition it owns never moves.

use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use {
    tokio::{process::Command, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::shard::ShardMap;

/// How to launch one worker. The fleet appends
/// `--index <i> --workers <n> --port <p>` to `args`.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerSpec {
    /// Re-run the current executable with the given leading arguments.
    pub fn current_exe(args: Vec<String>) -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args,
            env: Vec::new(),
        })
    }

    fn command(&self, index: usize, workers: usize, port: u16) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--index")
            .arg(index.to_string())
            .arg("--workers")
            .arg(workers.to_string())
            .arg("--port")
            .arg(port.to_string());
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }
}

pub struct WorkerFleet {
    spec: WorkerSpec,
    shards: Arc<ShardMap>,
    respawn_delay: Duration,
    cancel: CancellationToken,
}

impl WorkerFleet {
    pub fn new(spec: WorkerSpec, shards: Arc<ShardMap>) -> Self {
        Self {
            spec,
            shards,
            respawn_delay: Duration::from_millis(200),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_respawn_delay(mut self, delay: Duration) -> Self {
        self.respawn_delay = delay;
        self
    }

    pub fn shards(&self) -> &Arc<ShardMap> {
        &self.shards
    }

    /// Cancelling the token kills every worker and stops respawning.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start one supervision task per shard slot.
    pub async fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let slots = self.shards.snapshot().await;
        let workers = slots.len();
        slots
            .into_iter()
            .map(|slot| {
                let fleet = Arc::clone(self);
                tokio::spawn(async move { fleet.supervise(slot.index, workers, slot.port).await })
            })
            .collect()
    }

    async fn supervise(&self, index: usize, workers: usize, port: u16) {
        loop {
            match self.spec.command(index, workers, port).spawn() {
                Ok(mut child) => {
                    let pid = child.id();
                    self.shards.mark_up(index, pid).await;
                    info!(worker = index, port, pid, "worker started");

                    let status = tokio::select! {
                        () = self.cancel.cancelled() => {
                            if let Err(e) = child.kill().await {
                                warn!(worker = index, error = %e, "failed to kill worker");
                            }
                            self.shards.mark_down(index).await;
                            return;
                        },
                        status = child.wait() => status,
                    };

                    self.shards.mark_down(index).await;
                    match status {
                        Ok(status) => warn!(worker = index, port, %status, "worker exited, respawning"),
                        Err(e) => warn!(worker = index, port, error = %e, "worker wait failed, respawning"),
                    }
                },
                Err(e) => {
                    warn!(worker = index, port, error = %e, "failed to spawn worker");
                },
            }

            self.shards.record_restart(index).await;
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.respawn_delay) => {},
            }
        }
    }
}
