//! Session id to worker mapping.

use {
    rand::Rng,
    serde::Serialize,
    sha2::{Digest, Sha256},
    tokio::sync::RwLock,
};

/// Worker index owning `session_id` among `workers` workers.
///
/// Stable across processes and restarts for a fixed worker count.
pub fn shard_for(session_id: &str, workers: usize) -> usize {
    if workers <= 1 {
        return 0;
    }
    let digest = Sha256::digest(session_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % workers as u64) as usize
}

/// One worker process as seen by the front router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSlot {
    pub index: usize,
    pub port: u16,
    pub pid: Option<u32>,
    pub alive: bool,
    pub restarts: u32,
}

/// Worker index to port table. Rebuilt at startup, updated as workers die
/// and are replaced; the port of an index never changes.
pub struct ShardMap {
    slots: RwLock<Vec<WorkerSlot>>,
}

impl ShardMap {
    /// `count` workers on consecutive ports after `base_port`.
    pub fn new(base_port: u16, count: usize) -> Self {
        let ports = (0..count).map(|i| base_port.saturating_add(1 + i as u16));
        Self::from_ports(ports)
    }

    pub fn from_ports(ports: impl IntoIterator<Item = u16>) -> Self {
        let slots = ports
            .into_iter()
            .enumerate()
            .map(|(index, port)| WorkerSlot {
                index,
                port,
                pid: None,
                alive: false,
                restarts: 0,
            })
            .collect();
        Self {
            slots: RwLock::new(slots),
        }
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> Vec<WorkerSlot> {
        self.slots.read().await.clone()
    }

    pub async fn slot(&self, index: usize) -> Option<WorkerSlot> {
        self.slots.read().await.get(index).cloned()
    }

    /// Worker for a request. Requests without a session id go to a random
    /// worker, preferring live ones.
    pub async fn route(&self, session_id: Option<&str>) -> Option<WorkerSlot> {
        let slots = self.slots.read().await;
        if slots.is_empty() {
            return None;
        }
        let index = match session_id {
            Some(id) => shard_for(id, slots.len()),
            None => {
                let alive: Vec<usize> = slots.iter().filter(|s| s.alive).map(|s| s.index).collect();
                let mut rng = rand::rng();
                if alive.is_empty() {
                    rng.random_range(0..slots.len())
                } else {
                    alive[rng.random_range(0..alive.len())]
                }
            },
        };
        slots.get(index).cloned()
    }

    pub async fn mark_up(&self, index: usize, pid: Option<u32>) {
        if let Some(slot) = self.slots.write().await.get_mut(index) {
            slot.alive = true;
            slot.pid = pid;
        }
    }

    pub async fn mark_down(&self, index: usize) {
        if let Some(slot) = self.slots.write().await.get_mut(index) {
            slot.alive = false;
            slot.pid = None;
        }
    }

    pub async fn record_restart(&self, index: usize) {
        if let Some(slot) = self.slots.write().await.get_mut(index) {
            slot.restarts += 1;
        }
    }
}
