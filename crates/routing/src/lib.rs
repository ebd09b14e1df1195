//! Shard routing: session id to worker mapping, worker process supervision,
//! and the reverse proxy the front process runs.

pub mod error;
pub mod proxy;
pub mod shard;
pub mod supervisor;

pub use {
    error::RouteError,
    proxy::{ProxyState, router},
    shard::{ShardMap, WorkerSlot, shard_for},
    supervisor::{WorkerFleet, WorkerSpec},
};
