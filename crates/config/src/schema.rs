//! Config schema types (server, database, reconnect, handshake, ingest, protocol).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub reconnect: ReconnectConfig,
    pub handshake: HandshakeConfig,
    pub ingest: IngestConfig,
    pub protocol: ProtocolConfig,
}

/// Front process and worker fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the front router binds to.
    pub bind: String,
    /// Port of the front router. Workers take `base_port + 1 ..= base_port + N`.
    pub base_port: u16,
    /// Number of worker processes. Defaults to the CPU count.
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            base_port: 3000,
            workers: None,
        }
    }
}

impl ServerConfig {
    /// Resolved worker count, never zero.
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://switchboard.db?mode=rwc".into(),
        }
    }
}

/// Reconnect backoff and cooldown tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Failures inside `cooldown_window_ms` that force a cooldown.
    pub cooldown_trigger_count: usize,
    pub cooldown_window_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 5_000,
            backoff_cap_ms: 300_000,
            cooldown_trigger_count: 3,
            cooldown_window_ms: 60_000,
            cooldown_ms: 1_800_000,
        }
    }
}

impl ReconnectConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn cooldown_window(&self) -> Duration {
        Duration::from_millis(self.cooldown_window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// QR regenerations allowed on one handshake stream.
    pub max_qr_generations: u32,
    /// How long a single-shot create waits for the first QR or open.
    pub timeout_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_qr_generations: 5,
            timeout_ms: 60_000,
        }
    }
}

impl HandshakeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Event ingestion backpressure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Sample memory every this many batches.
    pub sample_every: u64,
    /// Pause reads above this used/total ratio.
    pub high_watermark: f64,
    /// Resume once the ratio falls under `high_watermark * low_ratio`.
    pub low_ratio: f64,
    /// Memory budget for the worker process. When unset the host total is used.
    pub memory_budget_bytes: Option<u64>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sample_every: 50,
            high_watermark: 0.8,
            low_ratio: 0.7,
            memory_budget_bytes: None,
        }
    }
}

impl IngestConfig {
    pub fn low_watermark(&self) -> f64 {
        self.high_watermark * self.low_ratio
    }
}

/// Protocol client connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// WebSocket endpoint of the protocol bridge.
    pub bridge_url: String,
    pub connect_timeout_ms: u64,
    /// Timeout for request/response commands (logout, query, send).
    pub request_timeout_ms: u64,
    pub browser_name: String,
    pub browser_version: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            bridge_url: "ws://127.0.0.1:7400".into(),
            connect_timeout_ms: 20_000,
            request_timeout_ms: 30_000,
            browser_name: "Switchboard".into(),
            browser_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}
