//! Configuration: file discovery, `${ENV}` substitution and environment
//! overrides for the reconnect, handshake, ingestion and sharding tunables.

pub mod env_overrides;
pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{discover_and_load, load_config},
    schema::{
        DatabaseConfig, HandshakeConfig, IngestConfig, ProtocolConfig, ReconnectConfig,
        ServerConfig, SwitchboardConfig,
    },
};
