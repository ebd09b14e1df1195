use std::sync::Arc;

use {
    anyhow::Context,
    switchboard_config::SwitchboardConfig,
    switchboard_gateway::{GatewayState, WorkerIdentity, serve_worker},
    switchboard_protocol::BridgeConnector,
    switchboard_sessions::{ManagerConfig, SessionManager},
    tokio::net::TcpListener,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

/// Workers only ever talk to the front router on the same host.
const WORKER_BIND: &str = "127.0.0.1";

pub async fn run(
    config: SwitchboardConfig,
    index: usize,
    workers: usize,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let identity = WorkerIdentity::new(index, workers);
    let pool = switchboard_store::connect(&config.database.url)
        .await
        .with_context(|| format!("failed to open database {}", config.database.url))?;

    let connector = Arc::new(BridgeConnector::new(config.protocol.bridge_url.clone()));
    let manager = Arc::new(SessionManager::new(
        ManagerConfig::from(&config),
        connector,
        pool,
    ));

    let listener = TcpListener::bind((WORKER_BIND, port))
        .await
        .with_context(|| format!("worker {index} failed to bind port {port}"))?;

    let recovering = Arc::clone(&manager);
    tokio::spawn(async move {
        match recovering.recover(|id| identity.owns(id.as_str())).await {
            Ok(started) => info!(worker = index, started, "recovered persisted sessions"),
            Err(e) => warn!(worker = index, error = %e, "session recovery failed"),
        }
    });

    serve_worker(listener, GatewayState::new(manager, identity), shutdown).await
}
