use std::{path::Path, sync::Arc};

use {
    anyhow::Context,
    switchboard_config::SwitchboardConfig,
    switchboard_routing::{ProxyState, ShardMap, WorkerFleet, WorkerSpec, router},
    tokio::net::TcpListener,
    tokio_util::sync::CancellationToken,
    tracing::info,
};

/// Leading arguments for each forked worker. The fleet adds the shard flags.
pub fn worker_args(config: Option<&Path>, log_level: &str, json_logs: bool) -> Vec<String> {
    let mut args = vec!["worker".to_string(), "--log-level".into(), log_level.into()];
    if let Some(path) = config {
        args.push("--config".into());
        args.push(path.display().to_string());
    }
    if json_logs {
        args.push("--json-logs".into());
    }
    args
}

/// Front process: fork the workers, then proxy every request to the owner.
pub async fn run(
    config: SwitchboardConfig,
    worker_args: Vec<String>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let workers = config.server.worker_count();
    let shards = Arc::new(ShardMap::new(config.server.base_port, workers));

    let spec = WorkerSpec::current_exe(worker_args).context("cannot locate own executable")?;
    let fleet = Arc::new(WorkerFleet::new(spec, Arc::clone(&shards)));
    let supervisors = fleet.start().await;

    let addr = format!("{}:{}", config.server.bind, config.server.base_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, workers, "router listening");

    let app = router(ProxyState::new(shards)?);
    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await?;

    fleet.cancel_token().cancel();
    for task in supervisors {
        let _ = task.await;
    }
    info!("router stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workers_inherit_config_and_logging() {
        let args = worker_args(Some(Path::new("/etc/switchboard.toml")), "debug", true);
        assert_eq!(args, [
            "worker",
            "--log-level",
            "debug",
            "--config",
            "/etc/switchboard.toml",
            "--json-logs",
        ]);
        assert_eq!(worker_args(None, "info", false), ["worker", "--log-level", "info"]);
    }
}
