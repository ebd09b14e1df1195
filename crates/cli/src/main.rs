mod serve;
mod worker;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "switchboard", about = "Switchboard: sharded gateway for messaging sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (otherwise discovered in the usual locations).
    #[arg(long, global = true, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the front router and its worker fleet.
    Serve {
        /// Overrides `server.workers`.
        #[arg(long)]
        workers: Option<usize>,
        /// Overrides `server.base_port`.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one worker (normally started by `serve`).
    Worker {
        #[arg(long)]
        index: usize,
        #[arg(long)]
        workers: usize,
        #[arg(long)]
        port: u16,
    },
    /// Print the resolved configuration.
    Config,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Token cancelled on Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("shutdown requested");
        trigger.cancel();
    });
    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let mut config = switchboard_config::discover_and_load(cli.config.as_deref());

    match cli.command {
        Commands::Serve { workers, port } => {
            if let Some(workers) = workers {
                config.server.workers = Some(workers);
            }
            if let Some(port) = port {
                config.server.base_port = port;
            }
            info!(version = env!("CARGO_PKG_VERSION"), "switchboard starting");
            let worker_args = serve::worker_args(cli.config.as_deref(), &cli.log_level, cli.json_logs);
            serve::run(config, worker_args, shutdown_on_ctrl_c()).await
        },
        Commands::Worker {
            index,
            workers,
            port,
        } => worker::run(config, index, workers, port, shutdown_on_ctrl_c()).await,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        },
    }
}
