use anyhow::Result;
use clap::Parser;
use mapbridge_plugin::{ClientConfig, DirectoryHost, PluginClient};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "mapbridge-plugin")]
#[command(about = "Connect a local project directory to a mapbridge server")]
struct Args {
    /// Server base URL
    #[arg(long, env = "MAPBRIDGE_SERVER", default_value = "http://127.0.0.1:8000")]
    server: String,

    /// Bearer token (servers with auth enabled)
    #[arg(long, env = "MAPBRIDGE_TOKEN")]
    token: Option<String>,

    /// User name (servers with auth disabled)
    #[arg(long, env = "MAPBRIDGE_USER")]
    user: Option<String>,

    /// Project directory served to the application
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Seconds to wait before reconnecting
    #[arg(long, default_value = "5")]
    retry_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_directive = if args.debug {
        "mapbridge_plugin=debug,mapbridge=debug,info"
    } else {
        "mapbridge_plugin=info,mapbridge=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut config = ClientConfig::new(args.server);
    config.token = args.token;
    config.user = args.user;
    let client = PluginClient::new(config, DirectoryHost::new(args.project_dir))?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
        signal_token.cancel();
    });

    let retry = Duration::from_secs(args.retry_secs.max(1));
    while !shutdown.is_cancelled() {
        match client.run(shutdown.clone()).await {
            Ok(()) => {}
            Err(e) if e.is_unavailable() => warn!("Server unavailable, retrying in {:?}", retry),
            Err(e) => return Err(e.into()),
        }
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(retry) => {}
        }
    }

    info!("Plugin stopped");
    Ok(())
}
