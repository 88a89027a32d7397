use anyhow::{Context, Result};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod auth;
mod config;
mod handlers;
mod metrics;
mod projects;
mod registry;
mod relay;
mod upload;

#[cfg(test)]
mod test_helpers;

use crate::config::{
    AuthConfig, FileConfig, MapbridgeConfig, StorageConfig, UploadConfig, load_config,
};
use crate::metrics::ServerMetrics;
use crate::registry::ConnectionRegistry;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "mapbridge")]
#[command(about = "Relay between a desktop GIS plugin and its browser application")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.mapbridge)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground (default)
    Serve(ServeArgs),

    /// Print the effective configuration as JSON
    ShowConfig,
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    /// Live plugin/application sockets per user
    pub registry: Arc<ConnectionRegistry>,
    pub storage: Arc<StorageConfig>,
    pub upload: Arc<UploadConfig>,
    /// Authentication configuration
    pub auth_config: Arc<AuthConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

impl AppState {
    pub fn new(file_config: &FileConfig, config: &MapbridgeConfig) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            storage: Arc::new(StorageConfig::from_file(
                &file_config.storage,
                &config.data_dir,
            )),
            upload: Arc::new(UploadConfig::from_file(&file_config.upload)),
            auth_config: Arc::new(AuthConfig::from_file(&file_config.auth)),
            metrics: Arc::new(ServerMetrics::new()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::ShowConfig) => {
            let config = MapbridgeConfig::new(cli.data_dir)?;
            let file_config: FileConfig = load_config(&config.data_dir)
                .extract()
                .context("Invalid configuration")?;
            println!("{}", serde_json::to_string_pretty(&file_config)?);
            Ok(())
        }
        Some(Commands::Serve(args)) => run_server(args, cli.data_dir).await,
        None => run_server(ServeArgs::default(), cli.data_dir).await,
    }
}

async fn run_server(args: ServeArgs, data_dir: Option<PathBuf>) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "mapbridge=debug,tower_http=debug,info"
    } else {
        "mapbridge=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Mapbridge relay");

    let config = MapbridgeConfig::new(data_dir)?;
    let file_config: FileConfig = load_config(&config.data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {:?}", config.config_toml_path()))?;

    let state = AppState::new(&file_config, &config);
    tokio::fs::create_dir_all(&state.storage.projects_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create projects directory: {:?}",
                state.storage.projects_dir
            )
        })?;
    info!(
        "Projects: {} (quota {} MB)",
        state.storage.projects_dir.display(),
        file_config.storage.max_project_size_mb
    );

    if state.auth_config.enabled {
        info!(
            "Authentication ENABLED ({} users)",
            state.auth_config.users.len()
        );
    } else {
        info!("Authentication disabled (set MAPBRIDGE_AUTH__ENABLED=true to enable)");
    }

    let app = build_router(state);

    let host = args.host.unwrap_or(file_config.server.host);
    let port = args.port.unwrap_or(file_config.server.port);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Mapbridge listening on http://{}", actual_addr);
    info!("Endpoints:");
    info!("  GET    /ws/plugin                     - Plugin relay socket");
    info!("  GET    /ws/app                        - Application relay socket");
    info!("  POST   /api/project/upload/:project   - Streaming project upload");
    info!("  GET    /api/project/files/:project    - List project files");
    info!("  DELETE /api/project/delete/:project   - Delete project");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}

pub(crate) fn build_router(state: AppState) -> Router {
    let auth_config = state.auth_config.clone();

    Router::new()
        // Relay sockets
        .route("/ws/plugin", get(handlers::plugin_ws_handler))
        .route("/ws/app", get(handlers::app_ws_handler))
        // Project routes
        .route(
            "/api/project/upload/{project}",
            post(upload::upload_project).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/api/project/files/{project}",
            get(handlers::list_project_files),
        )
        .route(
            "/api/project/delete/{project}",
            delete(handlers::delete_project),
        )
        .route(
            "/api/project/download/{project}",
            get(handlers::download_project),
        )
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(axum::middleware::from_fn_with_state(
            auth_config,
            auth::auth_middleware,
        ))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
