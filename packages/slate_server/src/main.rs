use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod authz;
mod backplane;
mod config;
mod handlers;
mod metrics;
mod relay;
mod session;

use crate::authz::{AuthService, StaticAuth};
use crate::backplane::{Backplane, LocalBackplane, RedisBackplane};
use crate::config::{BackplaneConfig, FileConfig, SyncConfig};
use crate::metrics::ServerMetrics;
use crate::relay::ChannelRelay;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<ChannelRelay>,
    pub auth: Arc<dyn AuthService>,
    pub metrics: Arc<ServerMetrics>,
    pub sync: SyncConfig,
}

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
#[command(name = "slated")]
#[command(about = "Channel relay for real-time collaborative canvases")]
struct Cli {
    /// Directory containing config.toml (defaults to the working directory)
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Override the configured listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the configured listen port
    #[arg(long)]
    port: Option<u16>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{channel_id}", get(handlers::ws::ws_handler))
        .route("/health", get(handlers::health::health_handler))
        .route("/health/live", get(handlers::health::health_live_handler))
        .route("/metrics", get(handlers::health::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "slated=debug,tower_http=debug,info"
    } else {
        "slated=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config: FileConfig = config::load_config(&cli.config_dir)
        .extract()
        .context("invalid configuration")?;
    if let Some(host) = cli.host {
        file_config.server.host = host;
    }
    if let Some(port) = cli.port {
        file_config.server.port = port;
    }

    let sync = SyncConfig::from_file(&file_config.sync);
    let backplane_config = BackplaneConfig::from_file(&file_config.backplane);

    let backplane: Arc<dyn Backplane> = if backplane_config.enabled {
        info!(
            url = %backplane_config.url,
            server_id = %backplane_config.server_id,
            "using redis backplane"
        );
        Arc::new(
            RedisBackplane::connect(&backplane_config.url).context("invalid backplane url")?,
        )
    } else {
        info!("backplane disabled, channels are scoped to this process");
        Arc::new(LocalBackplane::new())
    };

    let metrics = Arc::new(ServerMetrics::new());
    let relay = Arc::new(ChannelRelay::new(
        backplane_config.server_id,
        backplane,
        metrics.clone(),
    ));

    let auth: Arc<dyn AuthService> = if file_config.auth.open {
        warn!(role = %file_config.auth.role, "auth is open: any credential is accepted");
        Arc::new(StaticAuth::allow_all(file_config.auth.role))
    } else {
        warn!("auth is closed and no auth service is wired in; every connection will be refused");
        Arc::new(StaticAuth::new())
    };

    let state = AppState {
        relay: relay.clone(),
        auth,
        metrics,
        sync,
    };
    let app = router(state);

    let addr = config::bind_addr(&file_config.server).context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {}", listener.local_addr()?);
    info!("WebSocket endpoint: ws://{addr}/ws/{{channel_id}}");

    // Create shutdown signal handler
    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received shutdown signal, cleaning up...");
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    // Close backplane subscriptions after the listener stops accepting
    info!("Closing channels...");
    relay.destroy().await;

    info!("Shutdown complete");
    server_result
}
