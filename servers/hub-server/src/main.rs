//! Agent hub server.
//!
//! Run with: cargo run -p agent-hub-server
//!
//! Serves the HTTP transport on the configured address. With `--stdio` a
//! single session is served over stdin/stdout instead, and logs go to
//! stderr only.

mod settings;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use agent_hub_router::Hub;
use agent_hub_transport::{Gateway, http, serve_duplex};
use anyhow::{Context, Result};
use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::settings::ServerConfig;

#[derive(Debug, Parser)]
#[command(name = "agent-hub", version, about = "Message hub for cooperating agents")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(short, long, env = "AGENT_HUB_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long)]
    log_level: Option<String>,

    /// Serve one session over stdin/stdout.
    #[arg(long)]
    stdio: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    init_tracing(&config.log_level);

    let hub = Hub::new(config.hub.clone()).await;
    hub.start().await;
    let gateway = Gateway::new(Arc::clone(&hub));

    let result = if cli.stdio {
        serve_stdio(gateway).await
    } else {
        serve_http(gateway, Arc::clone(&hub), config.listen).await
    };

    hub.shutdown().await;
    result
}

fn init_tracing(default_filter: &str) {
    // stdout may be the protocol channel.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();
}

async fn serve_http(gateway: Gateway, hub: Arc<Hub>, addr: SocketAddr) -> Result<()> {
    let app = http::router(gateway)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Agent hub listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Ends open event streams so the server can drain.
            hub.shutdown().await;
        })
        .await
        .context("running server")
}

async fn serve_stdio(gateway: Gateway) -> Result<()> {
    tracing::info!("Serving one session over stdio");
    tokio::select! {
        result = serve_duplex(gateway, tokio::io::stdin(), tokio::io::stdout()) => {
            result.context("serving stdio")
        }
        () = shutdown_signal() => Ok(()),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
