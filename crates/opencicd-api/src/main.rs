//! Open-CICD API Server

use anyhow::Context;
use clap::Parser;
use opencicd_api::{AppState, routes};
use opencicd_config::{SystemConfig, load_system_config};
use opencicd_core::clock::SystemClock;
use opencicd_db::MemoryStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "opencicd-server", version, about = "Open-CICD control plane server")]
struct Args {
    /// KDL system configuration file.
    #[arg(long, env = "OPENCICD_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on. Overrides the configuration file.
    #[arg(long)]
    bind: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "OPENCICD_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = match &args.config {
        Some(path) => load_system_config(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => SystemConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    let addr = bind_address(&config.server.bind, std::env::var("PORT").ok().as_deref())?;

    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(store, Arc::new(SystemClock), config).await?;

    let shutdown = CancellationToken::new();
    let background = state.plane.spawn_background(shutdown.clone());

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Starting Open-CICD server");

    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutting down server");
        signal.cancel();
    });

    let drained = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { drained.cancelled().await })
        .await?;

    shutdown.cancel();
    for handle in background {
        let _ = handle.await;
    }
    info!("Server stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// `PORT` replaces the port of the configured bind address.
fn bind_address(bind: &str, port: Option<&str>) -> anyhow::Result<SocketAddr> {
    let mut addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address: {bind}"))?;
    if let Some(port) = port {
        addr.set_port(port.parse().with_context(|| format!("invalid PORT: {port}"))?);
    }
    Ok(addr)
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
