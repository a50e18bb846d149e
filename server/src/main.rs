#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # infra-mcp-server
//!
//! HTTP front-end for one infrastructure vendor's MCP tools. Serves the same
//! catalog as the stdio `infra-mcp` binary to clients that cannot spawn a
//! subprocess, protected by a pre-shared API key.
//!
//! ## API surface
//!
//! | Method | Path              | Auth | Description                       |
//! |--------|-------------------|------|-----------------------------------|
//! | GET    | `/api/health`     | No   | Liveness check                    |
//! | GET    | `/api/tools`      | Yes  | Tool definitions                  |
//! | POST   | `/api/tools/call` | Yes  | `{name, arguments}` → envelope    |
//! | POST   | `/mcp`            | Yes  | One JSON-RPC 2.0 message per body |
//!
//! ## Architecture
//!
//! ```text
//! main.rs     entry point, config loading, logging, graceful shutdown
//! lib.rs      router assembly and middleware stack
//! auth.rs     Bearer token middleware, constant-time comparison
//! state.rs    AppState (dispatcher, vendor, start time)
//! routes/
//!   health.rs  GET /api/health
//!   tools.rs   GET /api/tools, POST /api/tools/call
//!   mcp.rs     POST /mcp
//! ```

use std::path::PathBuf;

use clap::Parser;
use infra_mcp_core::{AppContext, Config, Vendor};
use infra_mcp_server::{router, AppState};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// HTTP server for infrastructure MCP tools.
#[derive(Parser)]
#[command(name = "infra-mcp-server", version)]
struct Cli {
    /// Vendor whose tools to serve
    #[arg(long)]
    vendor: Vendor,

    /// Path to TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("infra-mcp-server: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("infra-mcp-server v{} starting", env!("CARGO_PKG_VERSION"));

    let api_key = config.server.api_key.clone();
    if api_key.is_empty() {
        error!("server.api_key is empty; refusing to start");
        std::process::exit(1);
    }
    if api_key.expose() == "change-me" {
        warn!("Using default API key; set INFRA_MCP_API_KEY or update config");
    }

    let ctx = match AppContext::build(cli.vendor, &config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let state = AppState::new(ctx.vendor(), ctx.dispatcher().clone());
    let app = router(state, api_key, config.server.max_concurrent);

    let listener = match TcpListener::bind(&config.server.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!(listen = %config.server.listen, "failed to bind: {e}");
            std::process::exit(1);
        }
    };
    info!(vendor = %cli.vendor, "Listening on {}", config.server.listen);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {e}");
        std::process::exit(1);
    }
    info!("Goodbye");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
