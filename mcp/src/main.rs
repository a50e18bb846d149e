//! # infra-mcp
//!
//! MCP (Model Context Protocol) server exposing one infrastructure vendor's
//! API as tools. Runs as a stdio JSON-RPC server, designed to be launched by
//! an AI agent host.
//!
//! ## Subcommands
//!
//! - `infra-mcp serve --vendor <redfish|pfsense|proxmox|truenas|warewulf>`
//! - `infra-mcp vault <add|update|remove|list|show|migrate>` manages the
//!   encrypted per-host credential store used by the fleet vendors
//!
//! ## Architecture
//!
//! ```text
//! main.rs    entry point, config loading, logging, subcommand dispatch
//! config.rs  clap CLI definition
//! mcp.rs     stdio line loop around the shared JSON-RPC handler
//! vault.rs   vault subcommands
//! ```

mod config;
mod mcp;
mod vault;

use clap::Parser;
use config::{Cli, Command};
use infra_mcp_core::jsonrpc::ServerInfo;
use infra_mcp_core::{AppContext, Config};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("infra-mcp: {e}");
            std::process::exit(1);
        }
    };

    // stdout carries JSON-RPC, so logs go to stderr
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { vendor } => {
            let ctx = match AppContext::build(vendor, &config).await {
                Ok(ctx) => ctx,
                Err(e) => {
                    eprintln!("infra-mcp: {e}");
                    std::process::exit(1);
                }
            };
            tracing::info!(
                %vendor,
                version = env!("CARGO_PKG_VERSION"),
                "serving MCP on stdio"
            );
            let info = ServerInfo {
                name: format!("infra-mcp-{vendor}"),
                version: env!("CARGO_PKG_VERSION").to_string(),
            };
            mcp::run_stdio(ctx.dispatcher().clone(), info).await;
        }
        Command::Vault(args) => {
            match vault::run(args, &config, |name| std::env::var(name).ok()).await {
                Ok(output) => println!(
                    "{}",
                    serde_json::to_string_pretty(&output).unwrap_or_default()
                ),
                Err(e) => {
                    eprintln!("infra-mcp: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
