//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use infra_mcp_core::jsonrpc::ServerInfo;
use infra_mcp_core::{Dispatcher, Vendor};

#[derive(Clone)]
pub struct AppState {
    /// Vendor whose tools this process serves.
    pub vendor: Vendor,
    pub dispatcher: Arc<Dispatcher>,
    /// Reported in the MCP `initialize` handshake.
    pub info: Arc<ServerInfo>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
}

impl AppState {
    pub fn new(vendor: Vendor, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            vendor,
            dispatcher,
            info: Arc::new(ServerInfo {
                name: format!("infra-mcp-{vendor}"),
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
            start_time: Instant::now(),
        }
    }
}
