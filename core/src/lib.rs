//! Shared core of the infrastructure MCP servers.
//!
//! A front-end (stdio or HTTP) builds an [`AppContext`] for one vendor and
//! forwards `tools/list` and `tools/call` to its [`Dispatcher`]. Everything
//! between the dispatcher and the vendor's REST API lives here: schema
//! validation, confirmation of destructive calls, retries and circuit
//! breaking, response caching and the encrypted per-host credential vault.

pub mod app;
pub mod args;
pub mod cache;
pub mod config;
pub mod error;
pub mod fernet;
pub mod fleet;
pub mod jsonrpc;
pub mod redact;
pub mod registry;
pub mod resilience;
pub mod transport;
pub mod vault;
pub mod vendors;

pub use app::AppContext;
pub use config::{Config, Vendor};
pub use error::{Error, ErrorKind, Result};
pub use registry::{Dispatcher, Tool, ToolCallEnvelope, ToolRegistry};
pub use vault::{CredentialRecord, Secret, Vault, VaultOptions};
