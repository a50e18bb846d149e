//! Command-line interface for `infra-mcp`.
//!
//! Everything about the vendors themselves (hosts, credentials, retry
//! tunables) lives in the TOML config; the CLI only picks the vendor and,
//! for `vault`, says which store to edit.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use infra_mcp_core::config::DEFAULT_MASTER_PASSWORD_ENV;
use infra_mcp_core::transport::Protocol;
use infra_mcp_core::Vendor;

pub const DEFAULT_HOST_PASSWORD_ENV: &str = "INFRA_MCP_HOST_PASSWORD";

/// CLI arguments parsed by `clap`.
#[derive(Parser)]
#[command(name = "infra-mcp", version, about = "MCP server for infrastructure APIs")]
pub struct Cli {
    /// Path to TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve one vendor's tools over stdio JSON-RPC
    Serve {
        #[arg(long)]
        vendor: Vendor,
    },
    /// Manage the encrypted per-host credential vault
    Vault(VaultArgs),
}

#[derive(Args)]
pub struct VaultArgs {
    /// Vendor whose `[vendor.<name>.vault]` section locates the store
    #[arg(long, default_value = "redfish")]
    pub vendor: Vendor,

    /// Vault file, overriding the config
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Environment variable holding the master password
    #[arg(long)]
    pub master_password_env: Option<String>,

    #[command(subcommand)]
    pub action: VaultAction,
}

#[derive(Subcommand)]
pub enum VaultAction {
    /// Add a host
    Add(HostArgs),
    /// Replace an existing host's record
    Update(HostArgs),
    /// Remove a host
    Remove { name: String },
    /// List host names
    List,
    /// Show one host without its password
    Show { name: String },
    /// Rewrite a v1 store (Fernet token plus key file) as a password-protected v2 store
    Migrate {
        /// The v1 key file (urlsafe-base64 Fernet key)
        #[arg(long)]
        key_file: PathBuf,
    },
}

#[derive(Args)]
pub struct HostArgs {
    /// Name tools use to select this host
    pub name: String,

    #[arg(long)]
    pub host: String,

    #[arg(long, default_value_t = 443)]
    pub port: u16,

    #[arg(long, default_value = "https")]
    pub protocol: Protocol,

    #[arg(long)]
    pub username: String,

    /// Environment variable holding this host's password
    #[arg(long, default_value = DEFAULT_HOST_PASSWORD_ENV)]
    pub password_env: String,

    /// Skip TLS certificate verification (self-signed BMCs)
    #[arg(long)]
    pub insecure: bool,

    /// Store the host but keep tools from using it
    #[arg(long)]
    pub disabled: bool,
}

impl VaultArgs {
    pub fn master_password_env(&self, configured: Option<&str>) -> String {
        self.master_password_env
            .clone()
            .or_else(|| configured.map(String::from))
            .unwrap_or_else(|| DEFAULT_MASTER_PASSWORD_ENV.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve() {
        let cli = Cli::try_parse_from(["infra-mcp", "serve", "--vendor", "truenas"]).unwrap();
        assert!(matches!(cli.command, Command::Serve { vendor: Vendor::Truenas }));
    }

    #[test]
    fn parses_vault_add_with_defaults() {
        let cli = Cli::try_parse_from([
            "infra-mcp", "vault", "add", "r650-01", "--host", "10.0.0.11", "--username", "root",
        ])
        .unwrap();
        let Command::Vault(args) = cli.command else {
            panic!("expected vault command");
        };
        assert_eq!(args.vendor, Vendor::Redfish);
        assert_eq!(args.master_password_env(None), DEFAULT_MASTER_PASSWORD_ENV);
        let VaultAction::Add(host) = args.action else {
            panic!("expected add");
        };
        assert_eq!(host.port, 443);
        assert_eq!(host.protocol, Protocol::Https);
        assert_eq!(host.password_env, DEFAULT_HOST_PASSWORD_ENV);
        assert!(!host.insecure);
    }

    #[test]
    fn unknown_vendor_rejected() {
        assert!(Cli::try_parse_from(["infra-mcp", "serve", "--vendor", "vmware"]).is_err());
    }
}
