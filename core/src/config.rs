//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `<VENDOR>_HOST`, `<VENDOR>_PORT`,
//!    `<VENDOR>_PROTOCOL`, `<VENDOR>_USERNAME`, `<VENDOR>_PASSWORD`,
//!    `<VENDOR>_API_KEY`, `<VENDOR>_SSL_VERIFY`, `INFRA_MCP_API_KEY`,
//!    `INFRA_MCP_LISTEN`
//! 2. **Config file**: path via `--config <path>`, else `INFRA_MCP_CONFIG`,
//!    else `infra-mcp.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [vendor.truenas]
//! host = "nas.lab"
//! api_key = "1-abcdef"
//! ssl_verify = false
//! cache_ttl_secs = 300
//!
//! [vendor.pfsense]
//! host = "fw.lab"
//! username = "admin"       # JWT login; or set api_key instead
//! password = "pfsense"
//!
//! [vendor.redfish.vault]   # fleet of iDRACs, credentials in the vault
//! path = "~/.config/infra-mcp/redfish.vault.json"
//! master_password_env = "INFRA_MCP_MASTER_PASSWORD"
//! default_host = "r750-01"
//!
//! [resilience]
//! max_attempts = 3
//! min_wait_ms = 1000
//! max_wait_ms = 10000
//! backoff_multiplier = 2.0
//! retry_server_errors = false
//! fail_threshold = 5
//! reset_timeout_secs = 60
//!
//! [http]
//! connect_timeout_secs = 10
//! timeout_secs = 30
//! max_in_flight = 100
//! max_idle_per_host = 30
//!
//! [server]
//! listen = "127.0.0.1:8940"
//! api_key = "your-secret-key"
//! max_concurrent = 64
//!
//! [logging]
//! level = "info"
//! ```

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::resilience::{BreakerConfig, RetryPolicy};
use crate::transport::{Endpoint, Protocol, TransportOptions};
use crate::vault::Secret;

pub const CONFIG_ENV: &str = "INFRA_MCP_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "infra-mcp.toml";
pub const DEFAULT_MASTER_PASSWORD_ENV: &str = "INFRA_MCP_MASTER_PASSWORD";

/// The five supported vendor APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Redfish,
    Pfsense,
    Proxmox,
    Truenas,
    Warewulf,
}

impl Vendor {
    pub const ALL: [Vendor; 5] = [
        Vendor::Redfish,
        Vendor::Pfsense,
        Vendor::Proxmox,
        Vendor::Truenas,
        Vendor::Warewulf,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Vendor::Redfish => "redfish",
            Vendor::Pfsense => "pfsense",
            Vendor::Proxmox => "proxmox",
            Vendor::Truenas => "truenas",
            Vendor::Warewulf => "warewulf",
        }
    }

    /// Prefix of this vendor's environment overrides, e.g. `PROXMOX`.
    pub fn env_prefix(self) -> String {
        self.as_str().to_ascii_uppercase()
    }

    pub fn default_protocol(self) -> Protocol {
        match self {
            Vendor::Warewulf => Protocol::Http,
            _ => Protocol::Https,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Vendor::Proxmox => 8006,
            Vendor::Warewulf => 9873,
            _ => 443,
        }
    }

    /// Whether credentials may come from a per-host vault.
    pub fn supports_fleet(self) -> bool {
        matches!(self, Vendor::Redfish | Vendor::Warewulf)
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Vendor::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                Error::configuration(format!(
                    "unknown vendor '{s}' (expected one of: redfish, pfsense, proxmox, truenas, warewulf)"
                ))
            })
    }
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Per-vendor sections, keyed by vendor name.
    #[serde(default)]
    pub vendor: HashMap<String, VendorConfig>,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection settings for one vendor.
#[derive(Debug, Clone, Deserialize)]
pub struct VendorConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub protocol: Option<Protocol>,
    pub ssl_verify: Option<bool>,
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub api_key: Option<Secret>,
    /// TTL for cached slow-changing responses (TrueNAS only, default 300).
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    pub vault: Option<VaultConfig>,
}

/// Per-host credential vault for fleet vendors.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultConfig {
    /// Vault file (default `~/.config/infra-mcp/<vendor>.vault.json`).
    pub path: Option<String>,
    /// Environment variable holding the master password.
    #[serde(default = "default_master_password_env")]
    pub master_password_env: String,
    /// Host used when a tool call names none.
    pub default_host: Option<String>,
}

/// Retry and circuit-breaker tunables shared by every vendor client.
#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_min_wait_ms")]
    pub min_wait_ms: u64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Retry vendor 5xx responses as well as network failures (default false).
    #[serde(default)]
    pub retry_server_errors: bool,
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

/// Outbound HTTP limits.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

/// HTTP front-end settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:8940`). Override with `INFRA_MCP_LISTEN`.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Pre-shared Bearer token. Override with `INFRA_MCP_API_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: Secret,
    /// Requests handled at once before callers queue (default 64).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_master_password_env() -> String {
    DEFAULT_MASTER_PASSWORD_ENV.to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_min_wait_ms() -> u64 {
    1000
}
fn default_max_wait_ms() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_fail_threshold() -> u32 {
    5
}
fn default_reset_timeout_secs() -> u64 {
    60
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_in_flight() -> usize {
    100
}
fn default_max_idle_per_host() -> usize {
    30
}
fn default_listen() -> String {
    "127.0.0.1:8940".to_string()
}
fn default_api_key() -> Secret {
    Secret::new("change-me")
}
fn default_max_concurrent() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            protocol: None,
            ssl_verify: None,
            username: None,
            password: None,
            api_key: None,
            cache_ttl_secs: default_cache_ttl_secs(),
            vault: None,
        }
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_wait_ms: default_min_wait_ms(),
            max_wait_ms: default_max_wait_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            retry_server_errors: false,
            fail_threshold: default_fail_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            timeout_secs: default_timeout_secs(),
            max_in_flight: default_max_in_flight(),
            max_idle_per_host: default_max_idle_per_host(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_key: default_api_key(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ResilienceConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            min_wait: Duration::from_millis(self.min_wait_ms),
            max_wait: Duration::from_millis(self.max_wait_ms),
            backoff_multiplier: self.backoff_multiplier,
            retry_server_errors: self.retry_server_errors,
            ..RetryPolicy::default()
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            fail_threshold: self.fail_threshold.max(1),
            reset_timeout: Duration::from_secs(self.reset_timeout_secs),
            ..BreakerConfig::default()
        }
    }
}

impl HttpConfig {
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            timeout: Duration::from_secs(self.timeout_secs),
            max_in_flight: self.max_in_flight.max(1),
            max_idle_per_host: self.max_idle_per_host,
        }
    }
}

/// Vendor credentials after validation.
#[derive(Debug, Clone)]
pub enum Credentials {
    UserPassword { username: String, password: Secret },
    ApiKey(Secret),
}

/// Where a vendor's hosts and credentials come from.
#[derive(Debug, Clone)]
pub enum Target {
    Static {
        endpoint: Endpoint,
        credentials: Credentials,
    },
    Vault {
        path: PathBuf,
        master_password_env: String,
        default_host: Option<String>,
    },
}

/// Everything needed to construct one vendor's client(s).
#[derive(Debug, Clone)]
pub struct VendorSettings {
    pub vendor: Vendor,
    pub target: Target,
    pub cache_ttl: Duration,
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file and fails if it is unreadable.
    /// Otherwise tries `INFRA_MCP_CONFIG`, then `infra-mcp.toml` in the
    /// current directory, falling back to compiled defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(p) => Self::from_file(&p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content).map_err(|e| {
            Error::configuration(format!("failed to parse config file {}: {e}", path.display()))
        })
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::configuration(e.to_string()))
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("INFRA_MCP_API_KEY") {
            self.server.api_key = Secret::new(key);
        }
        if let Some(listen) = lookup("INFRA_MCP_LISTEN") {
            self.server.listen = listen;
        }

        for vendor in Vendor::ALL {
            let prefix = vendor.env_prefix();
            let var = |suffix: &str| lookup(&format!("{prefix}_{suffix}")).filter(|v| !v.is_empty());

            let host = var("HOST");
            let port = var("PORT");
            let protocol = var("PROTOCOL");
            let username = var("USERNAME");
            let password = var("PASSWORD");
            let api_key = var("API_KEY");
            let ssl_verify = var("SSL_VERIFY");
            let any = [&host, &port, &protocol, &username, &password, &api_key, &ssl_verify]
                .iter()
                .any(|v| v.is_some());
            if !any {
                continue;
            }

            let section = self
                .vendor
                .entry(vendor.as_str().to_string())
                .or_default();
            if host.is_some() {
                section.host = host;
            }
            if let Some(port) = port {
                match port.parse() {
                    Ok(p) => section.port = Some(p),
                    Err(_) => tracing::warn!(var = %format!("{prefix}_PORT"), value = %port, "ignoring invalid port"),
                }
            }
            if let Some(protocol) = protocol {
                match protocol.parse() {
                    Ok(p) => section.protocol = Some(p),
                    Err(_) => tracing::warn!(var = %format!("{prefix}_PROTOCOL"), value = %protocol, "ignoring invalid protocol"),
                }
            }
            if username.is_some() {
                section.username = username;
            }
            if let Some(password) = password {
                section.password = Some(Secret::new(password));
            }
            if let Some(key) = api_key {
                section.api_key = Some(Secret::new(key));
            }
            if let Some(flag) = ssl_verify {
                section.ssl_verify = Some(parse_bool(&flag));
            }
        }
    }

    /// Validate one vendor's section into [`VendorSettings`].
    pub fn resolve_vendor(&self, vendor: Vendor) -> Result<VendorSettings> {
        let section = self.vendor.get(vendor.as_str()).cloned().unwrap_or_default();
        let cache_ttl = Duration::from_secs(section.cache_ttl_secs);

        if let Some(vault) = &section.vault {
            if !vendor.supports_fleet() {
                return Err(Error::configuration(format!(
                    "{vendor}: a credential vault is only supported for redfish and warewulf"
                )));
            }
            let path = match &vault.path {
                Some(p) => PathBuf::from(expand_tilde(p).as_ref()),
                None => PathBuf::from(
                    expand_tilde(&format!("~/.config/infra-mcp/{vendor}.vault.json")).as_ref(),
                ),
            };
            return Ok(VendorSettings {
                vendor,
                target: Target::Vault {
                    path,
                    master_password_env: vault.master_password_env.clone(),
                    default_host: vault.default_host.clone(),
                },
                cache_ttl,
            });
        }

        let host = section
            .host
            .clone()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| {
                Error::configuration(format!(
                    "{vendor}: host is required (set [vendor.{vendor}].host or {}_HOST)",
                    vendor.env_prefix()
                ))
            })?;
        let protocol = section.protocol.unwrap_or(vendor.default_protocol());
        let endpoint = Endpoint {
            protocol,
            host,
            port: section.port.unwrap_or(vendor.default_port()),
            ssl_verify: section.ssl_verify.unwrap_or(true),
        };

        let credentials = resolve_credentials(vendor, &section)?;
        Ok(VendorSettings {
            vendor,
            target: Target::Static {
                endpoint,
                credentials,
            },
            cache_ttl,
        })
    }
}

fn resolve_credentials(vendor: Vendor, section: &VendorConfig) -> Result<Credentials> {
    let user_password = match (&section.username, &section.password) {
        (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(Credentials::UserPassword {
            username: u.clone(),
            password: p.clone(),
        }),
        (Some(_), None) | (None, Some(_)) => {
            return Err(Error::configuration(format!(
                "{vendor}: username and password must be set together"
            )))
        }
        _ => None,
    };
    let api_key = section
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .map(Credentials::ApiKey);

    let missing = |what: &str| {
        Error::configuration(format!(
            "{vendor}: missing credentials ({what}; env {}_*)",
            vendor.env_prefix()
        ))
    };

    match vendor {
        Vendor::Redfish | Vendor::Warewulf => {
            if api_key.is_some() {
                return Err(Error::configuration(format!(
                    "{vendor}: accepts username/password only, not api_key"
                )));
            }
            user_password.ok_or_else(|| missing("username and password"))
        }
        Vendor::Proxmox => {
            if user_password.is_some() {
                return Err(Error::configuration(format!(
                    "{vendor}: accepts an API token (api_key = \"user@realm!tokenid=secret\") only"
                )));
            }
            api_key.ok_or_else(|| missing("api_key"))
        }
        Vendor::Pfsense | Vendor::Truenas => match (api_key, user_password) {
            (Some(_), Some(_)) => Err(Error::configuration(format!(
                "{vendor}: set either api_key or username/password, not both"
            ))),
            (Some(key), None) => Ok(key),
            (None, Some(up)) => Ok(up),
            (None, None) => Err(missing("api_key or username and password")),
        },
    }
}

fn parse_bool(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}
