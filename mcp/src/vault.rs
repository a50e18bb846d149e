//! `infra-mcp vault ...`: operator management of the credential store.
//!
//! Passwords are only ever read from environment variables so they never
//! appear in shell history or `ps` output.

use std::path::PathBuf;

use infra_mcp_core::config::{Config, Target};
use infra_mcp_core::error::{Error, Result};
use infra_mcp_core::{CredentialRecord, Secret, Vault, VaultOptions};
use serde_json::{json, Value};

use crate::config::{HostArgs, VaultAction, VaultArgs};

/// Execute one vault command and return what to print on stdout.
pub async fn run(
    args: VaultArgs,
    config: &Config,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Value> {
    run_with(args, config, env, VaultOptions::default()).await
}

async fn run_with(
    args: VaultArgs,
    config: &Config,
    env: impl Fn(&str) -> Option<String>,
    options: VaultOptions,
) -> Result<Value> {
    let (path, configured_env) = locate(&args, config);
    let master_env = args.master_password_env(configured_env.as_deref());
    let master = || {
        env(&master_env).filter(|p| !p.is_empty()).ok_or_else(|| {
            Error::configuration(format!("set the master password in {master_env}"))
        })
    };

    match args.action {
        VaultAction::Add(host) => {
            let record = record_from(host, &env)?;
            let name = record.host_name.clone();
            let vault = Vault::open_with(&path, &master()?, options).await?;
            vault.add(record).await?;
            Ok(json!({ "added": name, "path": path }))
        }
        VaultAction::Update(host) => {
            let record = record_from(host, &env)?;
            let name = record.host_name.clone();
            let vault = Vault::open_with(&path, &master()?, options).await?;
            vault.update(record).await?;
            Ok(json!({ "updated": name, "path": path }))
        }
        VaultAction::Remove { name } => {
            let vault = Vault::open_with(&path, &master()?, options).await?;
            vault.remove(&name).await?;
            Ok(json!({ "removed": name, "path": path }))
        }
        VaultAction::List => {
            require_existing(&path)?;
            let vault = Vault::open_with(&path, &master()?, options).await?;
            Ok(json!({ "hosts": vault.list().await, "path": path }))
        }
        VaultAction::Show { name } => {
            require_existing(&path)?;
            let vault = Vault::open_with(&path, &master()?, options).await?;
            Ok(describe(&vault.get(&name).await?))
        }
        VaultAction::Migrate { key_file } => {
            let vault = Vault::open_legacy(&path, &key_file).await?;
            vault.migrate(&master()?, options).await?;
            Ok(json!({
                "migrated": path,
                "hosts": vault.list().await.len(),
                "note": format!("{} can now be deleted", key_file.display()),
            }))
        }
    }
}

/// Store path and master password variable, from flags or the vendor's
/// `[vendor.<name>.vault]` section.
fn locate(args: &VaultArgs, config: &Config) -> (PathBuf, Option<String>) {
    let configured = match config.resolve_vendor(args.vendor) {
        Ok(settings) => match settings.target {
            Target::Vault {
                path,
                master_password_env,
                ..
            } => Some((path, master_password_env)),
            Target::Static { .. } => None,
        },
        Err(_) => None,
    };
    match (&args.path, configured) {
        (Some(path), configured) => (path.clone(), configured.map(|(_, env)| env)),
        (None, Some((path, env))) => (path, Some(env)),
        (None, None) => (default_path(args), None),
    }
}

fn default_path(args: &VaultArgs) -> PathBuf {
    let path = format!("~/.config/infra-mcp/{}.vault.json", args.vendor);
    PathBuf::from(infra_mcp_core::config::expand_tilde(&path).as_ref())
}

fn require_existing(path: &std::path::Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(Error::not_found(format!("no vault at {}", path.display())))
    }
}

fn record_from(host: HostArgs, env: &impl Fn(&str) -> Option<String>) -> Result<CredentialRecord> {
    let password = env(&host.password_env).filter(|p| !p.is_empty()).ok_or_else(|| {
        Error::configuration(format!(
            "set the password for '{}' in {}",
            host.name, host.password_env
        ))
    })?;
    let record = CredentialRecord {
        host_name: host.name,
        host: host.host,
        port: host.port,
        protocol: host.protocol,
        username: host.username,
        password: Secret::new(password),
        ssl_verify: !host.insecure,
        enabled: !host.disabled,
    };
    record.validate()?;
    Ok(record)
}

fn describe(record: &CredentialRecord) -> Value {
    json!({
        "name": record.host_name,
        "url": record.endpoint().base_url(),
        "username": record.username,
        "ssl_verify": record.ssl_verify,
        "enabled": record.enabled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Cli, Command};
    use clap::Parser;

    fn vault_args(argv: &[&str]) -> VaultArgs {
        let mut full = vec!["infra-mcp", "vault"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Command::Vault(args) => args,
            Command::Serve { .. } => panic!("expected vault command"),
        }
    }

    const FAST: VaultOptions = VaultOptions { iterations: 1_000 };

    async fn run(args: VaultArgs, config: &Config, env: fn(&str) -> Option<String>) -> Result<Value> {
        run_with(args, config, env, FAST).await
    }

    fn env(name: &str) -> Option<String> {
        match name {
            "INFRA_MCP_MASTER_PASSWORD" => Some("correct horse".into()),
            "INFRA_MCP_HOST_PASSWORD" => Some("calvin".into()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn add_show_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redfish.vault.json");
        let p = path.to_str().unwrap();
        let config = Config::default();

        let added = run(
            vault_args(&["--path", p, "add", "r650-01", "--host", "10.0.0.11", "--username", "root", "--insecure"]),
            &config,
            env,
        )
        .await
        .unwrap();
        assert_eq!(added["added"], "r650-01");

        let shown = run(vault_args(&["--path", p, "show", "r650-01"]), &config, env)
            .await
            .unwrap();
        assert_eq!(shown["url"], "https://10.0.0.11:443");
        assert_eq!(shown["ssl_verify"], false);
        assert!(!shown.to_string().contains("calvin"));
        assert!(!std::fs::read_to_string(&path).unwrap().contains("calvin"));

        run(vault_args(&["--path", p, "remove", "r650-01"]), &config, env)
            .await
            .unwrap();
        let listed = run(vault_args(&["--path", p, "list"]), &config, env)
            .await
            .unwrap();
        assert_eq!(listed["hosts"], json!([]));
    }

    #[tokio::test]
    async fn missing_passwords_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.json");
        let p = path.to_str().unwrap();
        let config = Config::default();

        let err = run(
            vault_args(&["--path", p, "add", "h", "--host", "h", "--username", "u", "--password-env", "UNSET_VAR"]),
            &config,
            env,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("UNSET_VAR"));

        let err = run(
            vault_args(&["--path", p, "--master-password-env", "ALSO_UNSET", "remove", "h"]),
            &config,
            env,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("ALSO_UNSET"));
    }

    #[tokio::test]
    async fn list_without_store_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("absent.json");
        let err = run(
            vault_args(&["--path", p.to_str().unwrap(), "list"]),
            &Config::default(),
            env,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), infra_mcp_core::ErrorKind::NotFound);
    }

    #[test]
    fn path_and_env_come_from_config() {
        let config = Config::from_toml(
            r#"
            [vendor.warewulf.vault]
            path = "/etc/infra-mcp/ww.vault.json"
            master_password_env = "WW_VAULT_PW"
            "#,
        )
        .unwrap();
        let args = vault_args(&["--vendor", "warewulf", "list"]);
        let (path, configured) = locate(&args, &config);
        assert_eq!(path, PathBuf::from("/etc/infra-mcp/ww.vault.json"));
        assert_eq!(args.master_password_env(configured.as_deref()), "WW_VAULT_PW");
    }
}
