//! Wiring from validated configuration to a ready [`Dispatcher`].

use std::sync::Arc;

use crate::config::{Config, Credentials, Target, Vendor, VendorSettings};
use crate::error::{Error, Result};
use crate::fleet::{ClientFactory, Fleet};
use crate::registry::{Dispatcher, ToolRegistry};
use crate::transport::Endpoint;
use crate::vault::{CredentialRecord, Vault, VaultOptions};
use crate::vendors::{pfsense, proxmox, redfish, truenas, warewulf, ClientSettings};

/// One vendor's tool catalog with its clients constructed. Front-ends hold
/// it for the life of the process.
pub struct AppContext {
    vendor: Vendor,
    dispatcher: Arc<Dispatcher>,
}

impl AppContext {
    /// Build from the process environment (master passwords come from env vars).
    pub async fn build(vendor: Vendor, config: &Config) -> Result<Self> {
        Self::build_with(
            vendor,
            config,
            |name| std::env::var(name).ok(),
            VaultOptions::default(),
        )
        .await
    }

    pub async fn build_with(
        vendor: Vendor,
        config: &Config,
        env: impl Fn(&str) -> Option<String>,
        vault_options: VaultOptions,
    ) -> Result<Self> {
        let settings = config.resolve_vendor(vendor)?;
        let client_settings = ClientSettings::from_config(config);
        let mut registry = ToolRegistry::new();

        match vendor {
            Vendor::Redfish => {
                let fleet =
                    build_fleet(&settings, redfish::factory(client_settings), &env, vault_options)
                        .await?;
                redfish::register(&mut registry, fleet)?;
            }
            Vendor::Warewulf => {
                let fleet =
                    build_fleet(&settings, warewulf::factory(client_settings), &env, vault_options)
                        .await?;
                warewulf::register(&mut registry, fleet)?;
            }
            Vendor::Pfsense => {
                let (endpoint, credentials) = static_target(&settings)?;
                let client = pfsense::PfsenseClient::connect(endpoint, credentials, &client_settings)?;
                pfsense::register(&mut registry, Arc::new(client))?;
            }
            Vendor::Proxmox => {
                let (endpoint, credentials) = static_target(&settings)?;
                let client =
                    proxmox::ProxmoxClient::connect(endpoint, credentials, &client_settings)?;
                proxmox::register(&mut registry, Arc::new(client))?;
            }
            Vendor::Truenas => {
                let (endpoint, credentials) = static_target(&settings)?;
                let client = truenas::TruenasClient::connect(
                    endpoint,
                    credentials,
                    settings.cache_ttl,
                    &client_settings,
                )?;
                truenas::register(&mut registry, Arc::new(client))?;
            }
        }

        tracing::info!(%vendor, tools = registry.len(), "tool catalog ready");
        Ok(Self {
            vendor,
            dispatcher: Arc::new(Dispatcher::new(registry)),
        })
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

fn static_target(settings: &VendorSettings) -> Result<(&Endpoint, &Credentials)> {
    match &settings.target {
        Target::Static {
            endpoint,
            credentials,
        } => Ok((endpoint, credentials)),
        Target::Vault { .. } => Err(Error::configuration(format!(
            "{}: a credential vault is not supported",
            settings.vendor
        ))),
    }
}

async fn build_fleet<C>(
    settings: &VendorSettings,
    factory: ClientFactory<C>,
    env: &impl Fn(&str) -> Option<String>,
    vault_options: VaultOptions,
) -> Result<Arc<Fleet<C>>> {
    match &settings.target {
        Target::Vault {
            path,
            master_password_env,
            default_host,
        } => {
            let password = env(master_password_env)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    Error::configuration(format!(
                        "{}: vault {} needs the master password in {master_password_env}",
                        settings.vendor,
                        path.display()
                    ))
                })?;
            let vault = Vault::open_with(path.clone(), &password, vault_options).await?;
            tracing::info!(
                vendor = %settings.vendor,
                path = %path.display(),
                hosts = vault.list().await.len(),
                "credential vault loaded"
            );
            Ok(Arc::new(Fleet::with_vault(
                Arc::new(vault),
                default_host.clone(),
                factory,
            )))
        }
        Target::Static {
            endpoint,
            credentials,
        } => {
            let Credentials::UserPassword { username, password } = credentials else {
                return Err(Error::configuration(format!(
                    "{}: requires username and password",
                    settings.vendor
                )));
            };
            let record = CredentialRecord {
                host_name: endpoint.host.clone(),
                host: endpoint.host.clone(),
                port: endpoint.port,
                protocol: endpoint.protocol,
                username: username.clone(),
                password: password.clone(),
                ssl_verify: endpoint.ssl_verify,
                enabled: true,
            };
            Ok(Arc::new(Fleet::single(record, factory)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::Protocol;
    use crate::vault::Secret;
    use serde_json::json;

    const FAST: VaultOptions = VaultOptions { iterations: 1_000 };

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn tool_names(ctx: &AppContext) -> Vec<String> {
        ctx.dispatcher()
            .list_tools()
            .iter()
            .filter_map(|t| t["name"].as_str().map(String::from))
            .collect()
    }

    #[tokio::test]
    async fn static_vendor_registers_its_catalog_only() {
        let config = Config::from_toml(
            r#"
            [vendor.proxmox]
            host = "pve.lab"
            api_key = "root@pam!mcp=0000"
            "#,
        )
        .unwrap();
        let ctx = AppContext::build_with(Vendor::Proxmox, &config, no_env, FAST)
            .await
            .unwrap();
        assert_eq!(ctx.vendor(), Vendor::Proxmox);
        let names = tool_names(&ctx);
        assert!(names.contains(&"proxmox_vm_action".to_string()));
        assert!(names.iter().all(|n| n.starts_with("proxmox_")));
    }

    #[tokio::test]
    async fn every_vendor_builds_from_static_config() {
        let config = Config::from_toml(
            r#"
            [vendor.redfish]
            host = "idrac.lab"
            username = "root"
            password = "calvin"
            [vendor.pfsense]
            host = "fw.lab"
            api_key = "k"
            [vendor.proxmox]
            host = "pve.lab"
            api_key = "root@pam!mcp=0000"
            [vendor.truenas]
            host = "nas.lab"
            username = "admin"
            password = "pw"
            [vendor.warewulf]
            host = "ww.lab"
            username = "wwapi"
            password = "pw"
            "#,
        )
        .unwrap();
        for vendor in Vendor::ALL {
            let ctx = AppContext::build_with(vendor, &config, no_env, FAST)
                .await
                .unwrap();
            assert!(!ctx.dispatcher().registry().is_empty(), "{vendor}");
        }
    }

    #[tokio::test]
    async fn missing_section_is_configuration_error() {
        let err = AppContext::build_with(Vendor::Truenas, &Config::default(), no_env, FAST)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn fleet_from_vault() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redfish.vault.json");
        let vault = Vault::open_with(&path, "master", FAST).await.unwrap();
        vault
            .add(CredentialRecord {
                host_name: "r650-01".into(),
                host: "10.0.0.11".into(),
                port: 443,
                protocol: Protocol::Https,
                username: "root".into(),
                password: Secret::new("calvin"),
                ssl_verify: false,
                enabled: true,
            })
            .await
            .unwrap();

        let config = Config::from_toml(&format!(
            r#"
            [vendor.redfish.vault]
            path = "{}"
            master_password_env = "TEST_VAULT_PW"
            "#,
            path.display()
        ))
        .unwrap();

        let env = |name: &str| (name == "TEST_VAULT_PW").then(|| "master".to_string());
        let ctx = AppContext::build_with(Vendor::Redfish, &config, env, FAST)
            .await
            .unwrap();
        let listed = ctx
            .dispatcher()
            .call("redfish_list_servers", json!({}))
            .await;
        assert!(!listed.is_error, "{}", listed.text());
        assert!(listed.text().contains("r650-01"));
        assert!(!listed.text().contains("calvin"));

        let err = AppContext::build_with(Vendor::Redfish, &config, no_env, FAST)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("TEST_VAULT_PW"));
    }

    #[tokio::test]
    async fn wrong_master_password_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ww.vault.json");
        let vault = Vault::open_with(&path, "right", FAST).await.unwrap();
        vault.persist().await.unwrap();

        let config = Config::from_toml(&format!(
            "[vendor.warewulf.vault]\npath = \"{}\"\nmaster_password_env = \"PW\"\n",
            path.display()
        ))
        .unwrap();
        let env = |_: &str| Some("wrong".to_string());
        let err = AppContext::build_with(Vendor::Warewulf, &config, env, FAST)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }
}
