//! Per-host client resolution for fleet-managed vendors.
//!
//! Handlers call [`Fleet::resolve`] with an optional host name. If omitted,
//! the configured default host is used, so single-host setups work without
//! naming a host on every call. Clients are built on first use from the
//! credential record and reused afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::vault::{CredentialRecord, Vault};

/// Builds a vendor client from a decrypted credential record.
pub type ClientFactory<C> = Arc<dyn Fn(&CredentialRecord) -> Result<C> + Send + Sync>;

/// Summary of a configured host. Never carries the password.
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub name: String,
    pub url: String,
    pub username: String,
    pub enabled: bool,
}

enum Source {
    Vault(Arc<Vault>),
    /// One statically configured host, used when no vault is set up.
    Single(CredentialRecord),
}

pub struct Fleet<C> {
    source: Source,
    default_host: Option<String>,
    factory: ClientFactory<C>,
    clients: RwLock<HashMap<String, Arc<C>>>,
}

impl<C> Fleet<C> {
    pub fn with_vault(
        vault: Arc<Vault>,
        default_host: Option<String>,
        factory: ClientFactory<C>,
    ) -> Self {
        Self {
            source: Source::Vault(vault),
            default_host,
            factory,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn single(record: CredentialRecord, factory: ClientFactory<C>) -> Self {
        Self {
            default_host: Some(record.host_name.clone()),
            source: Source::Single(record),
            factory,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a host's client by name (defaults to the configured default).
    pub async fn resolve(&self, host: Option<&str>) -> Result<Arc<C>> {
        self.resolve_with_name(host).await.map(|(_, client)| client)
    }

    /// Resolve and return both the host name and its client.
    pub async fn resolve_with_name(&self, host: Option<&str>) -> Result<(String, Arc<C>)> {
        let name = self.target_name(host).await?;

        if let Some(client) = self.clients.read().await.get(&name) {
            return Ok((name, Arc::clone(client)));
        }

        let record = self.record(&name).await?;
        if !record.enabled {
            return Err(Error::validation(format!("host '{name}' is disabled")));
        }
        let client = Arc::new((self.factory)(&record)?);

        let mut clients = self.clients.write().await;
        // Another caller may have built it while we were outside the lock
        let client = clients.entry(name.clone()).or_insert(client);
        tracing::debug!(host = %name, url = %record.endpoint().base_url(), "host client ready");
        Ok((name, Arc::clone(client)))
    }

    /// All configured hosts, sorted by name.
    pub async fn list_hosts(&self) -> Result<Vec<HostInfo>> {
        let records = match &self.source {
            Source::Single(record) => vec![record.clone()],
            Source::Vault(vault) => {
                let mut records = Vec::new();
                for name in vault.list().await {
                    records.push(vault.get(&name).await?);
                }
                records
            }
        };
        Ok(records
            .into_iter()
            .map(|r| HostInfo {
                url: r.endpoint().base_url(),
                name: r.host_name,
                username: r.username,
                enabled: r.enabled,
            })
            .collect())
    }

    pub fn default_host(&self) -> Option<&str> {
        self.default_host.as_deref()
    }

    /// Drop a cached client so the next resolve rebuilds it.
    pub async fn forget(&self, name: &str) {
        self.clients.write().await.remove(name);
    }

    async fn target_name(&self, host: Option<&str>) -> Result<String> {
        if let Some(name) = host.filter(|h| !h.trim().is_empty()) {
            return Ok(name.to_string());
        }
        if let Some(name) = &self.default_host {
            return Ok(name.clone());
        }
        // A vault holding exactly one host needs no default
        if let Source::Vault(vault) = &self.source {
            let names = vault.list().await;
            if let [only] = names.as_slice() {
                return Ok(only.clone());
            }
            if !names.is_empty() {
                return Err(Error::validation(format!(
                    "no host given and no default host configured (available: {})",
                    names.join(", ")
                )));
            }
        }
        Err(Error::configuration("no hosts configured"))
    }

    async fn record(&self, name: &str) -> Result<CredentialRecord> {
        match &self.source {
            Source::Vault(vault) => vault.get(name).await,
            Source::Single(record) if record.host_name == name => Ok(record.clone()),
            Source::Single(_) => Err(Error::not_found(format!("host '{name}'"))),
        }
    }
}
