//! TrueNAS SCALE/CORE through REST API v2.0.
//!
//! `/system/info` and `/system/version` change only across upgrades and
//! reboots, so they are served from a [`ResponseCache`] and dropped whenever
//! this client reboots or shuts the box down.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use super::{count, success, ClientSettings};
use crate::args;
use crate::cache::ResponseCache;
use crate::config::Credentials;
use crate::error::Result;
use crate::registry::{bind, object_schema, Tool, ToolRegistry};
use crate::resilience::ResilientTransport;
use crate::transport::{Auth, Endpoint, Request};

const API: &str = "/api/v2.0";

const SYSTEM_INFO_KEY: &str = "system_info";
const VERSION_KEY: &str = "version";

pub struct TruenasClient {
    http: ResilientTransport,
    cache: ResponseCache<Value>,
    cache_ttl: Duration,
}

#[derive(Debug, Deserialize)]
struct NewDataset {
    name: String,
    #[serde(default)]
    compression: Option<String>,
    #[serde(default)]
    quota: Option<u64>,
    #[serde(default)]
    comments: Option<String>,
}

impl TruenasClient {
    pub fn new(http: ResilientTransport, cache_ttl: Duration) -> Self {
        Self {
            http,
            cache: ResponseCache::new(),
            cache_ttl,
        }
    }

    pub fn connect(
        endpoint: &Endpoint,
        credentials: &Credentials,
        cache_ttl: Duration,
        settings: &ClientSettings,
    ) -> Result<Self> {
        let auth = match credentials {
            Credentials::ApiKey(key) => Auth::Bearer(key.expose().to_string()),
            Credentials::UserPassword { username, password } => Auth::Basic {
                username: username.clone(),
                password: password.expose().to_string(),
            },
        };
        Ok(Self::new(settings.connect(endpoint, auth)?, cache_ttl))
    }

    fn get(path: &str) -> Request {
        Request::get(format!("{API}{path}"))
    }

    async fn cached(&self, key: &str, path: &str) -> Result<Value> {
        self.cache
            .get_or_fetch(key, self.cache_ttl, || self.http.send(Self::get(path)))
            .await
    }

    pub async fn system_info(&self) -> Result<Value> {
        let data = self.cached(SYSTEM_INFO_KEY, "/system/info").await?;
        let message = format!(
            "{} on {}",
            data["version"].as_str().unwrap_or("TrueNAS"),
            data["hostname"].as_str().unwrap_or("unknown host")
        );
        Ok(success(data, message))
    }

    pub async fn version(&self) -> Result<Value> {
        let data = self.cached(VERSION_KEY, "/system/version").await?;
        let message = data.as_str().unwrap_or("version unknown").to_string();
        Ok(success(json!({ "version": data }), message))
    }

    pub async fn pools(&self) -> Result<Value> {
        let pools = self.http.send(Self::get("/pool")).await?;
        let summary: Vec<Value> = pools
            .as_array()
            .into_iter()
            .flatten()
            .map(|p| {
                json!({
                    "id": p["id"],
                    "name": p["name"],
                    "status": p["status"],
                    "healthy": p["healthy"],
                    "size": p["size"],
                    "allocated": p["allocated"],
                    "free": p["free"],
                })
            })
            .collect();
        let message = format!("{} pools", summary.len());
        Ok(success(json!(summary), message))
    }

    pub async fn pool(&self, id: u64) -> Result<Value> {
        let data = self
            .http
            .send(Self::get("/pool/id").segment(id.to_string()))
            .await?;
        let message = format!(
            "Pool {} is {}",
            data["name"].as_str().unwrap_or("?"),
            data["status"].as_str().unwrap_or("in an unknown state")
        );
        Ok(success(data, message))
    }

    /// All datasets, or only those under `pool` when given.
    pub async fn datasets(&self, pool: Option<&str>) -> Result<Value> {
        let mut request = Self::get("/pool/dataset");
        if let Some(pool) = pool {
            request = request.query("pool", pool);
        }
        let data = self.http.send(request).await?;
        let message = format!("{} datasets", count(&data));
        Ok(success(data, message))
    }

    async fn create_dataset(&self, dataset: NewDataset) -> Result<Value> {
        let mut body = json!({ "name": dataset.name, "type": "FILESYSTEM" });
        if let Some(compression) = dataset.compression {
            body["compression"] = json!(compression);
        }
        if let Some(quota) = dataset.quota {
            body["quota"] = json!(quota);
        }
        if let Some(comments) = dataset.comments {
            body["comments"] = json!(comments);
        }
        let data = self
            .http
            .send(Request::post(format!("{API}/pool/dataset")).json(body))
            .await?;
        Ok(success(data, format!("Dataset {} created", dataset.name)))
    }

    /// `id` is the full dataset path (`tank/media`); it is sent as one
    /// encoded path segment.
    pub async fn delete_dataset(&self, id: &str, recursive: bool) -> Result<Value> {
        let data = self
            .http
            .send(
                Request::delete(format!("{API}/pool/dataset/id"))
                    .segment(id)
                    .json(json!({ "recursive": recursive })),
            )
            .await?;
        Ok(success(data, format!("Dataset {id} deleted")))
    }

    pub async fn shares(&self) -> Result<Value> {
        let smb = self.http.send(Self::get("/sharing/smb")).await?;
        let nfs = self.http.send(Self::get("/sharing/nfs")).await?;
        let message = format!("{} SMB shares, {} NFS exports", count(&smb), count(&nfs));
        Ok(success(json!({ "smb": smb, "nfs": nfs }), message))
    }

    pub async fn services(&self) -> Result<Value> {
        let data = self.http.send(Self::get("/service")).await?;
        let running = data
            .as_array()
            .into_iter()
            .flatten()
            .filter(|s| s["state"] == "RUNNING")
            .count();
        let message = format!("{running} of {} services running", count(&data));
        Ok(success(data, message))
    }

    pub async fn alerts(&self) -> Result<Value> {
        let data = self.http.send(Self::get("/alert/list")).await?;
        let message = format!("{} alerts", count(&data));
        Ok(success(data, message))
    }

    pub async fn reboot(&self, delay: Option<u64>) -> Result<Value> {
        self.power("/system/reboot", delay).await?;
        Ok(success(Value::Null, "Reboot initiated"))
    }

    pub async fn shutdown(&self, delay: Option<u64>) -> Result<Value> {
        self.power("/system/shutdown", delay).await?;
        Ok(success(Value::Null, "Shutdown initiated"))
    }

    async fn power(&self, path: &str, delay: Option<u64>) -> Result<Value> {
        let mut body = json!({});
        if let Some(delay) = delay {
            body["delay"] = json!(delay);
        }
        let result = self
            .http
            .send(Request::post(format!("{API}{path}")).json(body))
            .await;
        // The box may die before answering; stale version info is wrong either way
        self.cache.clear().await;
        result
    }
}

fn empty() -> Value {
    object_schema(json!({}), &[])
}

fn delay_schema() -> Value {
    object_schema(
        json!({ "delay": { "type": "integer", "minimum": 0, "description": "Seconds to wait first" } }),
        &[],
    )
}

pub fn register(registry: &mut ToolRegistry, client: Arc<TruenasClient>) -> Result<()> {
    registry.register(
        Tool::new(
            "truenas_system_info",
            "Hostname, version, uptime, CPU and memory of the NAS.",
            empty(),
        ),
        bind(&client, |c, _| async move { c.system_info().await }),
    )?;
    registry.register(
        Tool::new("truenas_version", "TrueNAS version string.", empty()),
        bind(&client, |c, _| async move { c.version().await }),
    )?;
    registry.register(
        Tool::new("truenas_pools", "ZFS pools with health and capacity.", empty()),
        bind(&client, |c, _| async move { c.pools().await }),
    )?;
    registry.register(
        Tool::new(
            "truenas_pool",
            "Full detail of one pool, including vdev topology.",
            object_schema(json!({ "id": { "type": "integer", "minimum": 1 } }), &["id"]),
        ),
        bind(&client, |c, args| async move {
            c.pool(args::required_u64(&args, "id")?).await
        }),
    )?;
    registry.register(
        Tool::new(
            "truenas_datasets",
            "Datasets, optionally limited to one pool.",
            object_schema(json!({ "pool": { "type": "string" } }), &[]),
        ),
        bind(&client, |c, args| async move {
            c.datasets(args::optional_str(&args, "pool")).await
        }),
    )?;
    registry.register(
        Tool::new(
            "truenas_create_dataset",
            "Create a filesystem dataset.",
            object_schema(
                json!({
                    "name": { "type": "string", "description": "Full path, e.g. tank/media", "pattern": "^[^/]+/.+" },
                    "compression": { "type": "string", "enum": ["OFF", "LZ4", "GZIP", "ZSTD", "ZLE", "LZJB"] },
                    "quota": { "type": "integer", "minimum": 0, "description": "Bytes, 0 for none" },
                    "comments": { "type": "string" }
                }),
                &["name"],
            ),
        ),
        bind(&client, |c, args| async move {
            c.create_dataset(args::parse(&args)?).await
        }),
    )?;
    registry.register(
        Tool::new(
            "truenas_delete_dataset",
            "Delete a dataset and its data. With recursive, children go too.",
            object_schema(
                json!({
                    "id": { "type": "string", "description": "Full path, e.g. tank/media" },
                    "recursive": { "type": "boolean", "default": false }
                }),
                &["id"],
            ),
        )
        .destructive(),
        bind(&client, |c, args| async move {
            let id = args::required_str(&args, "id")?;
            let recursive = args::optional_bool(&args, "recursive").unwrap_or(false);
            c.delete_dataset(id, recursive).await
        }),
    )?;
    registry.register(
        Tool::new("truenas_shares", "SMB shares and NFS exports.", empty()),
        bind(&client, |c, _| async move { c.shares().await }),
    )?;
    registry.register(
        Tool::new("truenas_services", "System services and their state.", empty()),
        bind(&client, |c, _| async move { c.services().await }),
    )?;
    registry.register(
        Tool::new("truenas_alerts", "Active alerts.", empty()),
        bind(&client, |c, _| async move { c.alerts().await }),
    )?;
    registry.register(
        Tool::new("truenas_reboot", "Reboot the NAS.", delay_schema()).destructive(),
        bind(&client, |c, args| async move {
            c.reboot(args::optional_u64(&args, "delay")).await
        }),
    )?;
    registry.register(
        Tool::new("truenas_shutdown", "Power off the NAS.", delay_schema()).destructive(),
        bind(&client, |c, args| async move {
            c.shutdown(args::optional_u64(&args, "delay")).await
        }),
    )?;
    Ok(())
}
