//! Proxmox VE through its API2 JSON interface, authenticated with an API
//! token (`Authorization: PVEAPIToken=user@realm!tokenid=secret`).

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use super::{count, success, unwrap_data, ClientSettings};
use crate::args;
use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::registry::{bind, object_schema, Tool, ToolRegistry};
use crate::resilience::ResilientTransport;
use crate::transport::{Auth, Endpoint, Request};

const API: &str = "/api2/json";

pub const VM_ACTIONS: &[&str] = &[
    "start", "stop", "shutdown", "reboot", "reset", "suspend", "resume",
];

pub const RESOURCE_TYPES: &[&str] = &["vm", "storage", "node", "sdn"];

pub struct ProxmoxClient {
    http: ResilientTransport,
}

#[derive(Debug, Deserialize)]
struct VmRef {
    node: String,
    vmid: u32,
}

impl ProxmoxClient {
    pub fn new(http: ResilientTransport) -> Self {
        Self { http }
    }

    pub fn connect(
        endpoint: &Endpoint,
        credentials: &Credentials,
        settings: &ClientSettings,
    ) -> Result<Self> {
        let Credentials::ApiKey(token) = credentials else {
            return Err(Error::configuration(
                "proxmox requires an API token (user@realm!tokenid=secret)",
            ));
        };
        let auth = Auth::Header {
            name: "Authorization".into(),
            value: format!("PVEAPIToken={}", token.expose()),
        };
        Ok(Self::new(settings.connect(endpoint, auth)?))
    }

    fn nodes_path() -> Request {
        Request::get(format!("{API}/nodes"))
    }

    async fn fetch(&self, request: Request) -> Result<Value> {
        Ok(unwrap_data(self.http.send(request).await?))
    }

    pub async fn version(&self) -> Result<Value> {
        let data = self.fetch(Request::get(format!("{API}/version"))).await?;
        let message = format!(
            "Proxmox VE {}",
            data["version"].as_str().unwrap_or("version unknown")
        );
        Ok(success(data, message))
    }

    pub async fn nodes(&self) -> Result<Value> {
        let data = self.fetch(Self::nodes_path()).await?;
        let message = format!("{} nodes", count(&data));
        Ok(success(data, message))
    }

    pub async fn node_status(&self, node: &str) -> Result<Value> {
        let data = self
            .fetch(Self::nodes_path().segment(node).segment("status"))
            .await?;
        Ok(success(data, format!("Status of node {node}")))
    }

    pub async fn vms(&self, node: &str) -> Result<Value> {
        let data = self
            .fetch(Self::nodes_path().segment(node).segment("qemu"))
            .await?;
        let message = format!("{} VMs on {node}", count(&data));
        Ok(success(data, message))
    }

    pub async fn vm_status(&self, node: &str, vmid: u32) -> Result<Value> {
        let request = Self::nodes_path()
            .segment(node)
            .segment("qemu")
            .segment(vmid.to_string())
            .segment("status")
            .segment("current");
        let data = self.fetch(request).await?;
        let message = format!(
            "VM {vmid} is {}",
            data["status"].as_str().unwrap_or("in an unknown state")
        );
        Ok(success(data, message))
    }

    /// Returns the UPID of the task Proxmox started.
    pub async fn vm_action(&self, node: &str, vmid: u32, action: &str) -> Result<Value> {
        let request = Request::post(format!("{API}/nodes"))
            .segment(node)
            .segment("qemu")
            .segment(vmid.to_string())
            .segment("status")
            .segment(action);
        let upid = self.fetch(request).await?;
        Ok(success(
            json!({ "upid": upid }),
            format!("VM {vmid}: {action} task started"),
        ))
    }

    pub async fn containers(&self, node: &str) -> Result<Value> {
        let data = self
            .fetch(Self::nodes_path().segment(node).segment("lxc"))
            .await?;
        let message = format!("{} containers on {node}", count(&data));
        Ok(success(data, message))
    }

    /// Cluster-wide storage definitions, or one node's storage with usage.
    pub async fn storage(&self, node: Option<&str>) -> Result<Value> {
        let request = match node {
            Some(node) => Self::nodes_path().segment(node).segment("storage"),
            None => Request::get(format!("{API}/storage")),
        };
        let data = self.fetch(request).await?;
        let message = format!("{} storage entries", count(&data));
        Ok(success(data, message))
    }

    pub async fn cluster_resources(&self, kind: Option<&str>) -> Result<Value> {
        let mut request = Request::get(format!("{API}/cluster/resources"));
        if let Some(kind) = kind {
            request = request.query("type", kind);
        }
        let data = self.fetch(request).await?;
        let message = format!("{} cluster resources", count(&data));
        Ok(success(data, message))
    }

    pub async fn tasks(&self, node: &str, limit: u64) -> Result<Value> {
        let request = Self::nodes_path()
            .segment(node)
            .segment("tasks")
            .query("limit", limit.to_string());
        let data = self.fetch(request).await?;
        let message = format!("{} recent tasks on {node}", count(&data));
        Ok(success(data, message))
    }

    pub async fn delete_vm(&self, node: &str, vmid: u32, purge: bool) -> Result<Value> {
        let mut request = Request::delete(format!("{API}/nodes"))
            .segment(node)
            .segment("qemu")
            .segment(vmid.to_string());
        if purge {
            request = request
                .query("purge", "1")
                .query("destroy-unreferenced-disks", "1");
        }
        let upid = self.fetch(request).await?;
        Ok(success(
            json!({ "upid": upid }),
            format!("VM {vmid}: delete task started"),
        ))
    }
}

fn node_property() -> Value {
    json!({ "type": "string", "description": "Node name, e.g. pve1" })
}

fn vmid_property() -> Value {
    json!({ "type": "integer", "minimum": 100, "maximum": 999_999_999 })
}

fn vm_schema(extra: Value, extra_required: &[&'static str]) -> Value {
    let mut properties = json!({ "node": node_property(), "vmid": vmid_property() });
    if let (Some(props), Value::Object(extra)) = (properties.as_object_mut(), extra) {
        props.extend(extra);
    }
    let mut required = vec!["node", "vmid"];
    required.extend_from_slice(extra_required);
    object_schema(properties, &required)
}

pub fn register(registry: &mut ToolRegistry, client: Arc<ProxmoxClient>) -> Result<()> {
    let node_only = || object_schema(json!({ "node": node_property() }), &["node"]);

    registry.register(
        Tool::new(
            "proxmox_version",
            "Proxmox VE version.",
            object_schema(json!({}), &[]),
        ),
        bind(&client, |c, _| async move { c.version().await }),
    )?;
    registry.register(
        Tool::new(
            "proxmox_nodes",
            "Cluster nodes with CPU, memory and uptime.",
            object_schema(json!({}), &[]),
        ),
        bind(&client, |c, _| async move { c.nodes().await }),
    )?;
    registry.register(
        Tool::new("proxmox_node_status", "Detailed status of one node.", node_only()),
        bind(&client, |c, args| async move {
            c.node_status(args::required_str(&args, "node")?).await
        }),
    )?;
    registry.register(
        Tool::new("proxmox_vms", "QEMU virtual machines on a node.", node_only()),
        bind(&client, |c, args| async move {
            c.vms(args::required_str(&args, "node")?).await
        }),
    )?;
    registry.register(
        Tool::new(
            "proxmox_vm_status",
            "Current status of one VM.",
            vm_schema(json!({}), &[]),
        ),
        bind(&client, |c, args| async move {
            let vm: VmRef = args::parse(&args)?;
            c.vm_status(&vm.node, vm.vmid).await
        }),
    )?;
    registry.register(
        Tool::new(
            "proxmox_vm_action",
            "Start, stop, shut down, reboot, reset, suspend or resume a VM.",
            vm_schema(json!({ "action": { "type": "string", "enum": VM_ACTIONS } }), &["action"]),
        )
        .destructive(),
        bind(&client, |c, args| async move {
            let vm: VmRef = args::parse(&args)?;
            let action = args::required_enum(&args, "action", VM_ACTIONS)?;
            c.vm_action(&vm.node, vm.vmid, action).await
        }),
    )?;
    registry.register(
        Tool::new("proxmox_containers", "LXC containers on a node.", node_only()),
        bind(&client, |c, args| async move {
            c.containers(args::required_str(&args, "node")?).await
        }),
    )?;
    registry.register(
        Tool::new(
            "proxmox_storage",
            "Storage definitions, or one node's storage with usage when node is given.",
            object_schema(json!({ "node": node_property() }), &[]),
        ),
        bind(&client, |c, args| async move {
            c.storage(args::optional_str(&args, "node")).await
        }),
    )?;
    registry.register(
        Tool::new(
            "proxmox_cluster_resources",
            "All cluster resources, optionally filtered by type.",
            object_schema(
                json!({ "type": { "type": "string", "enum": RESOURCE_TYPES } }),
                &[],
            ),
        ),
        bind(&client, |c, args| async move {
            c.cluster_resources(args::optional_str(&args, "type")).await
        }),
    )?;
    registry.register(
        Tool::new(
            "proxmox_tasks",
            "Recent tasks on a node.",
            object_schema(
                json!({
                    "node": node_property(),
                    "limit": { "type": "integer", "minimum": 1, "maximum": 500, "default": 50 }
                }),
                &["node"],
            ),
        ),
        bind(&client, |c, args| async move {
            let node = args::required_str(&args, "node")?;
            c.tasks(node, args::optional_u64(&args, "limit").unwrap_or(50)).await
        }),
    )?;
    registry.register(
        Tool::new(
            "proxmox_delete_vm",
            "Delete a VM. With purge, also remove it from jobs and delete unreferenced disks.",
            vm_schema(json!({ "purge": { "type": "boolean", "default": false } }), &[]),
        )
        .destructive(),
        bind(&client, |c, args| async move {
            let vm: VmRef = args::parse(&args)?;
            let purge = args::optional_bool(&args, "purge").unwrap_or(false);
            c.delete_vm(&vm.node, vm.vmid, purge).await
        }),
    )?;
    Ok(())
}
