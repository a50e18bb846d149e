//! Dell iDRAC servers over the DMTF Redfish API.
//!
//! Hosts come from the credential vault (or a single configured host), so
//! every tool takes an optional `host` argument resolved through [`Fleet`].

use std::sync::Arc;

use serde_json::{json, Value};

use super::{host_property, success, ClientSettings};
use crate::args;
use crate::error::Result;
use crate::fleet::{ClientFactory, Fleet};
use crate::registry::{bind, object_schema, Tool, ToolRegistry};
use crate::resilience::ResilientTransport;
use crate::transport::{Auth, Request};
use crate::vault::CredentialRecord;

const SYSTEM: &str = "/redfish/v1/Systems/System.Embedded.1";
const CHASSIS: &str = "/redfish/v1/Chassis/System.Embedded.1";
const MANAGER: &str = "/redfish/v1/Managers/iDRAC.Embedded.1";
const FIRMWARE: &str = "/redfish/v1/UpdateService/FirmwareInventory";

pub const RESET_TYPES: &[&str] = &[
    "On",
    "ForceOff",
    "GracefulShutdown",
    "GracefulRestart",
    "ForceRestart",
    "PowerCycle",
    "PushPowerButton",
    "Nmi",
];

const DEFAULT_SEL_LIMIT: u64 = 50;

pub struct RedfishClient {
    http: ResilientTransport,
}

impl RedfishClient {
    pub fn new(http: ResilientTransport) -> Self {
        Self { http }
    }

    pub fn base_url(&self) -> &str {
        self.http.base_url()
    }

    pub async fn system_info(&self) -> Result<Value> {
        let sys = self.http.send(Request::get(SYSTEM)).await?;
        let data = json!({
            "model": sys["Model"],
            "manufacturer": sys["Manufacturer"],
            "service_tag": sys["SKU"],
            "serial_number": sys["SerialNumber"],
            "hostname": sys["HostName"],
            "bios_version": sys["BiosVersion"],
            "power_state": sys["PowerState"],
            "health": sys["Status"]["Health"],
            "processors": {
                "count": sys["ProcessorSummary"]["Count"],
                "model": sys["ProcessorSummary"]["Model"],
            },
            "memory_gib": sys["MemorySummary"]["TotalSystemMemoryGiB"],
        });
        Ok(success(data, "System information retrieved"))
    }

    pub async fn power_state(&self) -> Result<Value> {
        let sys = self.http.send(Request::get(SYSTEM)).await?;
        Ok(success(
            json!({ "power_state": sys["PowerState"] }),
            format!("Power state is {}", sys["PowerState"].as_str().unwrap_or("unknown")),
        ))
    }

    pub async fn power_action(&self, reset_type: &str) -> Result<Value> {
        let body = self
            .http
            .send(
                Request::post(format!("{SYSTEM}/Actions/ComputerSystem.Reset"))
                    .json(json!({ "ResetType": reset_type })),
            )
            .await?;
        Ok(success(
            json!({ "reset_type": reset_type, "response": body }),
            format!("Power action {reset_type} accepted"),
        ))
    }

    pub async fn thermal(&self) -> Result<Value> {
        let thermal = self.http.send(Request::get(format!("{CHASSIS}/Thermal"))).await?;
        let temperatures: Vec<Value> = members(&thermal["Temperatures"])
            .map(|t| {
                json!({
                    "name": t["Name"],
                    "reading_celsius": t["ReadingCelsius"],
                    "upper_critical": t["UpperThresholdCritical"],
                    "health": t["Status"]["Health"],
                })
            })
            .collect();
        let fans: Vec<Value> = members(&thermal["Fans"])
            .map(|f| {
                json!({
                    "name": f["Name"],
                    "reading": f["Reading"],
                    "units": f["ReadingUnits"],
                    "health": f["Status"]["Health"],
                })
            })
            .collect();
        let message = format!("{} temperature sensors, {} fans", temperatures.len(), fans.len());
        Ok(success(
            json!({ "temperatures": temperatures, "fans": fans }),
            message,
        ))
    }

    pub async fn power_usage(&self) -> Result<Value> {
        let power = self.http.send(Request::get(format!("{CHASSIS}/Power"))).await?;
        let control = &power["PowerControl"][0];
        let supplies: Vec<Value> = members(&power["PowerSupplies"])
            .map(|p| {
                json!({
                    "name": p["Name"],
                    "capacity_watts": p["PowerCapacityWatts"],
                    "output_watts": p["LastPowerOutputWatts"],
                    "health": p["Status"]["Health"],
                })
            })
            .collect();
        Ok(success(
            json!({
                "consumed_watts": control["PowerConsumedWatts"],
                "capacity_watts": control["PowerCapacityWatts"],
                "average_watts": control["PowerMetrics"]["AverageConsumedWatts"],
                "max_watts": control["PowerMetrics"]["MaxConsumedWatts"],
                "power_supplies": supplies,
            }),
            "Power usage retrieved",
        ))
    }

    /// Storage controllers with their drive counts. One request for the
    /// collection plus one per controller.
    pub async fn storage(&self) -> Result<Value> {
        let collection = self.http.send(Request::get(format!("{SYSTEM}/Storage"))).await?;
        let mut controllers = Vec::new();
        for member in members(&collection["Members"]) {
            let Some(path) = member["@odata.id"].as_str() else {
                continue;
            };
            let ctrl = self.http.send(Request::get(path)).await?;
            controllers.push(json!({
                "id": ctrl["Id"],
                "name": ctrl["Name"],
                "drives": ctrl["Drives"].as_array().map_or(0, Vec::len),
                "health": ctrl["Status"]["Health"],
            }));
        }
        let message = format!("{} storage controllers", controllers.len());
        Ok(success(json!(controllers), message))
    }

    pub async fn sel_entries(&self, limit: u64) -> Result<Value> {
        let log = self
            .http
            .send(Request::get(format!("{MANAGER}/LogServices/Sel/Entries")))
            .await?;
        let entries: Vec<Value> = members(&log["Members"])
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|e| {
                json!({
                    "id": e["Id"],
                    "created": e["Created"],
                    "severity": e["Severity"],
                    "message": e["Message"],
                })
            })
            .collect();
        let message = format!("{} SEL entries", entries.len());
        Ok(success(json!(entries), message))
    }

    pub async fn clear_sel(&self) -> Result<Value> {
        self.http
            .send(
                Request::post(format!("{MANAGER}/LogServices/Sel/Actions/LogService.ClearLog"))
                    .json(json!({})),
            )
            .await?;
        Ok(success(Value::Null, "System event log cleared"))
    }

    pub async fn firmware_inventory(&self) -> Result<Value> {
        let inventory = self
            .http
            .send(Request::get(FIRMWARE).query("$expand", "*($levels=1)"))
            .await?;
        let items: Vec<Value> = members(&inventory["Members"])
            .filter(|m| m["Id"].as_str().is_some_and(|id| id.starts_with("Installed")))
            .map(|m| {
                json!({
                    "name": m["Name"],
                    "version": m["Version"],
                    "updateable": m["Updateable"],
                })
            })
            .collect();
        let message = format!("{} installed firmware components", items.len());
        Ok(success(json!(items), message))
    }

    pub async fn manager_info(&self) -> Result<Value> {
        let mgr = self.http.send(Request::get(MANAGER)).await?;
        Ok(success(
            json!({
                "model": mgr["Model"],
                "firmware_version": mgr["FirmwareVersion"],
                "date_time": mgr["DateTime"],
                "health": mgr["Status"]["Health"],
            }),
            "iDRAC information retrieved",
        ))
    }
}

fn members(value: &Value) -> impl Iterator<Item = &Value> {
    value.as_array().into_iter().flatten()
}

/// Factory building a client per vault record.
pub fn factory(settings: ClientSettings) -> ClientFactory<RedfishClient> {
    Arc::new(move |record: &CredentialRecord| {
        let auth = Auth::Basic {
            username: record.username.clone(),
            password: record.password.expose().to_string(),
        };
        Ok(RedfishClient::new(settings.connect(&record.endpoint(), auth)?))
    })
}

fn host_only() -> Value {
    object_schema(json!({ "host": host_property() }), &[])
}

pub fn register(registry: &mut ToolRegistry, fleet: Arc<Fleet<RedfishClient>>) -> Result<()> {
    registry.register(
        Tool::new(
            "redfish_list_servers",
            "List iDRAC hosts in the credential vault (names and URLs, never passwords).",
            object_schema(json!({}), &[]),
        ),
        bind(&fleet, |fleet, _args| async move {
            let hosts = fleet.list_hosts().await?;
            let message = format!("{} servers configured", hosts.len());
            Ok(success(
                json!({ "servers": hosts, "default_host": fleet.default_host() }),
                message,
            ))
        }),
    )?;
    registry.register(
        Tool::new(
            "redfish_system_info",
            "Model, service tag, BIOS version, CPU, memory and health of a server.",
            host_only(),
        ),
        bind(&fleet, |fleet, args| async move {
            on_host!(fleet, args, |c| c.system_info())
        }),
    )?;
    registry.register(
        Tool::new("redfish_power_state", "Current power state of a server.", host_only()),
        bind(&fleet, |fleet, args| async move {
            on_host!(fleet, args, |c| c.power_state())
        }),
    )?;
    registry.register(
        Tool::new(
            "redfish_power_action",
            "Power on, off, restart or cycle a server.",
            object_schema(
                json!({
                    "host": host_property(),
                    "reset_type": {
                        "type": "string",
                        "enum": RESET_TYPES,
                        "description": "Redfish ResetType"
                    }
                }),
                &["reset_type"],
            ),
        )
        .destructive(),
        bind(&fleet, |fleet, args| async move {
            let reset_type = args::required_enum(&args, "reset_type", RESET_TYPES)?;
            on_host!(fleet, args, |c| c.power_action(reset_type))
        }),
    )?;
    registry.register(
        Tool::new("redfish_thermal", "Temperature sensors and fan speeds.", host_only()),
        bind(&fleet, |fleet, args| async move {
            on_host!(fleet, args, |c| c.thermal())
        }),
    )?;
    registry.register(
        Tool::new(
            "redfish_power_usage",
            "Current and average power draw plus power supply status.",
            host_only(),
        ),
        bind(&fleet, |fleet, args| async move {
            on_host!(fleet, args, |c| c.power_usage())
        }),
    )?;
    registry.register(
        Tool::new("redfish_storage", "Storage controllers and drive counts.", host_only()),
        bind(&fleet, |fleet, args| async move {
            on_host!(fleet, args, |c| c.storage())
        }),
    )?;
    registry.register(
        Tool::new(
            "redfish_sel_entries",
            "Recent entries from the system event log.",
            object_schema(
                json!({
                    "host": host_property(),
                    "limit": { "type": "integer", "minimum": 1, "maximum": 1000, "default": DEFAULT_SEL_LIMIT }
                }),
                &[],
            ),
        ),
        bind(&fleet, |fleet, args| async move {
            let limit = args::optional_u64(&args, "limit").unwrap_or(DEFAULT_SEL_LIMIT);
            on_host!(fleet, args, |c| c.sel_entries(limit))
        }),
    )?;
    registry.register(
        Tool::new("redfish_clear_sel", "Clear the system event log.", host_only()).destructive(),
        bind(&fleet, |fleet, args| async move {
            on_host!(fleet, args, |c| c.clear_sel())
        }),
    )?;
    registry.register(
        Tool::new(
            "redfish_firmware_inventory",
            "Installed firmware components and versions.",
            host_only(),
        ),
        bind(&fleet, |fleet, args| async move {
            on_host!(fleet, args, |c| c.firmware_inventory())
        }),
    )?;
    registry.register(
        Tool::new("redfish_manager_info", "iDRAC model, firmware and clock.", host_only()),
        bind(&fleet, |fleet, args| async move {
            on_host!(fleet, args, |c| c.manager_info())
        }),
    )?;
    Ok(())
}
