//! pfSense firewall via the pfSense-pkg-RESTAPI v2 package.
//!
//! Authenticates with an `X-API-Key` header, or with a JWT obtained from
//! `/api/v2/auth/jwt` when username and password are configured. Every v2
//! response wraps its payload in `{"code", "status", "message", "data"}`;
//! methods return only `data`.

use std::sync::Arc;

use serde_json::{json, Value};

use super::{count, success, unwrap_data, ClientSettings};
use crate::args;
use crate::config::Credentials;
use crate::error::Result;
use crate::registry::{bind, object_schema, Tool, ToolRegistry};
use crate::resilience::ResilientTransport;
use crate::transport::{Auth, Endpoint, JwtLogin, Request};

const API: &str = "/api/v2";

pub const SERVICE_ACTIONS: &[&str] = &["start", "restart", "stop"];

pub struct PfsenseClient {
    http: ResilientTransport,
}

impl PfsenseClient {
    pub fn new(http: ResilientTransport) -> Self {
        Self { http }
    }

    pub fn connect(
        endpoint: &Endpoint,
        credentials: &Credentials,
        settings: &ClientSettings,
    ) -> Result<Self> {
        let auth = match credentials {
            Credentials::ApiKey(key) => Auth::Header {
                name: "X-API-Key".into(),
                value: key.expose().to_string(),
            },
            Credentials::UserPassword { username, password } => Auth::Jwt(JwtLogin {
                login_path: format!("{API}/auth/jwt"),
                username: username.clone(),
                password: password.expose().to_string(),
                token_pointer: "/data/token".into(),
            }),
        };
        Ok(Self::new(settings.connect(endpoint, auth)?))
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let body = self.http.send(Request::get(format!("{API}{path}"))).await?;
        Ok(unwrap_data(body))
    }

    pub async fn system_status(&self) -> Result<Value> {
        let data = self.get("/status/system").await?;
        Ok(success(data, "System status retrieved"))
    }

    pub async fn version(&self) -> Result<Value> {
        let data = self.get("/system/version").await?;
        let message = format!(
            "pfSense {}",
            data["version"].as_str().unwrap_or("version unknown")
        );
        Ok(success(data, message))
    }

    pub async fn interfaces(&self) -> Result<Value> {
        let data = self.get("/status/interfaces").await?;
        let message = format!("{} interfaces", count(&data));
        Ok(success(data, message))
    }

    pub async fn firewall_rules(&self, interface: Option<&str>) -> Result<Value> {
        let mut request = Request::get(format!("{API}/firewall/rules"));
        if let Some(iface) = interface {
            request = request.query("interface", iface);
        }
        let data = unwrap_data(self.http.send(request).await?);
        let message = format!("{} firewall rules", count(&data));
        Ok(success(data, message))
    }

    /// Create a rule. `rule` is passed through unchanged; pfSense validates it.
    pub async fn create_firewall_rule(&self, rule: &Value) -> Result<Value> {
        let body = self
            .http
            .send(Request::post(format!("{API}/firewall/rule")).json(rule.clone()))
            .await?;
        Ok(success(
            unwrap_data(body),
            "Firewall rule created; apply changes to activate it",
        ))
    }

    pub async fn delete_firewall_rule(&self, id: u64) -> Result<Value> {
        let body = self
            .http
            .send(Request::delete(format!("{API}/firewall/rule")).query("id", id.to_string()))
            .await?;
        Ok(success(
            unwrap_data(body),
            format!("Firewall rule {id} deleted; apply changes to activate"),
        ))
    }

    pub async fn apply(&self) -> Result<Value> {
        let body = self
            .http
            .send(Request::post(format!("{API}/firewall/apply")))
            .await?;
        Ok(success(unwrap_data(body), "Pending firewall changes applied"))
    }

    pub async fn aliases(&self) -> Result<Value> {
        let data = self.get("/firewall/aliases").await?;
        let message = format!("{} aliases", count(&data));
        Ok(success(data, message))
    }

    pub async fn dhcp_leases(&self) -> Result<Value> {
        let data = self.get("/status/dhcp_server/leases").await?;
        let message = format!("{} DHCP leases", count(&data));
        Ok(success(data, message))
    }

    pub async fn services(&self) -> Result<Value> {
        let data = self.get("/status/services").await?;
        let message = format!("{} services", count(&data));
        Ok(success(data, message))
    }

    pub async fn service_action(&self, service: &str, action: &str) -> Result<Value> {
        let body = self
            .http
            .send(
                Request::post(format!("{API}/status/service"))
                    .json(json!({ "name": service, "action": action })),
            )
            .await?;
        Ok(success(
            unwrap_data(body),
            format!("Service {service}: {action} requested"),
        ))
    }

    pub async fn arp_table(&self) -> Result<Value> {
        let data = self.get("/diagnostics/arp_table").await?;
        let message = format!("{} ARP entries", count(&data));
        Ok(success(data, message))
    }
}

fn no_args() -> Value {
    object_schema(json!({}), &[])
}

pub fn register(registry: &mut ToolRegistry, client: Arc<PfsenseClient>) -> Result<()> {
    registry.register(
        Tool::new(
            "pfsense_system_status",
            "CPU, memory, disk usage, uptime and temperature of the firewall.",
            no_args(),
        ),
        bind(&client, |c, _| async move { c.system_status().await }),
    )?;
    registry.register(
        Tool::new("pfsense_version", "Installed pfSense version.", no_args()),
        bind(&client, |c, _| async move { c.version().await }),
    )?;
    registry.register(
        Tool::new(
            "pfsense_interfaces",
            "Interface status, addresses and traffic counters.",
            no_args(),
        ),
        bind(&client, |c, _| async move { c.interfaces().await }),
    )?;
    registry.register(
        Tool::new(
            "pfsense_firewall_rules",
            "List firewall rules, optionally for one interface.",
            object_schema(
                json!({ "interface": { "type": "string", "description": "Interface name, e.g. wan or lan" } }),
                &[],
            ),
        ),
        bind(&client, |c, args| async move {
            c.firewall_rules(args::optional_str(&args, "interface")).await
        }),
    )?;
    registry.register(
        Tool::new(
            "pfsense_create_firewall_rule",
            "Create a firewall rule. Changes take effect after pfsense_apply.",
            object_schema(
                json!({
                    "rule": {
                        "type": "object",
                        "description": "Rule fields as accepted by POST /api/v2/firewall/rule (type, interface, ipprotocol, protocol, source, destination, descr, ...)",
                        "required": ["type", "interface"]
                    }
                }),
                &["rule"],
            ),
        ),
        bind(&client, |c, args| async move {
            let rule = args::required_object(&args, "rule")?;
            c.create_firewall_rule(rule).await
        }),
    )?;
    registry.register(
        Tool::new(
            "pfsense_delete_firewall_rule",
            "Delete a firewall rule by ID. Changes take effect after pfsense_apply.",
            object_schema(
                json!({ "id": { "type": "integer", "minimum": 0 } }),
                &["id"],
            ),
        )
        .destructive(),
        bind(&client, |c, args| async move {
            let id = args::required_u64(&args, "id")?;
            c.delete_firewall_rule(id).await
        }),
    )?;
    registry.register(
        Tool::new(
            "pfsense_apply",
            "Apply pending firewall configuration changes to the live ruleset.",
            no_args(),
        )
        .destructive(),
        bind(&client, |c, _| async move { c.apply().await }),
    )?;
    registry.register(
        Tool::new("pfsense_aliases", "List firewall aliases.", no_args()),
        bind(&client, |c, _| async move { c.aliases().await }),
    )?;
    registry.register(
        Tool::new("pfsense_dhcp_leases", "Current DHCP leases.", no_args()),
        bind(&client, |c, _| async move { c.dhcp_leases().await }),
    )?;
    registry.register(
        Tool::new(
            "pfsense_services",
            "Services and whether they are running.",
            no_args(),
        ),
        bind(&client, |c, _| async move { c.services().await }),
    )?;
    registry.register(
        Tool::new(
            "pfsense_service_action",
            "Start, restart or stop a service. Stopping may interrupt traffic.",
            object_schema(
                json!({
                    "service": { "type": "string", "description": "Service name, e.g. unbound or dhcpd" },
                    "action": { "type": "string", "enum": SERVICE_ACTIONS }
                }),
                &["service", "action"],
            ),
        )
        .destructive(),
        bind(&client, |c, args| async move {
            let service = args::required_str(&args, "service")?;
            let action = args::required_enum(&args, "action", SERVICE_ACTIONS)?;
            c.service_action(service, action).await
        }),
    )?;
    registry.register(
        Tool::new("pfsense_arp_table", "ARP table entries.", no_args()),
        bind(&client, |c, _| async move { c.arp_table().await }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Dispatcher;
    use crate::vault::Secret;
    use crate::vendors::testing::{endpoint, fast_settings};
    use httpmock::prelude::*;

    fn client(server: &MockServer, credentials: Credentials) -> Arc<PfsenseClient> {
        Arc::new(PfsenseClient::connect(&endpoint(server), &credentials, &fast_settings()).unwrap())
    }

    fn api_key() -> Credentials {
        Credentials::ApiKey(Secret::new("pf-key"))
    }

    #[tokio::test]
    async fn api_key_header_and_data_unwrapping() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/v2/system/version")
                    .header("x-api-key", "pf-key");
                then.status(200).json_body(json!({
                    "code": 200,
                    "status": "ok",
                    "message": "",
                    "data": { "version": "2.7.2-RELEASE" }
                }));
            })
            .await;

        let out = client(&server, api_key()).version().await.unwrap();
        assert_eq!(out["data"]["version"], "2.7.2-RELEASE");
        assert_eq!(out["message"], "pfSense 2.7.2-RELEASE");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn jwt_credentials_log_in_first() {
        let server = MockServer::start_async().await;
        let login = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v2/auth/jwt");
                then.status(200).json_body(json!({ "data": { "token": "jwt-1" } }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/v2/status/services")
                    .header("authorization", "Bearer jwt-1");
                then.status(200)
                    .json_body(json!({ "data": [{ "name": "unbound", "status": true }] }));
            })
            .await;

        let c = client(
            &server,
            Credentials::UserPassword {
                username: "admin".into(),
                password: Secret::new("pfsense"),
            },
        );
        let out = c.services().await.unwrap();
        assert_eq!(out["message"], "1 services");
        login.assert_async().await;
    }

    #[tokio::test]
    async fn delete_rule_requires_confirm_and_sends_id() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(DELETE)
                    .path("/api/v2/firewall/rule")
                    .query_param("id", "4");
                then.status(200).json_body(json!({ "data": { "id": 4 } }));
            })
            .await;
        let mut registry = ToolRegistry::new();
        register(&mut registry, client(&server, api_key())).unwrap();
        let d = Dispatcher::new(registry);

        assert!(d.call("pfsense_delete_firewall_rule", json!({ "id": 4 })).await.is_error);
        mock.assert_hits_async(0).await;

        let env = d
            .call("pfsense_delete_firewall_rule", json!({ "id": 4, "confirm": true }))
            .await;
        assert!(!env.is_error, "{}", env.text());
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn apply_requires_confirm() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v2/firewall/apply");
                then.status(200).json_body(json!({ "data": { "applied": true } }));
            })
            .await;
        let mut registry = ToolRegistry::new();
        register(&mut registry, client(&server, api_key())).unwrap();
        let d = Dispatcher::new(registry);

        let refused = d.call("pfsense_apply", json!({})).await;
        assert!(refused.is_error);
        mock.assert_hits_async(0).await;

        let env = d.call("pfsense_apply", json!({ "confirm": true })).await;
        assert!(!env.is_error, "{}", env.text());
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn vendor_validation_errors_reach_the_caller() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v2/firewall/rule");
                then.status(400).json_body(json!({
                    "code": 400,
                    "status": "bad request",
                    "message": "Field `interface` must be one of [wan, lan]"
                }));
            })
            .await;
        let mut registry = ToolRegistry::new();
        register(&mut registry, client(&server, api_key())).unwrap();
        let d = Dispatcher::new(registry);

        let env = d
            .call(
                "pfsense_create_firewall_rule",
                json!({ "rule": { "type": "pass", "interface": "dmz" } }),
            )
            .await;
        assert!(env.is_error);
        assert!(env.text().contains("must be one of"), "{}", env.text());
    }

    #[test]
    fn catalog_marks_destructive_tools() {
        let server = MockServer::start();
        let mut registry = ToolRegistry::new();
        register(&mut registry, client(&server, api_key())).unwrap();
        let destructive: Vec<&str> = registry
            .list_tools()
            .into_iter()
            .filter(|t| t.destructive)
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(
            destructive,
            [
                "pfsense_delete_firewall_rule",
                "pfsense_apply",
                "pfsense_service_action"
            ]
        );
    }
}
