//! Vendor method sets and their tool catalogs.
//!
//! Each submodule holds one thin client (one async method per REST endpoint,
//! each returning `{status, data, message}`) and a `register` function that
//! adds its tools to a [`ToolRegistry`](crate::registry::ToolRegistry).
//!
//! | Module       | Product                | Auth                        | Hosts |
//! |--------------|------------------------|-----------------------------|-------|
//! | [`redfish`]  | Dell iDRAC (Redfish)   | Basic                       | fleet |
//! | [`pfsense`]  | pfSense REST API v2    | `X-API-Key` or JWT          | one   |
//! | [`proxmox`]  | Proxmox VE API2        | `PVEAPIToken`               | one   |
//! | [`truenas`]  | TrueNAS API v2.0       | Bearer key or Basic         | one   |
//! | [`warewulf`] | Warewulf `warewulfd`   | Basic                       | fleet |

/// Resolve the fleet client named by the `host` argument (default host when
/// absent) and await `$body` with it bound to `$client`.
macro_rules! on_host {
    ($fleet:expr, $args:expr, |$client:ident| $body:expr) => {{
        let $client = $fleet
            .resolve($crate::args::optional_str(&$args, "host"))
            .await?;
        $body.await
    }};
}

pub mod pfsense;
pub mod proxmox;
pub mod redfish;
pub mod truenas;
pub mod warewulf;

use serde_json::{json, Value};

use crate::config::Config;
use crate::error::Result;
use crate::resilience::{BreakerConfig, ResilientTransport, RetryPolicy};
use crate::transport::{Auth, Endpoint, Transport, TransportOptions};

/// Transport tunables applied to every vendor client.
#[derive(Debug, Clone, Default)]
pub struct ClientSettings {
    pub options: TransportOptions,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
}

impl ClientSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            options: config.http.transport_options(),
            retry: config.resilience.retry_policy(),
            breaker: config.resilience.breaker_config(),
        }
    }

    /// Build a retrying, circuit-broken transport for one endpoint.
    pub fn connect(&self, endpoint: &Endpoint, auth: Auth) -> Result<ResilientTransport> {
        let transport = Transport::new(endpoint, auth, &self.options)?;
        Ok(ResilientTransport::new(
            transport,
            self.retry.clone(),
            self.breaker.clone(),
        ))
    }
}

/// The `{status, data, message}` shape every vendor method returns.
pub fn success(data: Value, message: impl Into<String>) -> Value {
    json!({
        "status": "success",
        "data": data,
        "message": message.into(),
    })
}

/// Unwrap the `{"data": ...}` envelope some vendors put around results.
pub fn unwrap_data(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Number of items in a JSON array result, 0 for anything else.
pub fn count(value: &Value) -> usize {
    value.as_array().map_or(0, Vec::len)
}

/// Schema property selecting a host in fleet vendors.
pub fn host_property() -> Value {
    json!({
        "type": "string",
        "description": "Host name from the credential vault. Omit to use the default host."
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwrap_data_envelope() {
        assert_eq!(unwrap_data(json!({ "data": [1, 2] })), json!([1, 2]));
        assert_eq!(unwrap_data(json!({ "version": "8.2" })), json!({ "version": "8.2" }));
        assert_eq!(unwrap_data(json!([1])), json!([1]));
    }

    #[test]
    fn success_shape() {
        let v = success(json!({ "a": 1 }), "done");
        assert_eq!(v["status"], "success");
        assert_eq!(v["data"]["a"], 1);
        assert_eq!(v["message"], "done");
    }
}
