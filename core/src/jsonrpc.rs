//! MCP (Model Context Protocol) JSON-RPC 2.0 message handling.
//!
//! Transport-free: the stdio loop feeds it lines, the HTTP front-end feeds it
//! request bodies. Both get identical answers.
//!
//! | Method       | Description                      |
//! |--------------|----------------------------------|
//! | `initialize` | Handshake, returns capabilities  |
//! | `tools/list` | List available tool definitions  |
//! | `tools/call` | Execute a tool and return result |
//! | `ping`       | Liveness check                   |
//!
//! Notifications (messages without an `id`) never get a response.

use serde_json::{json, Value};

use crate::registry::Dispatcher;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

/// Name and version reported in the `initialize` handshake.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Handle one raw line. `None` means nothing should be written back.
pub async fn handle_line(dispatcher: &Dispatcher, info: &ServerInfo, line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(request) => handle_message(dispatcher, info, request).await,
        Err(e) => Some(error_response(
            Value::Null,
            PARSE_ERROR,
            format!("Parse error: {e}"),
        )),
    }
}

/// Handle one decoded JSON-RPC message.
pub async fn handle_message(
    dispatcher: &Dispatcher,
    info: &ServerInfo,
    request: Value,
) -> Option<Value> {
    let Some(obj) = request.as_object() else {
        return Some(error_response(
            Value::Null,
            INVALID_REQUEST,
            "Invalid Request: expected a JSON object",
        ));
    };
    let method = obj.get("method").and_then(Value::as_str).unwrap_or("");

    // Notifications (no id) are never answered
    let Some(id) = obj.get("id").cloned() else {
        match method {
            "notifications/initialized" | "notifications/cancelled" => {}
            other => tracing::debug!(method = other, "ignoring notification"),
        }
        return None;
    };

    let response = match method {
        "initialize" => result_response(id, initialize_result(info)),
        "ping" => result_response(id, json!({})),
        "tools/list" => result_response(id, json!({ "tools": dispatcher.list_tools() })),
        "tools/call" => {
            let params = obj.get("params").cloned().unwrap_or_else(|| json!({}));
            match params.get("name").and_then(Value::as_str) {
                Some(name) if !name.is_empty() => {
                    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                    let envelope = dispatcher.call(name, arguments).await;
                    result_response(id, envelope.to_value())
                }
                _ => error_response(id, INVALID_PARAMS, "Invalid params: missing tool name"),
            }
        }
        "" => error_response(id, INVALID_REQUEST, "Invalid Request: missing method"),
        other => error_response(id, METHOD_NOT_FOUND, format!("Method not found: {other}")),
    };
    Some(response)
}

fn initialize_result(info: &ServerInfo) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": { "listChanged": false }
        },
        "serverInfo": {
            "name": info.name,
            "version": info.version
        }
    })
}

fn result_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// A JSON-RPC error object for `id`.
pub fn error_response(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() }
    })
}
