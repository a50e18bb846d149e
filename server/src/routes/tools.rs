//! REST access to the tool catalog.
//!
//! - `GET /api/tools`: tool definitions in MCP form
//! - `POST /api/tools/call`: invoke one tool
//!
//! A failed tool call is still `200 OK`: the failure is reported inside the
//! envelope (`isError: true`), exactly as over MCP.

use axum::{extract::State, Json};
use infra_mcp_core::ToolCallEnvelope;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::AppState;

/// Request body for `POST /api/tools/call`.
#[derive(Deserialize)]
pub struct CallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

pub async fn list(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "tools": state.dispatcher.list_tools() }))
}

pub async fn call(
    State(state): State<AppState>,
    Json(request): Json<CallRequest>,
) -> Json<ToolCallEnvelope> {
    Json(state.dispatcher.call(&request.name, request.arguments).await)
}
