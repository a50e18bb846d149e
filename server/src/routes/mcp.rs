//! `POST /mcp`: one JSON-RPC message per request body.
//!
//! Answers the same way the stdio server does. Notifications get
//! `202 Accepted` with an empty body.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use infra_mcp_core::jsonrpc;
use serde_json::Value;

use crate::AppState;

pub async fn rpc(State(state): State<AppState>, body: String) -> Response {
    if body.trim().is_empty() {
        let error = jsonrpc::error_response(Value::Null, jsonrpc::PARSE_ERROR, "Parse error: empty body");
        return (StatusCode::BAD_REQUEST, Json(error)).into_response();
    }
    match jsonrpc::handle_line(&state.dispatcher, &state.info, &body).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}
