//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health`: liveness check.
///
/// Reports uptime, version, vendor and catalog size. Does not contact the
/// vendor, so a down BMC or NAS never fails the check.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "vendor": state.vendor.as_str(),
        "tools": state.dispatcher.registry().len(),
    }))
}
