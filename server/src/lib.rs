#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

//! infra-mcp-server library: the router and its pieces, so the binary and
//! tests build exactly the same app.

pub mod auth;
pub mod routes;
pub mod state;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use infra_mcp_core::Secret;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

pub use auth::ApiKey;
pub use state::AppState;

/// Build the full router: public health check, key-protected tool routes,
/// at most `max_concurrent` requests in flight.
pub fn router(state: AppState, api_key: Secret, max_concurrent: usize) -> Router {
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/tools", get(routes::tools::list))
        .route("/api/tools/call", post(routes::tools::call))
        .route("/mcp", post(routes::mcp::rpc))
        .layer(middleware::from_fn(auth::require_api_key));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(ApiKey(api_key)))
        .layer(GlobalConcurrencyLimitLayer::new(max_concurrent.max(1)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
