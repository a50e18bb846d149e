//! Pre-shared API key authentication.
//!
//! Everything except `/api/health` requires an `Authorization: Bearer <key>`
//! header matching `[server].api_key` (or `INFRA_MCP_API_KEY`).

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use infra_mcp_core::Secret;
use serde_json::json;

/// Axum middleware that rejects requests without a valid `Authorization: Bearer`
/// header. The expected key is injected via the [`ApiKey`] extension.
///
/// # Error responses
///
/// - `401 Unauthorized`: header missing or malformed
/// - `403 Forbidden`: key present but invalid
/// - `500 Internal Server Error`: [`ApiKey`] extension not found (misconfiguration)
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(ApiKey(expected)) = request.extensions().get::<ApiKey>().cloned() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Server configuration error"})),
        )
            .into_response();
    };

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(provided) = provided else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header"})),
        )
            .into_response();
    };

    if !constant_time_eq(expected.expose().as_bytes(), provided.as_bytes()) {
        tracing::warn!(path = %request.uri().path(), "rejected request with invalid API key");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid API key"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Constant-time byte comparison.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so response time does not reveal the key length either.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Extension carrying the expected API key, injected as a router layer so
/// [`require_api_key`] needs no access to `AppState`.
#[derive(Clone)]
pub struct ApiKey(pub Secret);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_only_identical_keys() {
        assert!(constant_time_eq(b"s3cret-key", b"s3cret-key"));
        assert!(!constant_time_eq(b"s3cret-key", b"s3cret-kez"));
        assert!(!constant_time_eq(b"s3cret-key", b"s3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3cret-key"));
        assert!(!constant_time_eq(b"key", b""));
    }
}
