//! HTTP route handlers.
//!
//! All handlers except [`health`] require authentication via the
//! [`crate::auth::require_api_key`] middleware.

pub mod health;
pub mod mcp;
pub mod tools;
