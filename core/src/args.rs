//! Typed extraction of tool arguments.
//!
//! The dispatcher already validates arguments against each tool's schema, so
//! these helpers mostly narrow `serde_json::Value` into Rust types. They still
//! raise [`Error::Validation`] rather than panicking if a handler is invoked
//! directly with bad input.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

pub fn required_str<'a>(args: &'a Value, name: &str) -> Result<&'a str> {
    match args.get(name).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(Error::validation(format!(
            "missing required parameter: {name}"
        ))),
    }
}

pub fn optional_str<'a>(args: &'a Value, name: &str) -> Option<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

pub fn required_u64(args: &Value, name: &str) -> Result<u64> {
    args.get(name)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::validation(format!("missing required parameter: {name} (integer)")))
}

pub fn optional_u64(args: &Value, name: &str) -> Option<u64> {
    args.get(name).and_then(Value::as_u64)
}

pub fn optional_bool(args: &Value, name: &str) -> Option<bool> {
    args.get(name).and_then(Value::as_bool)
}

/// Required string restricted to a fixed set of values.
pub fn required_enum<'a>(args: &'a Value, name: &str, allowed: &[&str]) -> Result<&'a str> {
    let value = required_str(args, name)?;
    if allowed.contains(&value) {
        Ok(value)
    } else {
        Err(Error::validation(format!(
            "invalid value for {name}: '{value}' (expected one of: {})",
            allowed.join(", ")
        )))
    }
}

/// Required JSON object, passed through to the vendor as-is.
pub fn required_object<'a>(args: &'a Value, name: &str) -> Result<&'a Value> {
    match args.get(name) {
        Some(v @ Value::Object(_)) => Ok(v),
        _ => Err(Error::validation(format!(
            "missing required parameter: {name} (object)"
        ))),
    }
}

/// Deserialize the whole argument object into a typed struct.
pub fn parse<T: DeserializeOwned>(args: &Value) -> Result<T> {
    serde_json::from_value(args.clone())
        .map_err(|e| Error::validation(format!("invalid arguments: {e}")))
}
