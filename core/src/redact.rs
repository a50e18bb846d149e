//! Scrubbing of secrets from values that end up in logs.

use serde_json::{Map, Value};

const REDACTED: &str = "[REDACTED]";

/// Key fragments that mark a value as sensitive (matched case-insensitively).
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "key",
    "credential",
    "authorization",
];

/// Whether a JSON object key names a secret.
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| lower.contains(s))
}

/// Deep copy of `value` with every sensitive field replaced by `[REDACTED]`.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let scrubbed: Map<String, Value> = map
                .iter()
                .map(|(k, v)| {
                    let v = if is_sensitive_key(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(v)
                    };
                    (k.clone(), v)
                })
                .collect();
            Value::Object(scrubbed)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Truncate `text` to at most `max` bytes on a char boundary, marking the cut.
pub fn summarize(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

/// Redacted, truncated one-line rendering of tool arguments for log records.
pub fn argument_summary(args: &Value, max: usize) -> String {
    summarize(&redact(args).to_string(), max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_nested_secrets() {
        let args = json!({
            "username": "root",
            "password": "s3cr3t",
            "auth": { "api_key": "abc", "Token": "xyz" },
            "hosts": [{ "name": "bmc1", "client_secret": "q" }]
        });
        let out = redact(&args);
        assert_eq!(out["username"], "root");
        assert_eq!(out["password"], REDACTED);
        assert_eq!(out["auth"]["api_key"], REDACTED);
        assert_eq!(out["auth"]["Token"], REDACTED);
        assert_eq!(out["hosts"][0]["name"], "bmc1");
        assert_eq!(out["hosts"][0]["client_secret"], REDACTED);
        assert!(!out.to_string().contains("s3cr3t"));
    }

    #[test]
    fn summarize_respects_char_boundaries() {
        assert_eq!(summarize("short", 10), "short");
        assert_eq!(summarize("abcdef", 3), "abc…");
        // 'é' is two bytes; cutting at 2 must back off to 1
        assert_eq!(summarize("aé", 2), "a…");
    }

    #[test]
    fn argument_summary_never_contains_password() {
        let args = json!({ "username": "a", "password": "s3cr3t" });
        let summary = argument_summary(&args, 256);
        assert!(!summary.contains("s3cr3t"));
        assert!(summary.contains("\"username\":\"a\""));
    }
}
