//! Tool catalog and call dispatch.
//!
//! Every vendor registers its tools into a [`ToolRegistry`] once at startup;
//! the [`Dispatcher`] then routes `{name, arguments}` calls to the matching
//! handler and turns every outcome, including handler panics, into a
//! [`ToolCallEnvelope`]. Nothing escapes [`Dispatcher::call`] as an error.
//!
//! Before a handler runs the dispatcher:
//!
//! 1. validates the arguments against the tool's JSON Schema,
//! 2. for destructive tools, requires `"confirm": true`,
//! 3. replays the stored result when a destructive call repeats an
//!    `idempotency_key` seen in the last ten minutes.
//!
//! Handler errors are logged with a correlation id and redacted arguments;
//! the caller only sees [`Error::public_message`].

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use crate::error::{Error, ErrorKind, Result};
use crate::redact;

/// How long a destructive call's result is replayed for a repeated key.
pub const IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(600);

/// Longest argument summary written to a log record.
const LOG_ARGS_MAX: usize = 512;

pub const CONFIRM_ARG: &str = "confirm";
pub const IDEMPOTENCY_ARG: &str = "idempotency_key";

pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Wrap an async function as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

/// Wrap an async function that needs shared state (usually a vendor client).
pub fn bind<S, F, Fut>(state: &Arc<S>, f: F) -> Handler
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    let state = Arc::clone(state);
    Arc::new(move |args| f(Arc::clone(&state), args).boxed())
}

/// `{"type":"object", ...}` schema with no extra properties allowed.
pub fn object_schema(properties: Value, required: &[&str]) -> Value {
    let mut schema = json!({
        "type": "object",
        "properties": properties,
        "additionalProperties": false
    });
    if !required.is_empty() {
        schema["required"] = json!(required);
    }
    schema
}

/// A named, schema-described operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub destructive: bool,
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            destructive: false,
        }
    }

    /// Mark the tool as changing or destroying state.
    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }

    /// MCP `tools/list` entry.
    pub fn definition(&self) -> Value {
        let mut def = json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        });
        if self.destructive {
            def["annotations"] = json!({ "destructiveHint": true });
        }
        def
    }
}

/// One content block of a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text { text: String },
}

/// Result of a tool call, ready to be placed in a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallEnvelope {
    pub content: Vec<Content>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl ToolCallEnvelope {
    pub fn success(value: &Value) -> Self {
        let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        Self {
            content: vec![Content::Text { text }],
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![Content::Text {
                text: message.into(),
            }],
            is_error: true,
        }
    }

    /// Text of the first content block.
    pub fn text(&self) -> &str {
        match self.content.first() {
            Some(Content::Text { text }) => text,
            None => "",
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "content": self.content,
            "isError": self.is_error,
        })
    }
}

struct Entry {
    tool: Tool,
    validator: Validator,
    handler: Handler,
}

/// Ordered, name-unique tool catalog.
#[derive(Default)]
pub struct ToolRegistry {
    entries: IndexMap<String, Entry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. Duplicate names and schemas that do not compile are
    /// configuration errors.
    pub fn register(&mut self, mut tool: Tool, handler: Handler) -> Result<()> {
        if tool.name.trim().is_empty() {
            return Err(Error::configuration("tool name must not be empty"));
        }
        if self.entries.contains_key(&tool.name) {
            return Err(Error::configuration(format!(
                "duplicate tool name: {}",
                tool.name
            )));
        }
        if tool.input_schema.get("type").and_then(Value::as_str) != Some("object") {
            return Err(Error::configuration(format!(
                "input schema for tool '{}' must be an object schema",
                tool.name
            )));
        }
        if tool.destructive {
            add_destructive_properties(&mut tool.input_schema);
        }

        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&tool.input_schema)
            .map_err(|e| {
                Error::configuration(format!("invalid input schema for tool '{}': {e}", tool.name))
            })?;

        self.entries.insert(
            tool.name.clone(),
            Entry {
                tool,
                validator,
                handler,
            },
        );
        Ok(())
    }

    /// Tools in registration order.
    pub fn list_tools(&self) -> Vec<&Tool> {
        self.entries.values().map(|e| &e.tool).collect()
    }

    /// MCP definitions for every tool, in registration order.
    pub fn definitions(&self) -> Vec<Value> {
        self.entries.values().map(|e| e.tool.definition()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.entries.get(name).map(|e| &e.tool)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn add_destructive_properties(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };
    let properties = obj
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(properties) = properties.as_object_mut() {
        properties.insert(
            CONFIRM_ARG.to_string(),
            json!({
                "type": "boolean",
                "description": "Must be true. This operation changes or destroys state."
            }),
        );
        properties.insert(
            IDEMPOTENCY_ARG.to_string(),
            json!({
                "type": "string",
                "minLength": 1,
                "maxLength": 128,
                "description": "Optional. Repeating a key within 10 minutes returns the first result instead of acting again."
            }),
        );
    }
    let required = obj
        .entry("required")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Some(required) = required.as_array_mut() {
        if !required.iter().any(|r| r == CONFIRM_ARG) {
            required.push(Value::String(CONFIRM_ARG.to_string()));
        }
    }
}

enum Replay {
    InFlight,
    Done {
        at: Instant,
        envelope: ToolCallEnvelope,
    },
}

/// Routes tool calls to handlers. Holds no per-call state besides the
/// idempotency table.
pub struct Dispatcher {
    registry: ToolRegistry,
    replays: Mutex<HashMap<(String, String), Replay>>,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            replays: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn list_tools(&self) -> Vec<Value> {
        self.registry.definitions()
    }

    /// Invoke a tool. Always returns an envelope.
    pub async fn call(&self, name: &str, arguments: Value) -> ToolCallEnvelope {
        let Some(entry) = self.registry.entries.get(name) else {
            tracing::debug!(tool = name, "unknown tool");
            return ToolCallEnvelope::error(format!("Unknown tool: {name}"));
        };

        let mut args = match arguments {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            _ => return ToolCallEnvelope::error("Error: invalid arguments: expected a JSON object"),
        };

        let args_value = Value::Object(args.clone());
        let problems: Vec<String> = entry
            .validator
            .iter_errors(&args_value)
            .map(|e| e.to_string())
            .collect();
        if !problems.is_empty() {
            tracing::debug!(tool = name, problems = problems.len(), "arguments rejected by schema");
            return ToolCallEnvelope::error(format!(
                "Error: invalid arguments: {}",
                problems.join("; ")
            ));
        }

        let mut replay_claim = None;
        if entry.tool.destructive {
            let confirmed = args.remove(CONFIRM_ARG).and_then(|v| v.as_bool()) == Some(true);
            let key = args
                .remove(IDEMPOTENCY_ARG)
                .and_then(|v| v.as_str().map(str::to_string));
            if !confirmed {
                return ToolCallEnvelope::error(format!(
                    "Error: {name} is a destructive operation; repeat the call with \"confirm\": true to proceed"
                ));
            }
            if let Some(key) = key {
                match self.begin_idempotent((name.to_string(), key)) {
                    Ok(claim) => replay_claim = Some(claim),
                    Err(previous) => return previous,
                }
            }
        }

        let envelope = self.invoke(entry, Value::Object(args)).await;

        if let Some(claim) = replay_claim {
            claim.finish(&envelope);
        }
        envelope
    }

    async fn invoke(&self, entry: &Entry, args: Value) -> ToolCallEnvelope {
        let name = entry.tool.name.as_str();
        let handler = Arc::clone(&entry.handler);
        let summary = redact::argument_summary(&args, LOG_ARGS_MAX);
        let started = Instant::now();

        let outcome = AssertUnwindSafe(async move { handler(args).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                Err(Error::internal(format!("handler panicked: {detail}")))
            });

        match outcome {
            Ok(value) => {
                tracing::debug!(
                    tool = name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tool call succeeded"
                );
                ToolCallEnvelope::success(&value)
            }
            Err(err) => {
                let correlation_id = uuid::Uuid::new_v4().to_string();
                let kind = err.kind();
                match kind {
                    ErrorKind::Validation | ErrorKind::NotFound => tracing::info!(
                        tool = name,
                        kind = %kind,
                        correlation_id = %correlation_id,
                        args = %summary,
                        error = %err,
                        "tool call rejected"
                    ),
                    _ => tracing::error!(
                        tool = name,
                        kind = %kind,
                        correlation_id = %correlation_id,
                        args = %summary,
                        error = %err,
                        "tool call failed"
                    ),
                }
                ToolCallEnvelope::error(format!("Error: {}", err.public_message(&correlation_id)))
            }
        }
    }

    fn replays(&self) -> MutexGuard<'_, HashMap<(String, String), Replay>> {
        self.replays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim an idempotency slot, or return what to answer instead.
    fn begin_idempotent(
        &self,
        slot: (String, String),
    ) -> std::result::Result<ReplayClaim<'_>, ToolCallEnvelope> {
        let mut replays = self.replays();
        replays.retain(|_, r| match r {
            Replay::Done { at, .. } => at.elapsed() < IDEMPOTENCY_WINDOW,
            Replay::InFlight => true,
        });
        match replays.get(&slot) {
            Some(Replay::Done { envelope, .. }) => {
                tracing::info!(tool = %slot.0, "replaying result for repeated idempotency key");
                Err(envelope.clone())
            }
            Some(Replay::InFlight) => Err(ToolCallEnvelope::error(
                "Error: a call with this idempotency key is already in progress",
            )),
            None => {
                replays.insert(slot.clone(), Replay::InFlight);
                Ok(ReplayClaim {
                    dispatcher: self,
                    slot: Some(slot),
                })
            }
        }
    }
}

/// An in-flight idempotency slot. Dropping it without [`finish`](Self::finish)
/// (the call was cancelled) frees the key again.
struct ReplayClaim<'a> {
    dispatcher: &'a Dispatcher,
    slot: Option<(String, String)>,
}

impl ReplayClaim<'_> {
    /// Only successful results are replayed; a failed call may be retried
    /// with the same key.
    fn finish(mut self, envelope: &ToolCallEnvelope) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let mut replays = self.dispatcher.replays();
        if envelope.is_error {
            replays.remove(&slot);
        } else {
            replays.insert(
                slot,
                Replay::Done {
                    at: Instant::now(),
                    envelope: envelope.clone(),
                },
            );
        }
    }
}

impl Drop for ReplayClaim<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            tracing::debug!(tool = %slot.0, "call cancelled, releasing idempotency key");
            self.dispatcher.replays().remove(&slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn empty_schema() -> Value {
        object_schema(json!({}), &[])
    }

    fn node_schema() -> Value {
        object_schema(json!({ "node_id": { "type": "string" } }), &["node_id"])
    }

    fn echo() -> Handler {
        handler(|args| async move { Ok(json!({ "status": "success", "data": args })) })
    }

    fn counting(calls: &Arc<AtomicU32>) -> Handler {
        bind(calls, |calls, _args| async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({ "call": n }))
        })
    }

    #[test]
    fn listing_preserves_registration_order_and_schema() {
        let mut reg = ToolRegistry::new();
        reg.register(Tool::new("svc_get_status", "Status", empty_schema()), echo())
            .unwrap();
        reg.register(Tool::new("svc_set_power", "Power", node_schema()), echo())
            .unwrap();

        let tools = reg.list_tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "svc_get_status");
        assert_eq!(tools[1].name, "svc_set_power");
        assert_eq!(tools[1].input_schema, node_schema());

        let defs = reg.definitions();
        assert_eq!(defs[1]["inputSchema"]["required"], json!(["node_id"]));
        assert!(defs[0].get("annotations").is_none());
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut reg = ToolRegistry::new();
        reg.register(Tool::new("a", "first", empty_schema()), echo())
            .unwrap();
        let err = reg
            .register(Tool::new("a", "second", empty_schema()), echo())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(reg.get("a").unwrap().description, "first");
    }

    #[test]
    fn invalid_schemas_rejected() {
        let mut reg = ToolRegistry::new();
        let err = reg
            .register(Tool::new("a", "", json!({ "type": "string" })), echo())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        let err = reg
            .register(
                Tool::new("b", "", json!({ "type": "object", "minProperties": "many" })),
                echo(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn unknown_tool_envelope() {
        let dispatcher = Dispatcher::new(ToolRegistry::new());
        let env = dispatcher.call("svc_nonexistent", json!({})).await;
        assert_eq!(
            env.to_value(),
            json!({
                "content": [{ "type": "text", "text": "Unknown tool: svc_nonexistent" }],
                "isError": true
            })
        );
    }

    #[tokio::test]
    async fn success_is_pretty_json() {
        let mut reg = ToolRegistry::new();
        reg.register(Tool::new("svc_set_power", "", node_schema()), echo())
            .unwrap();
        let dispatcher = Dispatcher::new(reg);
        let env = dispatcher
            .call("svc_set_power", json!({ "node_id": "n1" }))
            .await;
        assert!(!env.is_error);
        let parsed: Value = serde_json::from_str(env.text()).unwrap();
        assert_eq!(parsed["data"]["node_id"], "n1");
        assert!(env.text().contains('\n'));
    }

    #[tokio::test]
    async fn schema_violations_never_reach_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut reg = ToolRegistry::new();
        reg.register(Tool::new("svc_set_power", "", node_schema()), counting(&calls))
            .unwrap();
        let dispatcher = Dispatcher::new(reg);

        for bad in [json!({}), json!({ "node_id": 5 }), json!({ "node_id": "a", "x": 1 }), json!([1])] {
            let env = dispatcher.call("svc_set_power", bad).await;
            assert!(env.is_error);
            assert!(env.text().starts_with("Error: invalid arguments"), "{}", env.text());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_errors_and_panics_become_envelopes() {
        let mut reg = ToolRegistry::new();
        reg.register(
            Tool::new("vendor_fail", "", empty_schema()),
            handler(|_| async {
                Err(Error::VendorApi {
                    status: 409,
                    message: "pool busy".into(),
                })
            }),
        )
        .unwrap();
        reg.register(
            Tool::new("conn_fail", "", empty_schema()),
            handler(|_| async { Err(Error::Connection("tcp connect to 10.0.0.9:443 refused".into())) }),
        )
        .unwrap();
        reg.register(
            Tool::new("boom", "", empty_schema()),
            handler(|_| async {
                let empty: Vec<Value> = Vec::new();
                Ok(empty[3].clone())
            }),
        )
        .unwrap();
        let dispatcher = Dispatcher::new(reg);

        let env = dispatcher.call("vendor_fail", json!({})).await;
        assert!(env.is_error);
        assert!(env.text().contains("pool busy"));

        let env = dispatcher.call("conn_fail", Value::Null).await;
        assert!(env.is_error);
        assert!(env.text().starts_with("Error: "));
        assert!(!env.text().contains("10.0.0.9"));
        assert!(env.text().contains("ref: "));

        let env = dispatcher.call("boom", json!({})).await;
        assert!(env.is_error);
        assert!(!env.text().contains("index out of bounds"));
    }

    #[tokio::test]
    async fn destructive_tools_require_confirmation() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut reg = ToolRegistry::new();
        reg.register(
            Tool::new("vm_delete", "Delete a VM", node_schema()).destructive(),
            counting(&calls),
        )
        .unwrap();
        let def = &reg.definitions()[0];
        assert_eq!(def["annotations"]["destructiveHint"], true);
        assert_eq!(def["inputSchema"]["required"], json!(["node_id", "confirm"]));
        let dispatcher = Dispatcher::new(reg);

        let env = dispatcher.call("vm_delete", json!({ "node_id": "100" })).await;
        assert!(env.is_error);

        let env = dispatcher
            .call("vm_delete", json!({ "node_id": "100", "confirm": false }))
            .await;
        assert!(env.is_error);
        assert!(env.text().contains("confirm"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let env = dispatcher
            .call("vm_delete", json!({ "node_id": "100", "confirm": true }))
            .await;
        assert!(!env.is_error);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn confirm_is_stripped_before_handler() {
        let mut reg = ToolRegistry::new();
        reg.register(Tool::new("wipe", "", empty_schema()).destructive(), echo())
            .unwrap();
        let dispatcher = Dispatcher::new(reg);
        let env = dispatcher
            .call("wipe", json!({ "confirm": true, "idempotency_key": "k" }))
            .await;
        let parsed: Value = serde_json::from_str(env.text()).unwrap();
        assert_eq!(parsed["data"], json!({}));
    }

    #[tokio::test(start_paused = true)]
    async fn idempotency_key_replays_within_window() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut reg = ToolRegistry::new();
        reg.register(Tool::new("reboot", "", empty_schema()).destructive(), counting(&calls))
            .unwrap();
        let dispatcher = Dispatcher::new(reg);
        let args = json!({ "confirm": true, "idempotency_key": "turn-7" });

        let first = dispatcher.call("reboot", args.clone()).await;
        let second = dispatcher.call("reboot", args.clone()).await;
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A different key acts again
        dispatcher
            .call("reboot", json!({ "confirm": true, "idempotency_key": "turn-8" }))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(IDEMPOTENCY_WINDOW + Duration::from_secs(1)).await;
        dispatcher.call("reboot", args).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_call_releases_its_idempotency_key() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut reg = ToolRegistry::new();
        reg.register(
            Tool::new("reboot", "", empty_schema()).destructive(),
            bind(&calls, |calls, _| async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(json!("rebooting"))
            }),
        )
        .unwrap();
        let dispatcher = Dispatcher::new(reg);
        let args = json!({ "confirm": true, "idempotency_key": "k" });

        tokio::time::timeout(
            Duration::from_millis(10),
            dispatcher.call("reboot", args.clone()),
        )
        .await
        .unwrap_err();

        let env = dispatcher.call("reboot", args).await;
        assert!(!env.is_error, "{}", env.text());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_idempotent_calls_are_not_replayed() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut reg = ToolRegistry::new();
        reg.register(
            Tool::new("flaky", "", empty_schema()).destructive(),
            bind(&calls, |calls, _| async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Timeout("slow".into()))
                } else {
                    Ok(json!("done"))
                }
            }),
        )
        .unwrap();
        let dispatcher = Dispatcher::new(reg);
        let args = json!({ "confirm": true, "idempotency_key": "k1" });

        assert!(dispatcher.call("flaky", args.clone()).await.is_error);
        assert!(!dispatcher.call("flaky", args).await.is_error);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<std::sync::Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn failing_call_logs_redacted_arguments() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let schema = object_schema(
            json!({ "username": { "type": "string" }, "password": { "type": "string" } }),
            &[],
        );
        let mut reg = ToolRegistry::new();
        reg.register(
            Tool::new("login", "", schema),
            handler(|_| async { Err(Error::authentication("vendor rejected credentials")) }),
        )
        .unwrap();
        let dispatcher = Dispatcher::new(reg);

        let env = dispatcher
            .call("login", json!({ "username": "a", "password": "s3cr3t" }))
            .await;
        assert!(env.is_error);
        assert!(!env.text().contains("s3cr3t"));

        let logs = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("tool call failed"), "{logs}");
        assert!(logs.contains("login"));
        assert!(logs.contains("[REDACTED]"));
        assert!(!logs.contains("s3cr3t"));
    }

    #[tokio::test]
    async fn concurrent_calls_are_independent() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut reg = ToolRegistry::new();
        reg.register(Tool::new("count", "", empty_schema()), counting(&calls))
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(reg));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let d = Arc::clone(&dispatcher);
                tokio::spawn(async move { d.call("count", json!({})).await })
            })
            .collect();
        for task in tasks {
            assert!(!task.await.unwrap().is_error);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 16);
    }
}
