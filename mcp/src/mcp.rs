//! MCP over stdio: one JSON-RPC 2.0 request per line on stdin, one response
//! per line on stdout. Logs go to stderr so stdout stays pure protocol.
//!
//! Every inbound line is handled on its own task, so a slow vendor call does
//! not hold up `ping` or `tools/list`. Responses funnel through a channel to a
//! single writer task and may therefore arrive out of request order; clients
//! match them by `id`.

use std::sync::Arc;

use infra_mcp_core::jsonrpc::{self, ServerInfo};
use infra_mcp_core::Dispatcher;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Responses waiting for the writer task.
const OUTBOX_CAPACITY: usize = 64;

/// Run the MCP server on stdio, processing JSON-RPC requests until EOF.
pub async fn run_stdio(dispatcher: Arc<Dispatcher>, info: ServerInfo) {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    serve(dispatcher, info, stdin, tokio::io::stdout()).await;
}

/// Serve requests from `reader` until EOF, then wait for in-flight calls to
/// answer before returning.
async fn serve<R, W>(dispatcher: Arc<Dispatcher>, info: ServerInfo, mut reader: R, writer: W)
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let info = Arc::new(info);
    let (tx, rx) = mpsc::channel::<Value>(OUTBOX_CAPACITY);
    let writer_task = tokio::spawn(write_loop(rx, writer));

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "stdin read error");
                break;
            }
        }

        let request = std::mem::take(&mut line);
        let dispatcher = Arc::clone(&dispatcher);
        let info = Arc::clone(&info);
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(response) = jsonrpc::handle_line(&dispatcher, &info, &request).await {
                if tx.send(response).await.is_err() {
                    tracing::warn!("response dropped, writer has stopped");
                }
            }
        });
    }
    tracing::info!("stdin closed, waiting for in-flight calls");

    // The writer ends once every request task has dropped its sender
    drop(tx);
    if let Err(e) = writer_task.await {
        tracing::error!(error = %e, "writer task failed");
    }
    tracing::info!("exiting");
}

async fn write_loop<W: AsyncWrite + Unpin>(mut rx: mpsc::Receiver<Value>, mut out: W) {
    while let Some(response) = rx.recv().await {
        write_response(&mut out, &response).await;
    }
}

/// Write a JSON-RPC response (one line, flushed immediately).
async fn write_response<W: AsyncWrite + Unpin>(out: &mut W, response: &Value) {
    let mut output = serde_json::to_string(response).unwrap_or_default();
    output.push('\n');
    if let Err(e) = out.write_all(output.as_bytes()).await {
        tracing::error!(error = %e, "stdout write error");
    }
    if let Err(e) = out.flush().await {
        tracing::error!(error = %e, "stdout flush error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infra_mcp_core::registry::{handler, object_schema};
    use infra_mcp_core::{Tool, ToolRegistry};
    use serde_json::json;
    use tokio::io::BufReader;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn responses_are_newline_delimited() {
        let mut buf = Vec::new();
        write_response(&mut buf, &json!({ "jsonrpc": "2.0", "id": 1, "result": {} })).await;
        write_response(&mut buf, &json!({ "jsonrpc": "2.0", "id": 2, "result": {} })).await;
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(serde_json::from_str::<Value>(lines[1]).unwrap()["id"], 2);
    }

    #[tokio::test]
    async fn slow_call_does_not_block_ping() {
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        let mut registry = ToolRegistry::new();
        registry
            .register(
                Tool::new("proxmox_slow", "Waits for the test.", object_schema(json!({}), &[])),
                handler(move |_| {
                    let gate = Arc::clone(&gate);
                    async move {
                        gate.notified().await;
                        Ok(json!("done"))
                    }
                }),
            )
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(registry));
        let info = ServerInfo {
            name: "infra-mcp-proxmox".into(),
            version: "0.1.0".into(),
        };

        let (mut client_in, server_in) = tokio::io::duplex(4096);
        let (server_out, client_out) = tokio::io::duplex(4096);
        let server = tokio::spawn(serve(dispatcher, info, BufReader::new(server_in), server_out));
        let mut responses = BufReader::new(client_out).lines();

        client_in
            .write_all(
                b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\",\"params\":{\"name\":\"proxmox_slow\"}}\n\
                  {\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n",
            )
            .await
            .unwrap();

        let first: Value = serde_json::from_str(&responses.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["id"], 2);

        release.notify_one();
        let second: Value = serde_json::from_str(&responses.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second["id"], 1);
        assert_eq!(second["result"]["isError"], false);

        drop(client_in);
        server.await.unwrap();
    }
}
