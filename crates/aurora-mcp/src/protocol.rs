// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Line-delimited JSON-RPC over arbitrary byte streams.
//!
//! MCP servers on stdio read one request per line and answer with one JSON
//! object per line.  The client is generic over the reader/writer pair so
//! tests drive it with in-memory duplex streams instead of child processes.

use std::time::Duration;

use anyhow::{bail, Context};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

/// One tool advertised by an MCP server.
#[derive(Debug, Clone)]
pub struct McpToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

pub struct JsonRpcClient<R, W> {
    reader: BufReader<R>,
    writer: W,
    next_id: u64,
}

impl<R, W> JsonRpcClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            next_id: 0,
        }
    }

    /// Send a request and wait for the response with a matching id.
    /// Responses for other ids (stale, out of order) are skipped; server
    /// notifications are ignored.
    pub async fn request(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> anyhow::Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.write_line(&message).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                bail!("timed out waiting for {method} response");
            }

            let mut line = String::new();
            let read = tokio::time::timeout(remaining, self.reader.read_line(&mut line))
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for {method} response"))?
                .context("reading MCP response")?;
            if read == 0 {
                bail!("MCP server closed its stdout");
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(response) = serde_json::from_str::<Value>(trimmed) else {
                // Servers occasionally log plain text to stdout; skip it.
                debug!(line = trimmed, "skipping non-JSON line from MCP server");
                continue;
            };
            if response.get("id").and_then(Value::as_u64) != Some(id) {
                debug!(method, "skipping response for another id");
                continue;
            }
            if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
                bail!(
                    "{method} failed: {}",
                    error["message"].as_str().unwrap_or("unknown MCP error")
                );
            }
            return Ok(response["result"].clone());
        }
    }

    /// Fire-and-forget notification (no id, no response).
    pub async fn notify(&mut self, method: &str, params: Value) -> anyhow::Result<()> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_line(&message).await
    }

    async fn write_line(&mut self, message: &Value) -> anyhow::Result<()> {
        let mut bytes = serde_json::to_vec(message)?;
        bytes.push(b'\n');
        self.writer
            .write_all(&bytes)
            .await
            .context("writing to MCP server stdin")?;
        self.writer.flush().await.context("flushing MCP stdin")?;
        Ok(())
    }
}

/// The standard MCP startup sequence:
/// `initialize → notifications/initialized → tools/list`.
pub async fn handshake<R, W>(
    client: &mut JsonRpcClient<R, W>,
    timeout: Duration,
) -> anyhow::Result<Vec<McpToolSpec>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let init = client
        .request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {} },
                "clientInfo": { "name": "aurora", "version": env!("CARGO_PKG_VERSION") },
            }),
            timeout,
        )
        .await?;
    debug!(
        server = init["serverInfo"]["name"].as_str().unwrap_or("unknown"),
        "mcp server initialized"
    );

    client.notify("notifications/initialized", json!({})).await?;

    let listed = client.request("tools/list", json!({}), timeout).await?;
    let mut tools = Vec::new();
    for tool in listed["tools"].as_array().cloned().unwrap_or_default() {
        let Some(name) = tool["name"].as_str() else {
            warn!("skipping MCP tool without a name");
            continue;
        };
        tools.push(McpToolSpec {
            name: name.to_string(),
            description: tool["description"].as_str().unwrap_or("").to_string(),
            input_schema: tool
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| json!({ "type": "object" })),
        });
    }
    Ok(tools)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader as TokioBufReader};

    /// Run a scripted server side: read requests, answer from the queue.
    async fn fake_server(
        server_io: tokio::io::DuplexStream,
        responses: Vec<Value>,
    ) {
        let (read_half, mut write_half) = tokio::io::split(server_io);
        let mut reader = TokioBufReader::new(read_half);
        let mut queue = responses.into_iter();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                break;
            }
            let Ok(request) = serde_json::from_str::<Value>(line.trim()) else { continue };
            // Notifications carry no id and get no response.
            let Some(id) = request.get("id").and_then(Value::as_u64) else { continue };
            if let Some(mut response) = queue.next() {
                response["id"] = json!(id);
                let mut bytes = serde_json::to_vec(&response).unwrap();
                bytes.push(b'\n');
                let _ = write_half.write_all(&bytes).await;
            }
        }
    }

    fn client_pair(
        responses: Vec<Value>,
    ) -> JsonRpcClient<tokio::io::ReadHalf<tokio::io::DuplexStream>, tokio::io::WriteHalf<tokio::io::DuplexStream>>
    {
        let (client_io, server_io) = duplex(64 * 1024);
        tokio::spawn(fake_server(server_io, responses));
        let (read, write) = tokio::io::split(client_io);
        JsonRpcClient::new(read, write)
    }

    #[tokio::test]
    async fn request_returns_the_result_field() {
        let mut client = client_pair(vec![json!({
            "jsonrpc": "2.0",
            "result": { "ok": true },
        })]);
        let result = client
            .request("ping", json!({}), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn error_responses_become_errors() {
        let mut client = client_pair(vec![json!({
            "jsonrpc": "2.0",
            "error": { "code": -32601, "message": "method not found" },
        })]);
        let err = client
            .request("nope", json!({}), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("method not found"));
    }

    #[tokio::test]
    async fn closed_server_is_detected() {
        let (client_io, server_io) = duplex(1024);
        drop(server_io);
        let (read, write) = tokio::io::split(client_io);
        let mut client = JsonRpcClient::new(read, write);
        let err = client
            .request("ping", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("closed") || msg.contains("stdin"), "got: {msg}");
    }

    #[tokio::test]
    async fn handshake_runs_initialize_then_lists_tools() {
        let mut client = client_pair(vec![
            json!({
                "jsonrpc": "2.0",
                "result": { "serverInfo": { "name": "fake-mcp" } },
            }),
            json!({
                "jsonrpc": "2.0",
                "result": { "tools": [
                    { "name": "create_issue", "description": "Create an issue",
                      "inputSchema": { "type": "object", "properties": { "title": {"type": "string"} } } },
                    { "name": "get_me", "description": "Current user" },
                ]},
            }),
        ]);
        let tools = handshake(&mut client, Duration::from_secs(2)).await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "create_issue");
        assert_eq!(tools[1].input_schema["type"], "object");
    }

    #[tokio::test]
    async fn timeout_when_server_stays_silent() {
        let (client_io, _server_io) = duplex(1024);
        let (read, write) = tokio::io::split(client_io);
        let mut client = JsonRpcClient::new(read, write);
        let err = client
            .request("ping", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
