// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Outbound MCP bridge: connects to external tool-servers and publishes their
//! tools into a [`ToolRegistry`] under a namespaced name
//! (`mcp__<server>__<tool>`), so a server that calls its tool `read` doesn't
//! collide with another server's tool of the same bare name.
//!
//! Two transports are supported, mirroring `config.yaml`'s `mcp_servers` map
//! (see [`sven_config::McpServerConfig`]): `stdio` spawns a child process and
//! speaks MCP over its pipes; `sse` POSTs JSON-RPC requests to a remote URL
//! and reads the response off a server-sent event stream.
//!
//! Connection failures surface as a tool-level error rather than a panic —
//! the registry entry stays in place, but every call attempts a fresh
//! connection (for `sse`) or checks the child process is still alive (for
//! `stdio`) before forwarding, backing off exponentially after repeated
//! failures so a dead server doesn't retry-storm on every turn.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rmcp::model::CallToolRequestParams;
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::TokioChildProcess;
use rmcp::ServiceExt;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use sven_config::{McpServerConfig, McpStdioTransport, McpSseTransport};
use sven_tools::{ApprovalPolicy, Tool, ToolCall, ToolOutput, ToolRegistry};

/// Backoff applied after a reconnect failure, doubling up to this cap.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Expand `${VAR}` references in a string against the process environment.
/// Used for header values and stdio env entries so secrets never need to be
/// written into `config.yaml` in plaintext.
fn expand_env(s: &str) -> String {
    shellexpand::env(s).map(|c| c.into_owned()).unwrap_or_else(|_| s.to_string())
}

/// One remote tool-server connection, shared by every [`RemoteMcpTool`] it
/// publishes.  Reconnection state (failure count, next-retry time) is tracked
/// here so all tools on the same server back off together.
enum Transport {
    Stdio {
        command: McpStdioTransport,
        service: Mutex<Option<RunningService<RoleClient, ()>>>,
    },
    Sse {
        url: String,
        headers: HashMap<String, String>,
        client: reqwest::Client,
    },
}

struct ServerConnection {
    name: String,
    transport: Transport,
    failures: AtomicU32,
}

impl ServerConnection {
    fn backoff(&self) -> Duration {
        let n = self.failures.load(Ordering::Relaxed);
        let secs = INITIAL_BACKOFF.as_secs().saturating_mul(1u64.checked_shl(n).unwrap_or(u64::MAX).max(1));
        Duration::from_secs(secs).min(MAX_BACKOFF)
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    async fn ensure_stdio_connected(
        &self,
        command: &McpStdioTransport,
        guard: &mut Option<RunningService<RoleClient, ()>>,
    ) -> Result<()> {
        if guard.is_some() {
            return Ok(());
        }
        let mut cmd = Command::new(&command.command);
        cmd.args(&command.args);
        for (k, v) in &command.env {
            cmd.env(k, expand_env(v));
        }
        let transport = TokioChildProcess::new(cmd)
            .with_context(|| format!("spawning MCP stdio server `{}`", self.name))?;
        let service = ().serve(transport).await.with_context(|| {
            format!("initialising MCP handshake with server `{}`", self.name)
        })?;
        *guard = Some(service);
        Ok(())
    }

    async fn list_remote_tools(&self) -> Result<Vec<(String, String, Value)>> {
        match &self.transport {
            Transport::Stdio { command, service } => {
                let mut guard = service.lock().await;
                self.ensure_stdio_connected(command, &mut guard).await?;
                let peer = guard.as_ref().expect("just connected");
                let result = peer
                    .list_tools(Default::default())
                    .await
                    .context("MCP tools/list failed")?;
                Ok(result
                    .tools
                    .into_iter()
                    .map(|t| {
                        (
                            t.name.to_string(),
                            t.description.as_deref().unwrap_or_default().to_string(),
                            Value::Object((*t.input_schema).clone()),
                        )
                    })
                    .collect())
            }
            Transport::Sse { url, headers, client } => {
                let body = sse_request(client, url, headers, "tools/list", serde_json::json!({}))
                    .await?;
                let tools = body
                    .get("tools")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                Ok(tools
                    .into_iter()
                    .filter_map(|t| {
                        let name = t.get("name")?.as_str()?.to_string();
                        let description = t
                            .get("description")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let schema = t
                            .get("inputSchema")
                            .cloned()
                            .unwrap_or_else(|| serde_json::json!({"type": "object"}));
                        Some((name, description, schema))
                    })
                    .collect())
            }
        }
    }

    async fn call_remote_tool(&self, name: &str, args: Value) -> Result<ToolOutput> {
        let call_id = uuid::Uuid::new_v4().to_string();
        match &self.transport {
            Transport::Stdio { command, service } => {
                let mut guard = service.lock().await;
                self.ensure_stdio_connected(command, &mut guard).await?;
                let peer = guard.as_ref().expect("just connected");
                let params = CallToolRequestParams {
                    name: name.to_string().into(),
                    arguments: args.as_object().cloned(),
                };
                let result = peer.call_tool(params).await.context("MCP tools/call failed")?;
                Ok(call_result_to_output(&call_id, result))
            }
            Transport::Sse { url, headers, client } => {
                let body = sse_request(
                    client,
                    url,
                    headers,
                    "tools/call",
                    serde_json::json!({ "name": name, "arguments": args }),
                )
                .await?;
                let is_error = body.get("isError").and_then(|v| v.as_bool()).unwrap_or(false);
                let text = body
                    .get("content")
                    .and_then(|v| v.as_array())
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                Ok(if is_error {
                    ToolOutput::err(&call_id, text)
                } else {
                    ToolOutput::ok(&call_id, text)
                })
            }
        }
    }
}

fn call_result_to_output(call_id: &str, result: rmcp::model::CallToolResult) -> ToolOutput {
    use rmcp::model::RawContent;
    let is_error = result.is_error.unwrap_or(false);
    let text: String = result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    if is_error {
        ToolOutput::err(call_id, text)
    } else {
        ToolOutput::ok(call_id, text)
    }
}

/// POST a JSON-RPC request to `url` and parse the single JSON-RPC result out
/// of the server-sent event stream's `data:` payload.
async fn sse_request(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
    method: &str,
    params: Value,
) -> Result<Value> {
    let mut req = client
        .post(url)
        .header("Accept", "text/event-stream")
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        }));
    for (k, v) in headers {
        req = req.header(k, expand_env(v));
    }
    let resp = req.send().await.context("MCP SSE request failed")?;
    let resp = resp.error_for_status().context("MCP server returned an error status")?;
    let body = resp.text().await.context("reading MCP SSE response body")?;

    // Each SSE frame is `data: <json>\n\n`; take the last data line — the
    // final frame carries the completed JSON-RPC response.
    let data_line = body
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .last()
        .map(str::trim)
        .unwrap_or(body.trim());

    let envelope: Value = serde_json::from_str(data_line)
        .with_context(|| format!("parsing MCP SSE payload: {data_line}"))?;
    if let Some(err) = envelope.get("error") {
        anyhow::bail!("MCP server error: {err}");
    }
    envelope
        .get("result")
        .cloned()
        .context("MCP SSE response missing `result` field")
}

/// A single remote tool, published into the local [`ToolRegistry`] under its
/// namespaced name.  Executes by forwarding to the owning [`ServerConnection`].
struct RemoteMcpTool {
    namespaced_name: String,
    remote_name: String,
    description: String,
    schema: Value,
    conn: Arc<ServerConnection>,
}

#[async_trait]
impl Tool for RemoteMcpTool {
    fn name(&self) -> &str {
        &self.namespaced_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    fn default_policy(&self) -> ApprovalPolicy {
        // Remote tools run code we don't control — ask by default, same as
        // any other tool the policy engine hasn't explicitly auto-approved.
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let backoff = self.conn.backoff();
        if self.conn.failures.load(Ordering::Relaxed) > 0 {
            debug!(server = %self.conn.name, ?backoff, "retrying after previous MCP failure");
        }
        match self.conn.call_remote_tool(&self.remote_name, call.args.clone()).await {
            Ok(mut output) => {
                output.call_id = call.id.clone();
                self.conn.record_success();
                output
            }
            Err(e) => {
                self.conn.record_failure();
                warn!(server = %self.conn.name, tool = %self.remote_name, error = %e, "MCP tool call failed");
                ToolOutput::err(&call.id, format!("MCP server `{}` unavailable: {e:#}", self.conn.name))
            }
        }
    }
}

/// Build the namespaced tool name `mcp__<server>__<tool>`.
fn namespaced(server: &str, tool: &str) -> String {
    format!("mcp__{server}__{tool}")
}

/// Connect to every server in `servers` and register its tools into
/// `registry`.  A server that fails to connect is logged and skipped — one
/// bad server definition must not prevent the others (or the built-in tools)
/// from being available.
pub async fn connect_all(
    servers: &HashMap<String, McpServerConfig>,
    registry: &mut ToolRegistry,
) {
    for (name, def) in servers {
        if let Err(e) = connect_one(name, def, registry).await {
            warn!(server = %name, error = %format!("{e:#}"), "failed to connect MCP server");
        }
    }
}

async fn connect_one(
    name: &str,
    def: &McpServerConfig,
    registry: &mut ToolRegistry,
) -> Result<()> {
    let transport = build_transport(def)?;
    let conn = Arc::new(ServerConnection {
        name: name.to_string(),
        transport,
        failures: AtomicU32::new(0),
    });

    let tools = conn.list_remote_tools().await.with_context(|| {
        format!("listing tools on MCP server `{name}`")
    })?;

    for (remote_name, description, schema) in tools {
        let tool = RemoteMcpTool {
            namespaced_name: namespaced(name, &remote_name),
            remote_name,
            description,
            schema,
            conn: conn.clone(),
        };
        registry.register(tool);
    }
    Ok(())
}

fn build_transport(def: &McpServerConfig) -> Result<Transport> {
    if let Some(stdio) = &def.stdio {
        Ok(Transport::Stdio {
            command: stdio.clone(),
            service: Mutex::new(None),
        })
    } else if let Some(sse) = &def.sse {
        build_sse_transport(sse)
    } else {
        anyhow::bail!("MCP server definition has neither `stdio` nor `sse` configured");
    }
}

fn build_sse_transport(sse: &McpSseTransport) -> Result<Transport> {
    Ok(Transport::Sse {
        url: sse.url.clone(),
        headers: sse.headers.clone(),
        client: reqwest::Client::builder()
            .build()
            .context("building reqwest client for MCP SSE transport")?,
    })
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_name_avoids_collisions_between_servers() {
        assert_eq!(namespaced("filesystem", "read"), "mcp__filesystem__read");
        assert_eq!(namespaced("linear", "read"), "mcp__linear__read");
        assert_ne!(namespaced("filesystem", "read"), namespaced("linear", "read"));
    }

    #[test]
    fn expand_env_substitutes_variable() {
        std::env::set_var("SVEN_MCP_TEST_TOKEN", "secret123");
        assert_eq!(expand_env("Bearer ${SVEN_MCP_TEST_TOKEN}"), "Bearer secret123");
        std::env::remove_var("SVEN_MCP_TEST_TOKEN");
    }

    #[test]
    fn expand_env_leaves_plain_strings_untouched() {
        assert_eq!(expand_env("plain-value"), "plain-value");
    }

    #[test]
    fn build_transport_requires_stdio_or_sse() {
        let def = McpServerConfig { stdio: None, sse: None };
        assert!(build_transport(&def).is_err());
    }

    #[test]
    fn build_transport_stdio_variant() {
        let def = McpServerConfig {
            stdio: Some(McpStdioTransport {
                command: "true".into(),
                args: vec![],
                env: HashMap::new(),
            }),
            sse: None,
        };
        assert!(matches!(build_transport(&def).unwrap(), Transport::Stdio { .. }));
    }

    #[test]
    fn build_transport_sse_variant() {
        let def = McpServerConfig {
            stdio: None,
            sse: Some(McpSseTransport {
                url: "https://example.com/sse".into(),
                headers: HashMap::new(),
            }),
        };
        assert!(matches!(build_transport(&def).unwrap(), Transport::Sse { .. }));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let conn = ServerConnection {
            name: "test".into(),
            transport: Transport::Sse {
                url: "https://example.com".into(),
                headers: HashMap::new(),
                client: reqwest::Client::new(),
            },
            failures: AtomicU32::new(0),
        };
        assert_eq!(conn.backoff(), INITIAL_BACKOFF);
        conn.record_failure();
        assert_eq!(conn.backoff(), Duration::from_secs(2));
        for _ in 0..10 {
            conn.record_failure();
        }
        assert_eq!(conn.backoff(), MAX_BACKOFF);
    }

    #[test]
    fn record_success_resets_failure_count() {
        let conn = ServerConnection {
            name: "test".into(),
            transport: Transport::Sse {
                url: "https://example.com".into(),
                headers: HashMap::new(),
                client: reqwest::Client::new(),
            },
            failures: AtomicU32::new(3),
        };
        conn.record_success();
        assert_eq!(conn.backoff(), INITIAL_BACKOFF);
    }
}
