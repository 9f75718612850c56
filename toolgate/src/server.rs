//! Southbound stdio server: the gateway as a tool provider.
//!
//! Upstream clients speak the same line-delimited JSON-RPC dialect the
//! backends do. The server answers `initialize`, `tools/list`, and
//! `tools/call`, advertising the gateway's own management surface. Tool
//! results are single-element `content` arrays carrying JSON text. Lines
//! that do not parse as JSON objects are ignored; notifications are
//! accepted and dropped.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use toolgate_core::Gateway;
use toolgate_core::jsonrpc::{self, JsonRpcId, JsonRpcMessageKind};
use toolgate_core::proxy::PROTOCOL_VERSION;
use toolgate_core::storage::AuditFilter;

/// The southbound request handler. Pure with respect to I/O: one inbound
/// line maps to at most one outbound line, so tests can drive it directly.
pub struct GatewayServer {
    gateway: Arc<Gateway>,
}

impl GatewayServer {
    /// Wrap a gateway.
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Handle one inbound line; `None` means nothing is written back.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        if line.trim().is_empty() {
            return None;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            debug!(len = line.len(), "ignoring non-JSON input line");
            return None;
        };
        if !value.is_object() {
            return None;
        }
        let kind = match jsonrpc::classify(&value) {
            Ok(kind) => kind,
            Err(e) => {
                debug!(error = %e, "ignoring unclassifiable message");
                return None;
            }
        };
        match kind {
            JsonRpcMessageKind::Request { id, method } => {
                Some(self.handle_request(&id, &method, value.get("params")).await)
            }
            JsonRpcMessageKind::Notification { method } => {
                debug!(method, "dropping notification");
                None
            }
            JsonRpcMessageKind::Response { .. } => None,
        }
    }

    async fn handle_request(&self, id: &JsonRpcId, method: &str, params: Option<&Value>) -> String {
        match method {
            "initialize" => jsonrpc::result_line(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "toolgate",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
            "tools/list" => jsonrpc::result_line(id, json!({ "tools": gateway_tools() })),
            "tools/call" => {
                let name = params
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = params
                    .and_then(|p| p.get("arguments"))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                match self.dispatch_tool(&name, &arguments).await {
                    Ok(payload) => jsonrpc::result_line(id, content_result(&payload, false)),
                    Err(ToolError::Unknown) => {
                        jsonrpc::error_line(id, -32601, &format!("unknown tool: {name}"))
                    }
                    Err(ToolError::Failed(text)) => {
                        jsonrpc::result_line(id, content_result(&json!({"error": text}), true))
                    }
                }
            }
            "ping" => jsonrpc::result_line(id, json!({})),
            other => jsonrpc::error_line(id, -32601, &format!("method not found: {other}")),
        }
    }

    /// Dispatch one gateway tool by name.
    async fn dispatch_tool(&self, name: &str, args: &Value) -> Result<Value, ToolError> {
        match name {
            "call" => self.tool_call(args).await,
            "list_tools" => self.tool_list_tools(args).await,
            "list_servers" => Ok(json!({ "servers": self.gateway.registry().server_ids() })),
            "server_status" => {
                let status = self.gateway.server_status().await;
                serde_json::to_value(status)
                    .map(|servers| json!({ "servers": servers }))
                    .map_err(internal)
            }
            "audit_log" => {
                let filter: AuditFilter =
                    serde_json::from_value(args.clone()).unwrap_or_default();
                let entries = self.gateway.audit_query(&filter).map_err(failed)?;
                serde_json::to_value(entries)
                    .map(|entries| json!({ "entries": entries }))
                    .map_err(internal)
            }
            "audit_verify" => {
                let result = self.gateway.audit_verify().map_err(failed)?;
                serde_json::to_value(result).map_err(internal)
            }
            "audit_stats" => {
                let stats = self.gateway.audit_stats().map_err(failed)?;
                serde_json::to_value(stats).map_err(internal)
            }
            "usage" => {
                let consumer = args.get("consumer").and_then(Value::as_str);
                let summary = self.gateway.usage(consumer).map_err(failed)?;
                serde_json::to_value(summary).map_err(internal)
            }
            _ => Err(ToolError::Unknown),
        }
    }

    /// `call(tool, args-as-json-string, credential?)`: the proxied path.
    async fn tool_call(&self, args: &Value) -> Result<Value, ToolError> {
        let caller = self.authenticate(args).await?;
        let tool = args
            .get("tool")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Failed("missing tool argument".to_string()))?;
        let call_args = match args.get("args") {
            Some(Value::String(text)) => serde_json::from_str(text)
                .map_err(|e| ToolError::Failed(format!("args is not valid JSON: {e}")))?,
            Some(value) => value.clone(),
            None => json!({}),
        };

        let outcome = self
            .gateway
            .call_tool(&caller, tool, call_args)
            .await
            .map_err(failed)?;
        Ok(match outcome {
            toolgate_core::CallOutcome::Success { result } => {
                json!({ "status": "success", "result": result })
            }
            toolgate_core::CallOutcome::Denied { reason } => {
                json!({ "status": "denied", "reason": reason })
            }
            toolgate_core::CallOutcome::RateLimited { reason } => {
                json!({ "status": "rate_limited", "reason": reason })
            }
            toolgate_core::CallOutcome::Failed { error } => {
                json!({ "status": "error", "error": error })
            }
        })
    }

    /// `list_tools(credential?)`: tools visible to the caller's roles.
    async fn tool_list_tools(&self, args: &Value) -> Result<Value, ToolError> {
        let caller = self.authenticate(args).await?;
        let tools: Vec<Value> = self
            .gateway
            .list_tools(&caller)
            .await
            .into_iter()
            .map(|(server_id, tool)| {
                json!({
                    "server": server_id,
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        Ok(json!({ "tools": tools }))
    }

    async fn authenticate(&self, args: &Value) -> Result<toolgate_core::auth::CallerContext, ToolError> {
        let credential = args.get("credential").and_then(Value::as_str);
        self.gateway
            .authenticate(credential)
            .await
            .ok_or_else(|| ToolError::Failed("authentication failed".to_string()))
    }
}

enum ToolError {
    Unknown,
    Failed(String),
}

fn failed(e: impl std::fmt::Display) -> ToolError {
    ToolError::Failed(e.to_string())
}

fn internal(e: serde_json::Error) -> ToolError {
    ToolError::Failed(format!("serialization failed: {e}"))
}

/// Wrap a payload as a single-element content array of JSON text.
fn content_result(payload: &Value, is_error: bool) -> Value {
    let mut result = json!({
        "content": [{ "type": "text", "text": payload.to_string() }],
    });
    if is_error {
        result["isError"] = json!(true);
    }
    result
}

/// The gateway's advertised tool catalog.
fn gateway_tools() -> Vec<Value> {
    let string_prop = |desc: &str| json!({ "type": "string", "description": desc });
    vec![
        json!({
            "name": "call",
            "description": "Invoke a backend tool through the policy gateway",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "tool": string_prop("Tool name to invoke"),
                    "args": string_prop("Tool arguments as a JSON object string"),
                    "credential": string_prop("Caller credential"),
                },
                "required": ["tool"],
            },
        }),
        json!({
            "name": "list_tools",
            "description": "List backend tools visible to the caller",
            "inputSchema": {
                "type": "object",
                "properties": { "credential": string_prop("Caller credential") },
            },
        }),
        json!({
            "name": "list_servers",
            "description": "List registered backend ids",
            "inputSchema": { "type": "object", "properties": {} },
        }),
        json!({
            "name": "server_status",
            "description": "Per-backend supervisor status",
            "inputSchema": { "type": "object", "properties": {} },
        }),
        json!({
            "name": "audit_log",
            "description": "Query audit entries, newest first",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "consumer_id": string_prop("Filter by consumer"),
                    "server_id": string_prop("Filter by server"),
                    "tool": string_prop("Filter by tool"),
                    "status": string_prop("Filter by status"),
                    "from": string_prop("Inclusive lower timestamp bound"),
                    "to": string_prop("Exclusive upper timestamp bound"),
                    "limit": { "type": "integer" },
                    "offset": { "type": "integer" },
                },
            },
        }),
        json!({
            "name": "audit_verify",
            "description": "Verify the audit hash chain",
            "inputSchema": { "type": "object", "properties": {} },
        }),
        json!({
            "name": "audit_stats",
            "description": "Aggregate audit counts",
            "inputSchema": { "type": "object", "properties": {} },
        }),
        json!({
            "name": "usage",
            "description": "Usage summary, optionally for one consumer",
            "inputSchema": {
                "type": "object",
                "properties": { "consumer": string_prop("Consumer id") },
            },
        }),
    ]
}

/// Run the serve loop over the process's own stdio until stdin closes or a
/// termination signal arrives. SIGHUP reloads credentials and policies from
/// the configuration document.
pub async fn run(gateway: Arc<Gateway>, config_path: std::path::PathBuf) -> i32 {
    let server = GatewayServer::new(Arc::clone(&gateway));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    #[cfg(unix)]
    let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(e) => {
            warn!(error = %e, "failed to install SIGHUP handler");
            return 1;
        }
    };
    #[cfg(unix)]
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return 1;
            }
        };

    info!("gateway serving on stdio");
    loop {
        #[cfg(unix)]
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = sighup.recv() => {
                reload_from_disk(&gateway, &config_path);
                continue;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, draining");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, draining");
                break;
            }
        };
        #[cfg(not(unix))]
        let line = lines.next_line().await;

        match line {
            Ok(Some(line)) => {
                if let Some(reply) = server.handle_line(&line).await {
                    if stdout.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdout.flush().await.is_err() {
                        break;
                    }
                }
            }
            Ok(None) => {
                info!("stdin closed, draining");
                break;
            }
            Err(e) => {
                warn!(error = %e, "stdin read failed, draining");
                break;
            }
        }
    }

    gateway.close().await;
    0
}

/// Re-read the config document and swap credentials and policies; backend
/// descriptor changes wait for the next explicit start/stop.
fn reload_from_disk(gateway: &Gateway, config_path: &std::path::Path) {
    match toolgate_core::config::load(config_path) {
        Ok(config) => {
            if let Err(e) = gateway.reload(&config) {
                warn!(error = %e, "reload rejected");
            }
        }
        Err(e) => warn!(error = %e, "reload skipped: config failed to load"),
    }
}
