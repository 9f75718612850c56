//! Mock stdio tool backend for integration tests.
//!
//! Speaks the line-delimited JSON-RPC dialect the gateway proxies:
//! `initialize`, `tools/list`, and `tools/call`. Advertised tools:
//!
//! - `echo`: returns its arguments
//! - `get_time`: returns a fixed timestamp marker
//! - `slow`: sleeps `delay_ms` (default 200) before answering
//! - `fail`: always answers with a JSON-RPC error
//!
//! Set `MOCK_BACKEND_PREFIX` to namespace the tool names (for multi-backend
//! test fleets) and `MOCK_BACKEND_BANNER=1` to print a non-JSON banner line
//! on startup, exercising the proxy's tolerance for stdout bleed.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn prefixed(name: &str) -> String {
    match std::env::var("MOCK_BACKEND_PREFIX") {
        Ok(prefix) if !prefix.is_empty() => format!("{prefix}{name}"),
        _ => name.to_string(),
    }
}

fn tools() -> Value {
    json!([
        { "name": prefixed("echo"), "description": "echo arguments back" },
        { "name": prefixed("get_time"), "description": "fixed timestamp marker" },
        { "name": prefixed("slow"), "description": "answer after a delay" },
        { "name": prefixed("fail"), "description": "always errors" },
    ])
}

async fn handle_call(params: &Value) -> Result<Value, (i64, String)> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name.strip_prefix(&prefixed("")).unwrap_or(name) {
        "echo" => Ok(json!({
            "content": [{ "type": "text", "text": arguments.to_string() }],
        })),
        "get_time" => Ok(json!({
            "content": [{ "type": "text", "text": "2026-08-02T00:00:00Z" }],
        })),
        "slow" => {
            let delay = arguments
                .get("delay_ms")
                .and_then(Value::as_u64)
                .unwrap_or(200);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("slept {delay}ms") }],
            }))
        }
        "fail" => Err((-32050, "mock backend failure".to_string())),
        other => Err((-32601, format!("unknown tool: {other}"))),
    }
}

#[tokio::main]
async fn main() {
    if std::env::var("MOCK_BACKEND_BANNER").as_deref() == Ok("1") {
        println!("mock backend starting (this line is not JSON)");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let Some(id) = request.get("id").cloned() else {
            continue; // notification
        };
        let method = request.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

        let reply = match method {
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": params.get("protocolVersion").cloned().unwrap_or(Value::Null),
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "mock-backend", "version": "0.0.0" },
                },
            }),
            "tools/list" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "tools": tools() },
            }),
            "tools/call" => match handle_call(&params).await {
                Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                Err((code, message)) => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": code, "message": message },
                }),
            },
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("method not found: {method}") },
            }),
        };

        let mut out = reply.to_string();
        out.push('\n');
        if stdout.write_all(out.as_bytes()).await.is_err() {
            break;
        }
        let _ = stdout.flush().await;
    }
}
