//! Request/response correlation over a backend's stdio.
//!
//! One [`BackendClient`] exclusively owns one process's stdin/stdout. The
//! outbound stream carries one JSON-RPC object per newline-terminated line;
//! the inbound stream is split on newlines with non-JSON lines silently
//! ignored, tolerating stderr bleed and interleaved diagnostics. Requests
//! carry monotonically increasing numeric ids; a correlation table pairs
//! each id with a oneshot completion. Reply and timeout both remove the
//! entry, so a late response after a deadline can never resolve the same
//! request twice. Completions are sent outside the table lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::jsonrpc::{self, JsonRpcId, JsonRpcMessageKind};

/// Protocol version sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Default per-request deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// One tool advertised by a backend.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name, unique within its backend.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the tool's arguments.
    #[serde(
        default,
        rename = "inputSchema",
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<Value>,
}

/// Proxy-level failures for one request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    /// The deadline expired before a correlated reply arrived.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// The deadline that expired.
        timeout_ms: u64,
    },
    /// The backend answered with a JSON-RPC error object.
    #[error("backend error {code}: {message}")]
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },
    /// The proxy was destroyed (process exit or shutdown) with the request
    /// in flight.
    #[error("proxy destroyed")]
    Destroyed,
    /// Writing the request line failed.
    #[error("backend stdin write failed: {reason}")]
    Write {
        /// I/O error text.
        reason: String,
    },
    /// The reply was not the shape the operation requires.
    #[error("malformed backend reply: {reason}")]
    Malformed {
        /// What was wrong with the reply.
        reason: String,
    },
}

type Completion = oneshot::Sender<Result<Value, ProxyError>>;

/// `None` once the proxy is destroyed; registrations then fail fast.
type PendingTable = Mutex<Option<HashMap<i64, Completion>>>;

/// Correlating JSON-RPC client over one backend's stdio.
pub struct BackendClient {
    next_id: AtomicI64,
    pending: std::sync::Arc<PendingTable>,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    default_timeout: Duration,
    reader_task: tokio::task::JoinHandle<()>,
}

impl BackendClient {
    /// Build a client over a reader/writer pair and spawn the inbound
    /// dispatch task.
    pub fn new<R, W>(reader: R, writer: W, default_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: std::sync::Arc<PendingTable> =
            std::sync::Arc::new(Mutex::new(Some(HashMap::new())));

        let reader_task = tokio::spawn(dispatch_inbound(reader, std::sync::Arc::clone(&pending)));

        Self {
            next_id: AtomicI64::new(1),
            pending,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            default_timeout,
            reader_task,
        }
    }

    /// Send one request and await its correlated reply under the deadline.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] on timeout, a backend error object, a write
    /// failure, or destruction while in flight.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ProxyError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        {
            let mut table = lock_pending(&self.pending);
            let Some(table) = table.as_mut() else {
                return Err(ProxyError::Destroyed);
            };
            table.insert(id, tx);
        }

        let line = jsonrpc::request_line(id, method, params);
        {
            let mut writer = self.writer.lock().await;
            let write = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            };
            if let Err(e) = write.await {
                self.remove_pending(id);
                return Err(ProxyError::Write {
                    reason: e.to_string(),
                });
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProxyError::Destroyed),
            Err(_) => {
                // Deadline expired: drop the entry so a late reply is ignored.
                self.remove_pending(id);
                Err(ProxyError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Run the `initialize` handshake.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] when the handshake fails.
    pub async fn initialize(&self, client_name: &str) -> Result<Value, ProxyError> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": client_name, "version": env!("CARGO_PKG_VERSION") },
            }),
            None,
        )
        .await
    }

    /// Discover the backend's tool catalog.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] when the request fails or the reply lacks a
    /// `tools` array.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ProxyError> {
        let result = self.request("tools/list", json!({}), None).await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| ProxyError::Malformed {
                reason: "tools/list reply has no tools array".to_string(),
            })?;
        serde_json::from_value(tools).map_err(|e| ProxyError::Malformed {
            reason: e.to_string(),
        })
    }

    /// Invoke one tool; the backend's `result` is returned verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] on timeout, backend error, or transport
    /// failure.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ProxyError> {
        self.request(
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
            timeout,
        )
        .await
    }

    /// Fail every pending request and stop the dispatch task.
    pub fn shutdown(&self) {
        fail_all_pending(&self.pending);
        self.reader_task.abort();
    }

    fn remove_pending(&self, id: i64) {
        let mut table = lock_pending(&self.pending);
        if let Some(table) = table.as_mut() {
            table.remove(&id);
        }
    }
}

impl Drop for BackendClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock_pending(
    pending: &PendingTable,
) -> std::sync::MutexGuard<'_, Option<HashMap<i64, Completion>>> {
    pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Take the whole table and complete every waiter with `Destroyed`.
fn fail_all_pending(pending: &PendingTable) {
    let table = lock_pending(pending).take();
    if let Some(table) = table {
        let count = table.len();
        for (_, tx) in table {
            let _ = tx.send(Err(ProxyError::Destroyed));
        }
        if count > 0 {
            debug!(count, "failed pending requests on proxy teardown");
        }
    }
}

/// Inbound loop: split on newlines, ignore non-JSON, complete correlated
/// waiters. Ends (failing all pending) on EOF or a read error.
async fn dispatch_inbound<R>(reader: R, pending: std::sync::Arc<PendingTable>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "backend stdout read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            // Interleaved diagnostics on stdout are tolerated.
            debug!(len = line.len(), "ignoring non-JSON line from backend");
            continue;
        };
        if !value.is_object() {
            continue;
        }
        let Ok(kind) = jsonrpc::classify(&value) else {
            continue;
        };
        match kind {
            JsonRpcMessageKind::Response {
                id: JsonRpcId::Number(id),
            } => {
                // Remove under the lock, complete outside it.
                let completion = {
                    let mut table = lock_pending(&pending);
                    table.as_mut().and_then(|t| t.remove(&id))
                };
                let Some(tx) = completion else {
                    debug!(id, "late or unknown response id, ignoring");
                    continue;
                };
                let outcome = if let Some(error) = value.get("error") {
                    Err(ProxyError::Remote {
                        code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                        message: error
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string(),
                    })
                } else {
                    Ok(value.get("result").cloned().unwrap_or(Value::Null))
                };
                let _ = tx.send(outcome);
            }
            JsonRpcMessageKind::Notification { method } => {
                // Reserved for future forwarding.
                debug!(method, "dropping backend notification");
            }
            _ => {}
        }
    }
    fail_all_pending(&pending);
}
