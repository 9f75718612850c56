//! Error taxonomy for the request pipeline.
//!
//! Policy denials and rate-limit rejections are *not* errors; they are
//! ordinary [`CallOutcome`](crate::gateway::CallOutcome) variants, because the
//! caller receives them as structured results. `GatewayError` covers the
//! failure sites that abort a call: unknown tools, proxy deadlines, backend
//! transport faults, persistence, and configuration.

use crate::jsonrpc::JsonRpcClassifyError;

/// Errors raised by the gateway pipeline and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No registered backend advertises the requested tool.
    #[error("tool not found: {tool}")]
    ToolNotFound {
        /// The tool name the caller asked for.
        tool: String,
    },

    /// The backend did not answer within the per-call deadline.
    #[error("call to {server_id}/{tool} timed out after {timeout_ms}ms")]
    Timeout {
        /// The backend that was called.
        server_id: String,
        /// The tool that was invoked.
        tool: String,
        /// The deadline that expired, in milliseconds.
        timeout_ms: u64,
    },

    /// The backend answered with a JSON-RPC error object.
    #[error("backend {server_id} returned error {code}: {message}")]
    Remote {
        /// The backend that answered.
        server_id: String,
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    /// The backend process is gone or its stdio pipe failed.
    #[error("transport failure on backend {server_id}: {reason}")]
    Transport {
        /// The backend whose transport failed.
        server_id: String,
        /// Human-readable description of the failure.
        reason: String,
    },

    /// The backend is registered but not in the running state.
    #[error("backend {server_id} is not running")]
    NotRunning {
        /// The backend that was addressed.
        server_id: String,
    },

    /// The backend process could not be spawned.
    #[error("failed to spawn backend {server_id}: {reason}")]
    Spawn {
        /// The backend whose command failed.
        server_id: String,
        /// Spawn error text.
        reason: String,
    },

    /// Audit or meter persistence failed.
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StoreError),

    /// Configuration was rejected at load or reload.
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A wire message could not be classified.
    #[error("protocol error: {0}")]
    Protocol(#[from] JsonRpcClassifyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_site() {
        let e = GatewayError::ToolNotFound {
            tool: "get_series".into(),
        };
        assert_eq!(e.to_string(), "tool not found: get_series");

        let e = GatewayError::Timeout {
            server_id: "metrics".into(),
            tool: "query".into(),
            timeout_ms: 30_000,
        };
        assert!(e.to_string().contains("metrics/query"));
        assert!(e.to_string().contains("30000ms"));

        let e = GatewayError::NotRunning {
            server_id: "pay".into(),
        };
        assert!(e.to_string().contains("pay"));
    }
}
