//! Line-delimited JSON-RPC 2.0 message classification and construction.
//!
//! Both sides of the gateway speak one JSON-RPC object per newline-terminated
//! line: the proxy writes requests to backend stdin and splits backend stdout,
//! and the southbound server does the same over the gateway's own stdio. This
//! module classifies already-parsed `serde_json::Value`s so the two transports
//! share one set of rules, and builds the wire lines they emit.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// JSON-RPC protocol version string required on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC request id: number, string, or null.
///
/// Floats, booleans, arrays, and objects are invalid ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    /// Integer id (the proxy allocates these monotonically).
    Number(i64),
    /// String id (accepted from southbound callers).
    String(String),
    /// Null id (valid but unusual per JSON-RPC 2.0).
    Null,
}

impl std::fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
            Self::Null => f.write_str("null"),
        }
    }
}

/// Classification of a JSON-RPC 2.0 message.
///
/// Determined by presence of `id` and `method`:
/// - Request: has both `id` and `method`
/// - Response: has `id` but no `method`
/// - Notification: has `method` but no `id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonRpcMessageKind {
    /// Has both `id` and `method`; expects a response.
    Request { id: JsonRpcId, method: String },
    /// Has `id` but no `method`; answers a previous request.
    Response { id: JsonRpcId },
    /// Has `method` but no `id`; fire-and-forget.
    Notification { method: String },
}

/// Errors from classifying a parsed JSON-RPC value.
#[derive(Debug, thiserror::Error)]
pub enum JsonRpcClassifyError {
    /// The `jsonrpc` field is missing or not `"2.0"`.
    #[error("missing or invalid jsonrpc version field")]
    InvalidVersion,
    /// The `id` field is present but not a number, string, or null.
    #[error("invalid id field")]
    InvalidId,
    /// Neither `id` nor `method` is present.
    #[error("message has neither id nor method")]
    Unclassifiable,
}

/// Classify a parsed JSON-RPC value without taking ownership.
///
/// # Errors
///
/// Returns [`JsonRpcClassifyError`] when the version field is absent or wrong,
/// the id has an invalid type, or the message carries neither id nor method.
pub fn classify(value: &Value) -> Result<JsonRpcMessageKind, JsonRpcClassifyError> {
    let version = value.get("jsonrpc").and_then(Value::as_str);
    if version != Some(JSONRPC_VERSION) {
        return Err(JsonRpcClassifyError::InvalidVersion);
    }

    let id = value
        .get("id")
        .map(parse_id)
        .transpose()
        .map_err(|()| JsonRpcClassifyError::InvalidId)?;
    let method = value.get("method").and_then(Value::as_str).map(String::from);

    match (id, method) {
        (Some(id), Some(method)) => Ok(JsonRpcMessageKind::Request { id, method }),
        (Some(id), None) => Ok(JsonRpcMessageKind::Response { id }),
        (None, Some(method)) => Ok(JsonRpcMessageKind::Notification { method }),
        (None, None) => Err(JsonRpcClassifyError::Unclassifiable),
    }
}

fn parse_id(value: &Value) -> Result<JsonRpcId, ()> {
    match value {
        Value::Number(n) => n.as_i64().map(JsonRpcId::Number).ok_or(()),
        Value::String(s) => Ok(JsonRpcId::String(s.clone())),
        Value::Null => Ok(JsonRpcId::Null),
        _ => Err(()),
    }
}

/// Build a newline-terminated request line.
pub fn request_line(id: i64, method: &str, params: Value) -> String {
    let mut line = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
    .to_string();
    line.push('\n');
    line
}

/// Build a newline-terminated success response line.
pub fn result_line(id: &JsonRpcId, result: Value) -> String {
    let id_value = id_to_value(id);
    let mut line = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id_value,
        "result": result,
    })
    .to_string();
    line.push('\n');
    line
}

/// Build a newline-terminated error response line.
pub fn error_line(id: &JsonRpcId, code: i64, message: &str) -> String {
    let id_value = id_to_value(id);
    let mut line = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id_value,
        "error": { "code": code, "message": message },
    })
    .to_string();
    line.push('\n');
    line
}

fn id_to_value(id: &JsonRpcId) -> Value {
    match id {
        JsonRpcId::Number(n) => json!(n),
        JsonRpcId::String(s) => json!(s),
        JsonRpcId::Null => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_request() {
        let val = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {}});
        let kind = classify(&val).unwrap();
        assert_eq!(
            kind,
            JsonRpcMessageKind::Request {
                id: JsonRpcId::Number(1),
                method: "tools/call".to_string()
            }
        );
    }

    #[test]
    fn test_classify_response() {
        let val = json!({"jsonrpc": "2.0", "id": 7, "result": {"ok": true}});
        let kind = classify(&val).unwrap();
        assert_eq!(
            kind,
            JsonRpcMessageKind::Response {
                id: JsonRpcId::Number(7)
            }
        );
    }

    #[test]
    fn test_classify_error_response() {
        let val = json!({"jsonrpc": "2.0", "id": 5, "error": {"code": -32600, "message": "bad"}});
        let kind = classify(&val).unwrap();
        assert_eq!(
            kind,
            JsonRpcMessageKind::Response {
                id: JsonRpcId::Number(5)
            }
        );
    }

    #[test]
    fn test_classify_notification() {
        let val = json!({"jsonrpc": "2.0", "method": "initialized"});
        let kind = classify(&val).unwrap();
        assert_eq!(
            kind,
            JsonRpcMessageKind::Notification {
                method: "initialized".to_string()
            }
        );
    }

    #[test]
    fn test_classify_missing_version() {
        let val = json!({"id": 1, "method": "x"});
        assert!(matches!(
            classify(&val).unwrap_err(),
            JsonRpcClassifyError::InvalidVersion
        ));
    }

    #[test]
    fn test_classify_wrong_version() {
        let val = json!({"jsonrpc": "1.0", "id": 1, "method": "x"});
        assert!(matches!(
            classify(&val).unwrap_err(),
            JsonRpcClassifyError::InvalidVersion
        ));
    }

    #[test]
    fn test_classify_string_id() {
        let val = json!({"jsonrpc": "2.0", "id": "abc-123", "method": "ping"});
        let kind = classify(&val).unwrap();
        assert_eq!(
            kind,
            JsonRpcMessageKind::Request {
                id: JsonRpcId::String("abc-123".to_string()),
                method: "ping".to_string()
            }
        );
    }

    #[test]
    fn test_classify_null_id_response() {
        let val = json!({"jsonrpc": "2.0", "id": null, "result": "ok"});
        let kind = classify(&val).unwrap();
        assert_eq!(kind, JsonRpcMessageKind::Response { id: JsonRpcId::Null });
    }

    #[test]
    fn test_classify_invalid_id_type() {
        let val = json!({"jsonrpc": "2.0", "id": true, "method": "x"});
        assert!(matches!(
            classify(&val).unwrap_err(),
            JsonRpcClassifyError::InvalidId
        ));
    }

    #[test]
    fn test_classify_float_id_rejected() {
        let val = json!({"jsonrpc": "2.0", "id": 1.5, "method": "x"});
        assert!(matches!(
            classify(&val).unwrap_err(),
            JsonRpcClassifyError::InvalidId
        ));
    }

    #[test]
    fn test_classify_unclassifiable() {
        let val = json!({"jsonrpc": "2.0"});
        assert!(matches!(
            classify(&val).unwrap_err(),
            JsonRpcClassifyError::Unclassifiable
        ));
    }

    #[test]
    fn test_request_line_shape() {
        let line = request_line(42, "tools/list", json!({}));
        assert!(line.ends_with('\n'));
        let parsed: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["jsonrpc"], "2.0");
        assert_eq!(parsed["id"], 42);
        assert_eq!(parsed["method"], "tools/list");
    }

    #[test]
    fn test_result_line_preserves_string_id() {
        let line = result_line(&JsonRpcId::String("req-9".into()), json!({"x": 1}));
        let parsed: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["id"], "req-9");
        assert_eq!(parsed["result"]["x"], 1);
    }

    #[test]
    fn test_error_line_single_line() {
        let line = error_line(&JsonRpcId::Number(3), -32601, "method not found");
        assert_eq!(line.matches('\n').count(), 1);
        let parsed: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["error"]["code"], -32601);
    }
}
