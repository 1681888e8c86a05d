use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version advertised in `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

// JSON-RPC 2.0 error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
// Application-level codes.
pub const NOT_FOUND: i64 = -32001;
pub const DOMAIN_ERROR: i64 = -32002;
pub const NOT_INITIALIZED: i64 = -32003;

#[derive(Debug, Deserialize, Clone)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    /// A request without an `id` is a notification and gets no response body.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

pub fn response(id: &Value, result: Value) -> Value {
    serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result})
}

pub fn error_response(id: &Value, code: i64, message: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message}
    })
}

pub fn notification(method: &str, params: Value) -> Value {
    serde_json::json!({"jsonrpc": "2.0", "method": method, "params": params})
}

/// Extract a JSON-RPC payload from an HTTP response body that may be either
/// plain JSON or SSE-framed (`data: {...}` lines).
///
/// The last non-empty `data:` line wins; comment lines and empty `data:` lines
/// are tolerated per the SSE contract.
pub fn parse_rpc_body(body: &str) -> Option<Value> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.starts_with("data:") && !trimmed.starts_with(':') && !trimmed.starts_with("event:")
    {
        return serde_json::from_str(trimmed).ok();
    }
    let mut last = None;
    for line in trimmed.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if !data.is_empty() {
                last = Some(data);
            }
        }
    }
    last.and_then(|d| serde_json::from_str(d).ok())
}
