use thiserror::Error;

/// Failure kinds shared by the bridge client, model caller and agent loop.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Session expired")]
    SessionExpired,
    #[error("Bridge unreachable: {0}")]
    Unreachable(String),
    #[error("Model API error {status}: {body}")]
    ModelApi { status: u16, body: String },
    #[error("Empty response from model")]
    EmptyResponse,
    #[error("Malformed response from model: {0}")]
    MalformedResponse(String),
    #[error("Timed out after {0} ms")]
    Timeout(u64),
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BridgeError {
    /// Classify a reqwest failure: deadline → `Timeout`, everything else
    /// (DNS, connect, read) → `Unreachable`.
    pub fn from_transport(e: reqwest::Error, timeout_ms: u64) -> Self {
        if e.is_timeout() {
            BridgeError::Timeout(timeout_ms)
        } else {
            BridgeError::Unreachable(e.to_string())
        }
    }
}
