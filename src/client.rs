use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::Duration;
use tracing::debug;

use crate::agent_loop::BridgeConnection;
use crate::error::BridgeError;
use crate::models::{Conversation, HistoryAccess, Message, StatusResponse};
use crate::rpc;

pub const REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const HEALTH_TIMEOUT_MS: u64 = 10_000;
pub const DELETE_TIMEOUT_MS: u64 = 5_000;

/// JSON-RPC client for a remote bridge. Tracks the `mcp-session-id` issued by
/// `initialize` and re-initializes once when the bridge reports the session
/// gone (HTTP 404 "Session not found").
pub struct BridgeClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    session_id: Option<String>,
    next_id: u64,
}

impl BridgeClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        BridgeClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            session_id: None,
            next_id: 0,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Forget the current session; the next call runs `initialize` again.
    pub fn reset_session(&mut self) {
        self.session_id = None;
    }

    /// `GET /health` with the short health-check timeout.
    pub async fn health(&self) -> Result<Value, BridgeError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_millis(HEALTH_TIMEOUT_MS))
            .send()
            .await
            .map_err(|e| BridgeError::from_transport(e, HEALTH_TIMEOUT_MS))?;
        response
            .json()
            .await
            .map_err(|e| BridgeError::Protocol(e.to_string()))
    }

    /// Open a session: `initialize` request followed by the
    /// `notifications/initialized` notification.
    pub async fn initialize(&mut self) -> Result<(), BridgeError> {
        self.session_id = None;
        let result = self
            .post_rpc(
                "initialize",
                json!({
                    "protocolVersion": rpc::PROTOCOL_VERSION,
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION")
                    },
                    "capabilities": {}
                }),
                true,
            )
            .await?;
        debug!(
            protocol = result.get("protocolVersion").and_then(|v| v.as_str()).unwrap_or("?"),
            "session initialized"
        );
        self.post_rpc("notifications/initialized", json!({}), false)
            .await?;
        Ok(())
    }

    /// Invoke a named tool; on `SessionExpired` the client resets,
    /// re-initializes and retries once.
    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value, BridgeError> {
        if self.session_id.is_none() {
            self.initialize().await?;
        }
        let params = json!({"name": name, "arguments": arguments});
        match self.post_rpc("tools/call", params.clone(), true).await {
            Err(BridgeError::SessionExpired) => {
                self.initialize().await?;
                self.post_rpc("tools/call", params, true).await
            }
            other => other,
        }
    }

    /// Best-effort DELETE of the session.
    pub async fn delete_session(&mut self) {
        if let Some(sid) = self.session_id.take() {
            let _ = self
                .client
                .delete(format!("{}/mcp", self.base_url))
                .timeout(Duration::from_millis(DELETE_TIMEOUT_MS))
                .bearer_auth(&self.api_key)
                .header("mcp-session-id", sid)
                .send()
                .await;
        }
    }

    async fn post_rpc(
        &mut self,
        method: &str,
        params: Value,
        is_request: bool,
    ) -> Result<Value, BridgeError> {
        let envelope = if is_request {
            self.next_id += 1;
            json!({"jsonrpc": "2.0", "id": self.next_id, "method": method, "params": params})
        } else {
            json!({"jsonrpc": "2.0", "method": method, "params": params})
        };

        let mut request = self
            .client
            .post(format!("{}/mcp", self.base_url))
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(&envelope);
        if let Some(sid) = &self.session_id {
            request = request.header("mcp-session-id", sid);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BridgeError::from_transport(e, REQUEST_TIMEOUT_MS))?;
        let status = response.status();
        if let Some(sid) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(sid.to_string());
        }
        let body = response
            .text()
            .await
            .map_err(|e| BridgeError::from_transport(e, REQUEST_TIMEOUT_MS))?;

        if status.as_u16() == 404 && body.contains("Session not found") {
            return Err(BridgeError::SessionExpired);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(BridgeError::Auth(body));
        }
        if !is_request {
            // Notifications carry no meaningful response body
            return Ok(Value::Null);
        }
        if !status.is_success() {
            return Err(BridgeError::Unreachable(format!("HTTP {status}: {body}")));
        }

        // Plain JSON or SSE-framed; the last data: line wins
        let payload = rpc::parse_rpc_body(&body)
            .ok_or_else(|| BridgeError::Protocol("Empty response body".to_string()))?;
        if let Some(error) = payload.get("error") {
            let code = error.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string();
            return Err(match code {
                rpc::NOT_FOUND => BridgeError::NotFound(message),
                rpc::INVALID_PARAMS => BridgeError::Validation(message),
                _ => BridgeError::Rpc { code, message },
            });
        }
        payload
            .get("result")
            .cloned()
            .ok_or_else(|| BridgeError::Protocol("Response missing result".to_string()))
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T, BridgeError> {
    serde_json::from_value(value)
        .map_err(|e| BridgeError::Protocol(format!("Unexpected {what} shape: {e}")))
}

#[async_trait]
impl BridgeConnection for BridgeClient {
    async fn list_conversations(&mut self) -> Result<Vec<Conversation>, BridgeError> {
        let result = self.call_tool("list_conversations", json!({})).await?;
        decode(
            result.get("conversations").cloned().unwrap_or(json!([])),
            "conversation list",
        )
    }

    async fn subscriptions(&mut self) -> Result<Vec<String>, BridgeError> {
        let result = self.call_tool("get_status", json!({})).await?;
        let status: StatusResponse = decode(result, "status")?;
        Ok(status
            .subscriptions
            .into_iter()
            .map(|s| s.conversation_id)
            .collect())
    }

    async fn subscribe(
        &mut self,
        conversation_id: &str,
        history_access: HistoryAccess,
    ) -> Result<(), BridgeError> {
        self.call_tool(
            "subscribe",
            json!({
                "conversation_id": conversation_id,
                "history_access": history_access.as_str()
            }),
        )
        .await
        .map(|_| ())
    }

    async fn unread_messages(
        &mut self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, BridgeError> {
        let result = self
            .call_tool(
                "get_messages",
                json!({"conversation_id": conversation_id, "unread_only": true}),
            )
            .await?;
        decode(
            result.get("messages").cloned().unwrap_or(json!([])),
            "message list",
        )
    }

    async fn send_message(
        &mut self,
        conversation_id: &str,
        content: &str,
    ) -> Result<Message, BridgeError> {
        let result = self
            .call_tool(
                "send_message",
                json!({"conversation_id": conversation_id, "content": content}),
            )
            .await?;
        decode(result.get("message").cloned().unwrap_or(Value::Null), "message")
    }

    async fn mark_read(
        &mut self,
        conversation_id: &str,
        up_to_message_id: &str,
    ) -> Result<(), BridgeError> {
        self.call_tool(
            "mark_read",
            json!({
                "conversation_id": conversation_id,
                "up_to_message_id": up_to_message_id
            }),
        )
        .await
        .map(|_| ())
    }

    async fn reset(&mut self) -> Result<(), BridgeError> {
        self.reset_session();
        Ok(())
    }

    async fn close(&mut self) {
        self.delete_session().await;
    }
}
