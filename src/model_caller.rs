use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;
use tokio::time::Duration;
use tracing::debug;

use crate::agent_loop::Adapter;
use crate::error::BridgeError;

pub const DEFAULT_MODEL_TIMEOUT_MS: u64 = 120_000;

/// How much of an upstream error body to keep in the error message.
const ERROR_BODY_PREFIX: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelCallOptions {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug)]
pub struct ModelReply {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// Token usage is best-effort; upstreams that omit it report zeros
#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Single-shot chat-completions call: `POST <endpoint>/v1/chat/completions`
/// with `stream: false`, bearer auth when an API key is configured.
pub async fn call_model(
    client: &reqwest::Client,
    messages: &[ChatMessage],
    opts: &ModelCallOptions,
) -> Result<ModelReply, BridgeError> {
    let url = format!(
        "{}/v1/chat/completions",
        opts.endpoint.trim_end_matches('/')
    );
    let started = Instant::now();

    let mut request = client
        .post(&url)
        .timeout(Duration::from_millis(opts.timeout_ms))
        .header("Content-Type", "application/json")
        .json(&json!({
            "model": opts.model,
            "messages": messages,
            "stream": false
        }));
    if let Some(key) = &opts.api_key {
        request = request.bearer_auth(key);
    }

    let response = request
        .send()
        .await
        .map_err(|e| BridgeError::from_transport(e, opts.timeout_ms))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| BridgeError::from_transport(e, opts.timeout_ms))?;
    let duration_ms = started.elapsed().as_millis() as u64;

    if !status.is_success() {
        return Err(BridgeError::ModelApi {
            status: status.as_u16(),
            body: body.chars().take(ERROR_BODY_PREFIX).collect(),
        });
    }

    let parsed: CompletionResponse = serde_json::from_str(&body)
        .map_err(|e| BridgeError::MalformedResponse(e.to_string()))?;
    let content = parsed
        .choices
        .first()
        .and_then(|c| c.message.as_ref())
        .and_then(|m| m.content.clone())
        .filter(|c| !c.is_empty())
        .ok_or(BridgeError::EmptyResponse)?;
    let usage = parsed.usage.unwrap_or_default();

    debug!(
        model = %opts.model,
        duration_ms,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        "model call complete"
    );

    Ok(ModelReply {
        content,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        duration_ms,
    })
}

/// Adapter that answers every batch with one chat-completions call.
pub struct ModelAdapter {
    client: reqwest::Client,
    opts: ModelCallOptions,
}

impl ModelAdapter {
    pub fn new(opts: ModelCallOptions) -> Self {
        ModelAdapter {
            client: reqwest::Client::new(),
            opts,
        }
    }
}

#[async_trait::async_trait]
impl Adapter for ModelAdapter {
    async fn reply(
        &self,
        system_prompt: Option<&str>,
        prompt: &str,
    ) -> Result<String, BridgeError> {
        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));
        let reply = call_model(&self.client, &messages, &self.opts).await?;
        Ok(reply.content)
    }
}
