//! Model-invocation boundary — the external collaborator that turns a
//! prompt pair into text.
//!
//! The engine only depends on the [`ModelInvoker`] trait; the bundled
//! [`HttpInvoker`] calls Anthropic-compatible and OpenAI-compatible HTTP
//! APIs directly. Streaming is optional: an implementation may push partial
//! text through the chunk sink, but the returned string is always the
//! complete response.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One message of prior conversation handed to the model verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMessage {
    /// "user" | "assistant"
    pub role: String,
    pub content: String,
}

/// Conversation context passed alongside the expanded prompts.
///
/// Ray replies reach gather steps through here as rendered assistant
/// messages — never via placeholder substitution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationContext {
    pub messages: Vec<ContextMessage>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.messages.push(ContextMessage {
            role: role.into(),
            content: content.into(),
        });
    }

    /// Render ray reply texts as numbered assistant messages.
    pub fn with_ray_texts(mut self, texts: &[String]) -> Self {
        for (i, text) in texts.iter().enumerate() {
            self.push("assistant", format!("Response {}:\n{}", i + 1, text));
        }
        self
    }
}

/// A single request to the model collaborator.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Model identifier, opaque to the engine.
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    /// Opaque execution tag from the instruction (e.g. `s-s0-h0-u0-aN-u`),
    /// describing which conversation parts to include. Passed through.
    pub method: String,
    pub context: ConversationContext,
}

/// Channel for optional incremental text deltas during one invocation.
pub type ChunkSink = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum InvokeError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    /// Cooperative cancellation was observed. Not a failure of the model.
    #[error("invocation cancelled")]
    Cancelled,
}

/// The external model-invocation collaborator.
///
/// Implementations must observe `cancel` and return
/// [`InvokeError::Cancelled`] promptly once it fires; they must also carry
/// their own hard timeout so a stuck call cannot ignore cancellation
/// indefinitely.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: InvokeRequest,
        chunks: ChunkSink,
        cancel: CancellationToken,
    ) -> Result<String, InvokeError>;
}

// ─── HTTP implementation ───────────────────────────────────────────────────

/// Which wire dialect the endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiDialect {
    /// `POST {base_url}/v1/messages` with `x-api-key` header.
    Anthropic,
    /// `POST {base_url}/chat/completions` with `Authorization: Bearer`.
    OpenAi,
}

#[derive(Debug, Clone)]
pub struct HttpInvokerConfig {
    pub dialect: ApiDialect,
    pub base_url: String,
    pub api_key: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

impl Default for HttpInvokerConfig {
    fn default() -> Self {
        Self {
            dialect: ApiDialect::Anthropic,
            base_url: "https://api.anthropic.com".to_string(),
            api_key: String::new(),
            max_tokens: 8192,
            temperature: None,
        }
    }
}

impl HttpInvokerConfig {
    /// Build a config from environment variables.
    ///
    /// Reads `PRISM_BASE_URL`, `PRISM_API_KEY` and `PRISM_API_DIALECT`
    /// ("anthropic" | "openai"), falling back to `ANTHROPIC_BASE_URL` and
    /// `ANTHROPIC_AUTH_TOKEN` / `ANTHROPIC_API_KEY`.
    pub fn from_env() -> Self {
        let base_url = std::env::var("PRISM_BASE_URL")
            .or_else(|_| std::env::var("ANTHROPIC_BASE_URL"))
            .unwrap_or_else(|_| "https://api.anthropic.com".to_string());
        let api_key = std::env::var("PRISM_API_KEY")
            .or_else(|_| std::env::var("ANTHROPIC_AUTH_TOKEN"))
            .or_else(|_| std::env::var("ANTHROPIC_API_KEY"))
            .unwrap_or_default();
        let dialect = match std::env::var("PRISM_API_DIALECT").as_deref() {
            Ok("openai") => ApiDialect::OpenAi,
            _ => ApiDialect::Anthropic,
        };
        Self {
            dialect,
            base_url,
            api_key,
            ..Self::default()
        }
    }
}

/// Calls a model endpoint over HTTP.
pub struct HttpInvoker {
    client: reqwest::Client,
    config: HttpInvokerConfig,
}

impl HttpInvoker {
    pub fn new(config: HttpInvokerConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                // Hard upper bound so cancellation is never ignored forever.
                .timeout(Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            config,
        }
    }

    async fn call(&self, request: &InvokeRequest) -> Result<String, InvokeError> {
        match self.config.dialect {
            ApiDialect::Anthropic => self.call_anthropic(request).await,
            ApiDialect::OpenAi => self.call_openai(request).await,
        }
    }

    /// Anthropic-compatible Messages API (also spoken by several gateways).
    async fn call_anthropic(&self, request: &InvokeRequest) -> Result<String, InvokeError> {
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));

        let mut messages: Vec<serde_json::Value> = request
            .context
            .messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect();
        messages.push(serde_json::json!({ "role": "user", "content": request.user_prompt }));

        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": self.config.max_tokens,
            "messages": messages,
        });
        if !request.system_prompt.is_empty() {
            body["system"] = serde_json::Value::String(request.system_prompt.clone());
        }
        if let Some(temp) = self.config.temperature {
            body["temperature"] = serde_json::Value::from(temp);
        }

        tracing::info!(
            "[HttpInvoker] Calling Anthropic API: {} (model: {})",
            url,
            request.model
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| InvokeError::Http(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| InvokeError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(InvokeError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let json: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| InvokeError::Malformed(e.to_string()))?;

        json.get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|block| {
                        if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                            block.get("text").and_then(|t| t.as_str()).map(str::to_string)
                        } else {
                            None
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|s| !s.is_empty())
            .ok_or_else(|| InvokeError::Malformed("no text content blocks".to_string()))
    }

    /// OpenAI-compatible Chat Completions API.
    async fn call_openai(&self, request: &InvokeRequest) -> Result<String, InvokeError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let mut messages: Vec<serde_json::Value> = Vec::new();
        if !request.system_prompt.is_empty() {
            messages.push(serde_json::json!({ "role": "system", "content": request.system_prompt }));
        }
        for m in &request.context.messages {
            messages.push(serde_json::json!({ "role": m.role, "content": m.content }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": request.user_prompt }));

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
        });
        if let Some(temp) = self.config.temperature {
            body["temperature"] = serde_json::Value::from(temp);
        }

        tracing::info!(
            "[HttpInvoker] Calling OpenAI-compatible API: {} (model: {})",
            url,
            request.model
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| InvokeError::Http(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| InvokeError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(InvokeError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let json: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| InvokeError::Malformed(e.to_string()))?;

        json.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| InvokeError::Malformed("no message content".to_string()))
    }
}

#[async_trait]
impl ModelInvoker for HttpInvoker {
    async fn invoke(
        &self,
        request: InvokeRequest,
        chunks: ChunkSink,
        cancel: CancellationToken,
    ) -> Result<String, InvokeError> {
        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(InvokeError::Cancelled),
            result = self.call(&request) => result?,
        };
        // Atomic responses still surface one delta for streaming consumers.
        let _ = chunks.send(text.clone());
        Ok(text)
    }
}

/// Resolve `${ENV_VAR}` / `${ENV_VAR:-default}` references in a string.
/// Applied to model identifiers when rays are bound and to user factory
/// files when they are loaded from disk.
pub fn resolve_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_expr = &caps[1];
        if let Some(idx) = var_expr.find(":-") {
            let var_name = &var_expr[..idx];
            let default_val = &var_expr[idx + 2..];
            std::env::var(var_name).unwrap_or_else(|_| default_val.to_string())
        } else {
            std::env::var(var_expr).unwrap_or_else(|_| format!("${{{}}}", var_expr))
        }
    })
    .to_string()
}
