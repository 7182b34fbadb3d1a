//! Chat model capability for the patient simulator.
//!
//! Provides a `ChatModel` trait with one implementation:
//! - **OpenAiChatClient** — any OpenAI-compatible `/chat/completions`
//!   endpoint (tool calling required).
//!
//! The capability is a black box to the rest of the crate: given an ordered
//! message list and tool schemas, it returns an assistant content string
//! plus zero or more chosen tool calls.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::ModelConfig;
use crate::tools::ToolSpec;

// ============================================================================
// Wire message types
// ============================================================================

/// One entry of the linear transcript sent to the model. Three shapes occur:
/// plain (`role` + `content`), assistant tool-call (`tool_calls` set,
/// `content` absent), and tool result (`role: "tool"` + `tool_call_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallPayload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn plain(role: impl Into<String>, content: Option<String>) -> Self {
        Self {
            role: role.into(),
            content,
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", Some(content.into()))
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCallPayload>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: None,
            name: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            name: None,
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCallPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallPayload {
    pub name: String,
    /// JSON-encoded argument object, as the API transmits it.
    pub arguments: String,
}

// ============================================================================
// Reply types
// ============================================================================

/// One tool call the model chose to make, with its arguments already parsed
/// back into a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub name: String,
    pub args: Value,
    pub id: String,
}

/// The model's output for one invocation: free text (possibly empty) and
/// zero or more chosen tool calls.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelReply {
    pub answer: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Malformed completion: {0}")]
    MalformedReply(String),

    #[error("Missing API key")]
    MissingApiKey,
}

impl ModelError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ModelError::Http(e) if e.is_connect() || e.is_timeout())
    }
}

// ============================================================================
// ChatModel trait
// ============================================================================

/// Abstraction over the model capability, so the orchestrator can be tested
/// against scripted replies.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, ModelError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Chat-completions API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolSchemaPayload<'a>>>,
}

#[derive(Debug, Serialize)]
struct ToolSchemaPayload<'a> {
    #[serde(rename = "type")]
    call_type: &'static str,
    function: &'a ToolSpec,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallPayload>>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ============================================================================
// OpenAiChatClient
// ============================================================================

/// Chat client for an OpenAI-compatible completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiChatClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiChatClient {
    /// Build a client from config. The API key comes from the argument or
    /// falls back to `OPENAI_API_KEY`; its absence is a hard error.
    pub fn new(config: &ModelConfig, api_key: Option<String>) -> Result<Self, ModelError> {
        let api_key = api_key
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        if api_key.is_empty() {
            return Err(ModelError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.clone(),
        })
    }

    /// Create a client with a custom base URL (for testing / integration)
    pub fn with_base_url(
        config: &ModelConfig,
        api_key: String,
        base_url: String,
    ) -> Result<Self, ModelError> {
        let mut cfg = config.clone();
        cfg.base_url = base_url;
        Self::new(&cfg, Some(api_key))
    }

    async fn complete_once(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);

        let tools_payload = if tools.is_empty() {
            None
        } else {
            Some(
                tools
                    .iter()
                    .map(|t| ToolSchemaPayload {
                        call_type: "function",
                        function: t,
                    })
                    .collect(),
            )
        };

        let request = CompletionRequest {
            model: &self.model,
            messages,
            tools: tools_payload,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(error_body);

            tracing::error!(code = status.as_u16(), message = %message, "Chat API error");

            return Err(ModelError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let completion: CompletionResponse = response.json().await?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::MalformedReply("no choices in response".to_string()))?;

        let mut tool_calls = Vec::new();
        for call in choice.message.tool_calls.unwrap_or_default() {
            let args: Value = serde_json::from_str(&call.function.arguments).map_err(|e| {
                ModelError::MalformedReply(format!(
                    "unparseable arguments for tool '{}': {}",
                    call.function.name, e
                ))
            })?;
            tool_calls.push(ToolCallRequest {
                name: call.function.name,
                args,
                id: call.id,
            });
        }

        Ok(ModelReply {
            answer: choice.message.content.unwrap_or_default(),
            tool_calls,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, ModelError> {
        self.complete_once(messages, tools).await
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

// ============================================================================
// TESTS
// ============================================================================
