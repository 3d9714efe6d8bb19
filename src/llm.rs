//! Chat-completions surface
//!
//! The bridge drives one LLM contract: messages in, a single choice out,
//! optionally constrained by a JSON-schema response format or offered a tool
//! catalog. The production client speaks the OpenAI-compatible wire format
//! over `reqwest`; tests substitute their own [`ChatCompletions`] impl.
//! There are no internal retries; a failed call surfaces to the caller.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::LlmConfig;
use crate::{Error, Result};

/// Sampling temperature for all bridge calls
pub const TEMPERATURE: f32 = 0.0;
/// Fixed seed so the LLM is the only source of nondeterminism
pub const SEED: i64 = 42;
/// Token cap for synthesis calls
pub const MAX_TOKENS: u32 = 2048;

/// One chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: system, user, assistant, or tool
    pub role: String,
    /// Text content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls issued by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Id of the tool call a tool message answers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// System message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    /// User message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    /// Assistant message carrying tool calls
    #[must_use]
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: None,
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Tool result message answering `tool_call_id`
    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// A tool call emitted by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id, echoed back in the tool message
    pub id: String,
    /// Always "function"
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    /// The called function
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

/// Function name and JSON-encoded arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Function name
    pub name: String,
    /// Arguments as a JSON string
    pub arguments: String,
}

/// A tool offered to the model
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    /// Always "function"
    #[serde(rename = "type")]
    pub def_type: String,
    /// Function signature
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    /// Define a function tool
    #[must_use]
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            def_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Function signature offered to the model
#[derive(Debug, Clone, Serialize)]
pub struct FunctionDefinition {
    /// Function name
    pub name: String,
    /// Function description
    pub description: String,
    /// JSON schema of the inputs
    pub parameters: Value,
}

/// JSON-schema response format constraint
#[derive(Debug, Clone)]
pub struct JsonSchemaFormat {
    /// Schema name
    pub name: String,
    /// Schema description
    pub description: String,
    /// The schema itself
    pub schema: Value,
    /// Provider-side strict validation. Some providers reject enum-heavy
    /// payloads under strict, so this is configurable and defaults to false.
    pub strict: bool,
}

/// One chat-completions request
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Conversation so far
    pub messages: Vec<ChatMessage>,
    /// Tool catalog, empty when tools are not offered
    pub tools: Vec<ToolDefinition>,
    /// Optional structured-response constraint
    pub response_format: Option<JsonSchemaFormat>,
    /// Token cap, `None` for the provider default
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Request over plain messages
    #[must_use]
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            response_format: None,
            max_tokens: None,
        }
    }
}

/// Why the model stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural end of turn
    Stop,
    /// The model requested tool calls
    ToolCalls,
    /// Anything else (length, filter, ...)
    Other,
}

/// The first choice of a completion. Additional choices are ignored.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// Assistant text, when present
    pub content: Option<String>,
    /// Requested tool calls, when present
    pub tool_calls: Vec<ToolCall>,
    /// Finish reason
    pub finish_reason: FinishReason,
}

impl ChatOutcome {
    /// The assistant text or an error when the model returned none
    ///
    /// # Errors
    ///
    /// Returns an error when the choice has no content.
    pub fn text(self) -> Result<String> {
        self.content
            .ok_or_else(|| Error::Llm("unable to get a response from the LLM".to_string()))
    }
}

/// Chat-completions contract
#[async_trait]
pub trait ChatCompletions: Send + Sync {
    /// Run one completion and return the first choice
    async fn complete(&self, request: ChatRequest) -> Result<ChatOutcome>;
}

/// OpenAI-compatible chat client
pub struct OpenAiChatClient {
    http: Client,
    endpoint: String,
    api_key: String,
    deployment: String,
}

impl OpenAiChatClient {
    /// Build a client for one API's LLM configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &LlmConfig, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Llm(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            deployment: config.deployment.clone(),
        })
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[async_trait]
impl ChatCompletions for OpenAiChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatOutcome> {
        let mut body = serde_json::json!({
            "model": self.deployment,
            "messages": request.messages,
            "temperature": TEMPERATURE,
            "seed": SEED,
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = max_tokens.into();
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::to_value(&request.tools)?;
        }
        if let Some(format) = &request.response_format {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": format.name,
                    "description": format.description,
                    "schema": format.schema,
                    "strict": format.strict,
                }
            });
        }

        let url = format!("{}/chat/completions", self.endpoint);
        debug!(deployment = %self.deployment, "Calling chat completions");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            // Body intentionally dropped: provider errors may echo prompts
            return Err(Error::Llm(format!("provider returned {status}")));
        }

        let wire: WireResponse = response.json().await.map_err(|e| Error::Llm(e.to_string()))?;

        let Some(choice) = wire.choices.into_iter().next() else {
            return Err(Error::Llm(
                "unable to get a response from the LLM".to_string(),
            ));
        };

        let finish_reason = match choice.finish_reason.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("tool_calls") => FinishReason::ToolCalls,
            _ => FinishReason::Other,
        };

        Ok(ChatOutcome {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls,
            finish_reason,
        })
    }
}
