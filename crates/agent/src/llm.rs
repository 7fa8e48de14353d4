//! Chat-completion provider seam and the OpenAI-compatible HTTP client.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use taskdeck_core::config::{LlmConfig, LlmProvider};
use taskdeck_core::ToolError;

use crate::tools::ToolDefinition;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model, consumed exactly once per
/// orchestrator iteration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl AgentMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: Some(content.into()), tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: Some(content.into()), tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self { role: Role::Assistant, content: None, tool_calls, tool_call_id: None }
    }

    /// Tool-role message correlated to one tool call.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn accumulate(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    pub usage: Usage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
}

impl ToolChoice {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::None => "none",
        }
    }
}

#[async_trait]
pub trait ChatCompletionProvider: Send + Sync {
    async fn complete(
        &self,
        messages: &[AgentMessage],
        tools: &[ToolDefinition],
        tool_choice: ToolChoice,
    ) -> Result<ChatCompletion, ToolError>;
}

/// Client for any endpoint speaking the OpenAI chat-completions wire format,
/// which covers both hosted OpenAI and a local Ollama.
pub struct OpenAiCompatibleProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    max_retries: u32,
}

impl OpenAiCompatibleProvider {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ToolError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| ToolError::Provider(format!("http client setup failed: {err}")))?;

        let base_url = match (&config.base_url, config.provider) {
            (Some(base_url), _) => base_url.trim_end_matches('/').to_string(),
            (None, LlmProvider::OpenAi) => "https://api.openai.com".to_string(),
            (None, LlmProvider::Ollama) => "http://localhost:11434".to_string(),
        };

        Ok(Self {
            http,
            base_url,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_retries: config.max_retries,
        })
    }

    fn request_body(
        &self,
        messages: &[AgentMessage],
        tools: &[ToolDefinition],
        tool_choice: ToolChoice,
    ) -> Value {
        let wire_messages: Vec<Value> = messages.iter().map(wire_message).collect();
        let wire_tools: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
        });
        if !wire_tools.is_empty() {
            body["tools"] = Value::Array(wire_tools);
            body["tool_choice"] = Value::String(tool_choice.as_str().to_string());
        }
        body
    }

    async fn post_once(&self, body: &Value) -> Result<Value, ToolError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut request = self.http.post(&url).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|err| ToolError::Provider(format!("chat completion request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ToolError::Provider(format!(
                "chat completion returned {status}: {detail}"
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|err| ToolError::Provider(format!("chat completion decode failed: {err}")))
    }
}

fn wire_message(message: &AgentMessage) -> Value {
    let mut wire = json!({
        "role": match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        },
        "content": message.content.clone().unwrap_or_default(),
    });
    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = Value::Array(
            message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.tool_name,
                            "arguments": call.arguments.to_string(),
                        }
                    })
                })
                .collect(),
        );
    }
    if let Some(tool_call_id) = &message.tool_call_id {
        wire["tool_call_id"] = Value::String(tool_call_id.clone());
    }
    wire
}

fn parse_completion(payload: &Value) -> Result<ChatCompletion, ToolError> {
    let choice = payload["choices"]
        .get(0)
        .ok_or_else(|| ToolError::Provider("chat completion carried no choices".to_string()))?;
    let message = &choice["message"];

    let content = message["content"].as_str().filter(|text| !text.is_empty()).map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(raw_calls) = message["tool_calls"].as_array() {
        for raw in raw_calls {
            let id = raw["id"].as_str().unwrap_or_default().to_string();
            let tool_name = raw["function"]["name"].as_str().unwrap_or_default().to_string();
            let raw_arguments = raw["function"]["arguments"].as_str().unwrap_or("{}");
            let arguments = serde_json::from_str(raw_arguments).unwrap_or(Value::Null);
            tool_calls.push(ToolCall { id, tool_name, arguments });
        }
    }

    let finish_reason = choice["finish_reason"].as_str().unwrap_or("stop").to_string();
    let usage = Usage {
        prompt_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: payload["usage"]["total_tokens"].as_u64().unwrap_or(0),
    };

    Ok(ChatCompletion { content, tool_calls, finish_reason, usage })
}

#[async_trait]
impl ChatCompletionProvider for OpenAiCompatibleProvider {
    async fn complete(
        &self,
        messages: &[AgentMessage],
        tools: &[ToolDefinition],
        tool_choice: ToolChoice,
    ) -> Result<ChatCompletion, ToolError> {
        let body = self.request_body(messages, tools, tool_choice);

        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match self.post_once(&body).await {
                Ok(payload) => {
                    debug!(event_name = "llm.completion_received", attempt, "completion received");
                    return parse_completion(&payload);
                }
                Err(error) => {
                    warn!(
                        event_name = "llm.completion_retry",
                        attempt,
                        error = %error,
                        "chat completion attempt failed"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ToolError::Provider("chat completion failed".to_string())))
    }
}
