//! Provider-agnostic chat types and the Ollama-backed LLM client.
//!
//! These types decouple the agent loop from any specific LLM API: the
//! orchestrator works against [`LlmProvider`], and tests substitute scripted
//! providers. [`OllamaChat`] talks to an Ollama-compatible `/api/chat`
//! endpoint with function-calling tools.
//!
//! Retry policy: up to 3 attempts with delays of 1s then 2s (doubling,
//! capped at 10s), retried on connection and timeout errors only. An HTTP
//! error status is not retried here; the orchestrator decides how to
//! degrade.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{classify_http_error, Error, Result};

/// Total attempts per chat call.
const LLM_ATTEMPTS: u32 = 3;
const LLM_RETRY_INITIAL: Duration = Duration::from_secs(1);
const LLM_RETRY_CAP: Duration = Duration::from_secs(10);

/// Role of a chat message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Tool calls requested by the assistant (assistant messages only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

/// A tool the model may call, described with a JSON Schema parameter
/// object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

/// A chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// What the model produced: a final answer, tool calls, or both.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

pub fn system_message(content: &str) -> ChatMessage {
    ChatMessage {
        role: Role::System,
        content: content.to_string(),
        tool_calls: Vec::new(),
    }
}

pub fn user_message(content: &str) -> ChatMessage {
    ChatMessage {
        role: Role::User,
        content: content.to_string(),
        tool_calls: Vec::new(),
    }
}

pub fn assistant_message(content: &str, tool_calls: Vec<ToolCall>) -> ChatMessage {
    ChatMessage {
        role: Role::Assistant,
        content: content.to_string(),
        tool_calls,
    }
}

pub fn tool_message(content: &str) -> ChatMessage {
    ChatMessage {
        role: Role::Tool,
        content: content.to_string(),
        tool_calls: Vec::new(),
    }
}

/// LLM backends the agent can drive.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome>;

    /// Probe service and model presence. Never fails; reports false instead.
    async fn check_available(&self) -> bool;
}

/// Client for an Ollama-compatible `/api/chat` endpoint.
pub struct OllamaChat {
    client: reqwest::Client,
    host: String,
    model: String,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            host: config.host.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    fn build_body(&self, request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                let mut msg = serde_json::json!({
                    "role": m.role,
                    "content": m.content,
                });
                if !m.tool_calls.is_empty() {
                    msg["tool_calls"] = serde_json::Value::Array(
                        m.tool_calls
                            .iter()
                            .map(|tc| {
                                let arguments: serde_json::Value =
                                    serde_json::from_str(&tc.arguments)
                                        .unwrap_or(serde_json::Value::Null);
                                serde_json::json!({
                                    "function": {
                                        "name": tc.name,
                                        "arguments": arguments,
                                    }
                                })
                            })
                            .collect(),
                    );
                }
                msg
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });

        if !request.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }

        body
    }
}

#[async_trait]
impl LlmProvider for OllamaChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome> {
        let body = self.build_body(request);
        let mut last_err = None;
        let mut delay = LLM_RETRY_INITIAL;

        for attempt in 0..LLM_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(LLM_RETRY_CAP);
            }

            let resp = self
                .client
                .post(format!("{}/api/chat", self.host))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| Error::Llm(format!("invalid response: {e}")))?;
                        return parse_chat_response(&json);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(Error::Llm(format!("llm error {status}: {body_text}")));
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    last_err = Some(classify_http_error(&e, "llm"));
                    continue;
                }
                Err(e) => return Err(classify_http_error(&e, "llm")),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Llm("llm call failed after retries".to_string())))
    }

    async fn check_available(&self) -> bool {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.host))
            .send()
            .await;

        let Ok(response) = resp else { return false };
        if !response.status().is_success() {
            return false;
        }
        let Ok(json) = response.json::<serde_json::Value>().await else {
            return false;
        };
        json.get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models.iter().any(|m| {
                    m.get("name")
                        .and_then(|n| n.as_str())
                        .map(|n| n == self.model || n.trim_end_matches(":latest") == self.model)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }
}

/// Extract content and tool calls from an `/api/chat` response.
fn parse_chat_response(json: &serde_json::Value) -> Result<ChatOutcome> {
    let message = json
        .get("message")
        .ok_or_else(|| Error::Llm("response missing message".to_string()))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|t| t.as_array())
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(i, call)| {
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let arguments = function
                        .get("arguments")
                        .map(|a| {
                            if a.is_string() {
                                a.as_str().unwrap_or_default().to_string()
                            } else {
                                a.to_string()
                            }
                        })
                        .unwrap_or_else(|| "{}".to_string());
                    Some(ToolCall {
                        id: format!("call_{i}"),
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatOutcome {
        content,
        tool_calls,
    })
}
