//! OpenAI-compatible provider adapter.
//!
//! Speaks the chat-completions dialect against a configurable base URL, so
//! the same adapter covers OpenAI, OpenRouter, and self-hosted gateways.
//! Tool-call arguments arrive string-encoded on this wire; the adapter
//! decodes them into JSON maps before they reach the core and re-encodes
//! them on the way out.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::{Result, YoctoError};
use crate::session::{Message, Role};

use super::{ChatOptions, LLMProvider, LLMResponse, LLMToolCall, ToolDefinition, Usage};

/// HTTP timeout for one chat completion request.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// An `LLMProvider` for OpenAI-compatible chat-completions endpoints.
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    api_base: String,
    default_model: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// JSON-encoded argument object, per the chat-completions dialect.
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl OpenAiProvider {
    /// Create a provider from configuration.
    pub fn new(cfg: &ProviderConfig) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: cfg.api_key.clone(),
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            default_model: cfg.model.clone(),
        }
    }

    fn convert_messages(messages: Vec<Message>) -> Vec<WireMessage> {
        messages
            .into_iter()
            .map(|msg| {
                let tool_calls = msg.tool_calls.as_ref().map(|calls| {
                    calls
                        .iter()
                        .map(|tc| WireToolCall {
                            id: tc.id.clone(),
                            call_type: "function".to_string(),
                            function: WireFunctionCall {
                                name: tc.name.clone(),
                                arguments: tc.arguments.clone(),
                            },
                        })
                        .collect()
                });
                let role = match msg.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                WireMessage {
                    role: role.to_string(),
                    // Assistant tool-call messages may legitimately have no
                    // text; the wire wants content omitted, not empty.
                    content: if msg.content.is_empty() && msg.tool_calls.is_some() {
                        None
                    } else {
                        Some(msg.content)
                    },
                    tool_calls,
                    tool_call_id: msg.tool_call_id,
                }
            })
            .collect()
    }

    fn convert_tools(tools: Vec<ToolDefinition>) -> Option<Vec<WireTool>> {
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .into_iter()
                .map(|t| WireTool {
                    tool_type: "function".to_string(),
                    function: WireFunctionDef {
                        name: t.name,
                        description: t.description,
                        parameters: t.parameters,
                    },
                })
                .collect(),
        )
    }

    fn parse_tool_calls(calls: Vec<WireToolCall>) -> Vec<LLMToolCall> {
        calls
            .into_iter()
            .map(|tc| {
                let arguments = match serde_json::from_str::<Value>(&tc.function.arguments) {
                    Ok(v) if v.is_object() => v,
                    Ok(other) => {
                        warn!(tool = %tc.function.name, "tool arguments are not an object");
                        serde_json::json!({ "value": other })
                    }
                    Err(e) => {
                        warn!(tool = %tc.function.name, error = %e, "invalid JSON in tool arguments");
                        serde_json::json!({})
                    }
                };
                LLMToolCall::new(&tc.id, &tc.function.name, arguments)
            })
            .collect()
    }
}

#[async_trait]
impl LLMProvider for OpenAiProvider {
    async fn chat(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        model: Option<&str>,
        options: ChatOptions,
    ) -> Result<LLMResponse> {
        let request = ChatRequest {
            model: model.unwrap_or(&self.default_model).to_string(),
            messages: Self::convert_messages(messages),
            tools: Self::convert_tools(tools),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            "sending chat completion request"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(YoctoError::Provider(format!(
                "{} returned {}: {}",
                self.api_base, status, body
            )));
        }

        let parsed: ChatResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| YoctoError::Provider("response contained no choices".to_string()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .map(Self::parse_tool_calls)
            .unwrap_or_default();

        Ok(LLMResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            finish_reason: choice.finish_reason,
            usage: parsed
                .usage
                .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens)),
        })
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ToolCall;
    use serde_json::json;

    #[test]
    fn test_convert_messages_roles() {
        let messages = vec![
            Message::system("sys"),
            Message::user("hi"),
            Message::assistant("hello"),
            Message::tool_result("c1", "ok"),
        ];
        let wire = OpenAiProvider::convert_messages(messages);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
        assert_eq!(wire[2].role, "assistant");
        assert_eq!(wire[3].role, "tool");
        assert_eq!(wire[3].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_convert_messages_tool_calls_pass_arguments_string() {
        let msg = Message::assistant_with_tools(
            "",
            vec![ToolCall::new("c1", "read_file", r#"{"path":"/x"}"#)],
        );
        let wire = OpenAiProvider::convert_messages(vec![msg]);
        assert!(wire[0].content.is_none());
        let calls = wire[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, r#"{"path":"/x"}"#);
        assert_eq!(calls[0].call_type, "function");
    }

    #[test]
    fn test_convert_messages_empty_content_without_tools_kept() {
        let wire = OpenAiProvider::convert_messages(vec![Message::user("")]);
        assert_eq!(wire[0].content.as_deref(), Some(""));
    }

    #[test]
    fn test_convert_tools_empty_is_none() {
        assert!(OpenAiProvider::convert_tools(vec![]).is_none());
        let tools = vec![ToolDefinition::new("echo", "d", json!({"type":"object"}))];
        let wire = OpenAiProvider::convert_tools(tools).unwrap();
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].function.name, "echo");
    }

    #[test]
    fn test_parse_tool_calls_decodes_arguments() {
        let calls = vec![WireToolCall {
            id: "c1".to_string(),
            call_type: "function".to_string(),
            function: WireFunctionCall {
                name: "read_file".to_string(),
                arguments: r#"{"path":"/x"}"#.to_string(),
            },
        }];
        let parsed = OpenAiProvider::parse_tool_calls(calls);
        assert_eq!(parsed[0].arguments, json!({"path": "/x"}));
    }

    #[test]
    fn test_parse_tool_calls_invalid_json_becomes_empty_object() {
        let calls = vec![WireToolCall {
            id: "c1".to_string(),
            call_type: "function".to_string(),
            function: WireFunctionCall {
                name: "bad".to_string(),
                arguments: "{not json".to_string(),
            },
        }];
        let parsed = OpenAiProvider::parse_tool_calls(calls);
        assert_eq!(parsed[0].arguments, json!({}));
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "c1",
                        "type": "function",
                        "function": {"name": "search", "arguments": "{\"q\":\"rust\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices.len(), 1);
        assert_eq!(
            parsed.choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
        assert_eq!(parsed.usage.as_ref().unwrap().prompt_tokens, 10);
    }

    #[test]
    fn test_provider_construction() {
        let cfg = ProviderConfig {
            api_key: "sk-test".to_string(),
            api_base: "https://example.com/v1/".to_string(),
            model: "test-model".to_string(),
        };
        let provider = OpenAiProvider::new(&cfg);
        assert_eq!(provider.default_model(), "test-model");
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.api_base, "https://example.com/v1");
    }
}
