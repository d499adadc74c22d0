//! Anthropic (Claude) LLM provider implementation.
//!
//! This module implements the `LlmProvider` trait for the Anthropic
//! Messages API (`POST {api_base}/v1/messages`).
//!
//! Differences from the OpenAI format:
//! - the system prompt is a top-level field, not a message
//! - tool definitions use `input_schema` instead of `parameters`
//! - tool results are `tool_result` blocks inside a user message; all the
//!   results answering one assistant turn go in the same user message
//! - the response is a list of content blocks (text or tool_use)

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::LlmProvider;
use crate::types::{ChatRequest, ChatResponse, Role, TokenUsage, ToolCall};

/// Anthropic API client.
pub struct AnthropicProvider {
    api_key: String,
    api_base: String,
    client: reqwest::Client,
}

// --- API Request Types ---

#[derive(Serialize)]
pub(crate) struct ApiRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: ApiContent,
}

/// Content can be a simple string or an array of content blocks.
#[derive(Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    /// Block kinds we do not consume (e.g. thinking)
    #[serde(other)]
    Other,
}

#[derive(Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

/// Append a `tool_result` block, joining the user message that already
/// carries this turn's results.
fn push_tool_result(api_messages: &mut Vec<ApiMessage>, block: ContentBlock) {
    match api_messages.last_mut() {
        Some(ApiMessage {
            role: "user",
            content: ApiContent::Blocks(blocks),
        }) => blocks.push(block),
        _ => api_messages.push(ApiMessage {
            role: "user",
            content: ApiContent::Blocks(vec![block]),
        }),
    }
}

fn skipped_result(tool_use_id: String) -> ContentBlock {
    ContentBlock::ToolResult {
        tool_use_id,
        content: super::SKIPPED_CALL_RESULT.to_string(),
        is_error: true,
    }
}

// --- API Response Types ---

#[derive(Deserialize, Debug)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    #[allow(dead_code)]
    stop_reason: Option<String>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize, Debug)]
struct ApiUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

// --- Implementation ---

impl AnthropicProvider {
    pub fn new(api_key: String, api_base: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            api_key,
            api_base: api_base.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            client: super::http_client(timeout)?,
        })
    }

    /// Convert our internal messages to Anthropic API format.
    pub(crate) fn build_api_request(&self, request: &ChatRequest) -> ApiRequest {
        let mut api_messages: Vec<ApiMessage> = Vec::new();
        let mut gaps = super::unanswered_tool_calls(&request.messages);

        for (i, msg) in request.messages.iter().enumerate() {
            if let Some(ids) = gaps.remove(&i) {
                for id in ids {
                    push_tool_result(&mut api_messages, skipped_result(id));
                }
            }
            match msg.role {
                Role::User => {
                    api_messages.push(ApiMessage {
                        role: "user",
                        content: ApiContent::Text(msg.content.clone()),
                    });
                }
                Role::Assistant => {
                    if msg.tool_calls.is_empty() {
                        api_messages.push(ApiMessage {
                            role: "assistant",
                            content: ApiContent::Text(msg.content.clone()),
                        });
                    } else {
                        let mut blocks = Vec::new();
                        if !msg.content.is_empty() {
                            blocks.push(ContentBlock::Text {
                                text: msg.content.clone(),
                            });
                        }
                        for tc in &msg.tool_calls {
                            // Calls with unparsable arguments were skipped by the
                            // agent; an empty input keeps the transcript valid.
                            let input = serde_json::from_str(&tc.arguments)
                                .unwrap_or_else(|_| serde_json::json!({}));
                            blocks.push(ContentBlock::ToolUse {
                                id: tc.id.clone(),
                                name: tc.name.clone(),
                                input,
                            });
                        }
                        api_messages.push(ApiMessage {
                            role: "assistant",
                            content: ApiContent::Blocks(blocks),
                        });
                    }
                }
                Role::Tool => {
                    let block = ContentBlock::ToolResult {
                        tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                        content: msg.content.clone(),
                        is_error: false,
                    };
                    push_tool_result(&mut api_messages, block);
                }
            }
        }
        if let Some(ids) = gaps.remove(&request.messages.len()) {
            for id in ids {
                push_tool_result(&mut api_messages, skipped_result(id));
            }
        }

        let tools: Vec<ApiTool> = request
            .tools
            .iter()
            .map(|t| ApiTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect();

        ApiRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            system: request.system.clone(),
            messages: api_messages,
            tools,
        }
    }

    /// Parse the API response into our internal ChatResponse.
    fn parse_response(&self, api_response: ApiResponse) -> ChatResponse {
        let mut content = String::new();
        let mut tool_calls = Vec::new();

        for block in api_response.content {
            match block {
                ContentBlock::Text { text } => {
                    content.push_str(&text);
                }
                ContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: input.to_string(),
                    });
                }
                ContentBlock::ToolResult { .. } => {
                    warn!("unexpected tool_result block in response");
                }
                ContentBlock::Other => {}
            }
        }

        let usage = api_response.usage.map(|u| TokenUsage {
            input_tokens: u.input_tokens.unwrap_or(0),
            output_tokens: u.output_tokens.unwrap_or(0),
        });

        ChatResponse {
            content,
            tool_calls,
            usage,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let api_request = self.build_api_request(request);

        let url = format!("{}/v1/messages", self.api_base.trim_end_matches('/'));
        debug!(%url, messages = api_request.messages.len(), "sending messages request");
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .context("Failed to send request to Anthropic API")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic API error ({}): {}", status, error_body);
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .context("Failed to parse Anthropic API response")?;

        Ok(self.parse_response(api_response))
    }

    fn name(&self) -> &str {
        "Anthropic"
    }
}
