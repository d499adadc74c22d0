//! LLM Client module.
//!
//! This module defines the `LlmProvider` trait that abstracts over
//! different completion APIs, and provides concrete implementations.
//!
//! Each provider converts our [`ChatRequest`] into its own wire format and
//! turns the reply back into one assistant turn ([`ChatResponse`]): text,
//! an ordered list of tool calls, or both.

pub mod anthropic;
pub mod openai_compatible;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::config::AppConfig;
use crate::types::{ChatRequest, ChatResponse, Message, Role};

/// Result text sent for a tool call that has no tool message, so the
/// transcript stays acceptable to APIs that require every call answered.
pub(crate) const SKIPPED_CALL_RESULT: &str = "Tool call skipped: no result is available.";

/// Trait that all LLM providers must implement.
///
/// Swapping providers never changes the agent logic.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and get one full assistant turn.
    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Return the provider's display name (for logging).
    fn name(&self) -> &str;
}

/// Build an HTTP client that bounds every completion call.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

/// Tool calls left without a tool message, keyed by the message index
/// their placeholder results must be inserted before.
///
/// An assistant turn's calls are answered by the tool messages that
/// directly follow it; whatever is still open when the next user or
/// assistant message arrives (or the history ends) is reported there.
pub(crate) fn unanswered_tool_calls(messages: &[Message]) -> HashMap<usize, Vec<String>> {
    let mut gaps = HashMap::new();
    let mut open: Vec<String> = Vec::new();

    for (i, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::Tool => {
                if let Some(id) = &msg.tool_call_id {
                    open.retain(|call| call != id);
                }
            }
            Role::User | Role::Assistant => {
                if !open.is_empty() {
                    gaps.insert(i, std::mem::take(&mut open));
                }
                if msg.role == Role::Assistant {
                    open = msg.tool_calls.iter().map(|c| c.id.clone()).collect();
                }
            }
        }
    }
    if !open.is_empty() {
        gaps.insert(messages.len(), open);
    }
    gaps
}

/// Create the LLM provider based on config.
pub fn create_provider(config: &AppConfig) -> Result<Box<dyn LlmProvider>> {
    let api_key = config.api_key()?;
    let api_base = config.llm.api_base.clone();
    let timeout = config.llm_timeout();

    match config.llm.provider.as_str() {
        "anthropic" => Ok(Box::new(anthropic::AnthropicProvider::new(
            api_key, api_base, timeout,
        )?)),
        "openai_compatible" | "openai" => Ok(Box::new(
            openai_compatible::OpenAiCompatibleProvider::new(api_key, api_base, timeout)?,
        )),
        other => {
            bail!(
                "Unknown provider: '{}'. Supported: 'anthropic', 'openai_compatible'",
                other
            )
        }
    }
}
