//! Core data types used throughout mcpquery.
//!
//! This module defines the message types, tool call structures,
//! tool result content, and the request/response formats that flow
//! between the agent, the LLM providers and the tool invoker.

use serde::{Deserialize, Serialize};

// --- Message Roles ---

/// The role of a message in the conversation.
///
/// - `User`: the human's query
/// - `Assistant`: a turn produced by the LLM
/// - `Tool`: one chunk of a tool's result
///
/// The system prompt is not part of the conversation; it travels on
/// [`ChatRequest::system`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

// --- Tool Call ---

/// A tool call requested by the LLM.
///
/// The `id` is assigned by the completion API and must be echoed back on
/// every tool result message produced by this call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Opaque identifier, unique within one assistant turn
    pub id: String,
    /// Name of the tool to invoke (e.g. "get_alerts")
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them
    pub arguments: String,
}

// --- Tool Descriptor ---

/// Describes a remote tool's interface to the LLM.
///
/// Loaded once from the tool server's discovery call and read-only
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema describing the tool's input parameters
    #[serde(default = "empty_object_schema", rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

// --- Messages ---

/// A single turn in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    /// May be empty when an assistant turn only carries tool calls
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool result messages, links back to the tool call ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

// --- Tool Output ---

/// One content chunk of a tool result.
///
/// This is a closed set: a chunk whose `type` is not listed here fails to
/// decode instead of being carried along as an opaque value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: EmbeddedResource,
    },
    ResourceLink {
        uri: String,
        #[serde(default)]
        name: Option<String>,
    },
}

/// A resource embedded in a tool result; either text or base64 `blob`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddedResource {
    pub uri: String,
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

impl ToolContent {
    /// The text this chunk contributes to the conversation, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ToolContent::Text { text } => Some(text),
            ToolContent::Resource { resource } => resource.text.as_deref(),
            _ => None,
        }
    }

    /// Short name of the content kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolContent::Text { .. } => "text",
            ToolContent::Image { .. } => "image",
            ToolContent::Audio { .. } => "audio",
            ToolContent::Resource { .. } => "resource",
            ToolContent::ResourceLink { .. } => "resource_link",
        }
    }
}

/// The raw result of one successful tool invocation.
///
/// Chunks are kept undecoded so that the agent can skip a single bad
/// chunk without losing the rest of the result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub content: Vec<serde_json::Value>,
}

impl ToolOutput {
    /// Build an output made only of text chunks.
    pub fn text<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            content: chunks
                .into_iter()
                .map(|t| serde_json::json!({ "type": "text", "text": t.into() }))
                .collect(),
        }
    }

    /// Decode each chunk in order.
    pub fn chunks(&self) -> impl Iterator<Item = Result<ToolContent, serde_json::Error>> + '_ {
        self.content
            .iter()
            .map(|raw| ToolContent::deserialize(raw))
    }
}

// --- Chat Request / Response ---

/// A request to send to the LLM.
///
/// This is our internal representation; each provider converts it into
/// its own wire format.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    /// System prompt, sent outside the conversation
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
    pub max_tokens: u32,
}

/// Token counts reported by the API for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One assistant turn returned by the LLM.
///
/// Contains a text reply, tool calls, or both.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    /// May be empty if the turn only carries tool calls
    pub content: String,
    /// In the order the model issued them
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    /// Returns true if the LLM wants to call tools.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}
