//! Error types shared by the agent loop, the conversation log and the
//! tool invoker.
//!
//! Plumbing code (config, providers, the MCP transport) reports failures
//! with `anyhow`; the enums here are the ones callers match on.

use std::time::Duration;

use thiserror::Error;

/// Fatal failures of a single query.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("LLM call failed: {0:#}")]
    Completion(anyhow::Error),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Conversation invariant violated: {0}")]
    Conversation(#[from] ConversationError),
}

impl QueryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }
}

/// Rejected appends to a [`crate::conversation::Conversation`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversationError {
    #[error("tool result references unknown tool call id '{0}'")]
    UnknownToolCallId(String),

    #[error("tool result message has no tool call id")]
    MissingToolCallId,

    #[error("only assistant messages may carry tool calls")]
    UnexpectedToolCalls,
}

/// Failure of one tool invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvokeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("tool reported an error: {0}")]
    Tool(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Why a tool call's arguments were not accepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("arguments are not valid JSON: {0}")]
    Malformed(String),

    #[error("arguments must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("arguments do not match the input schema: {}", .0.join("; "))]
    SchemaViolation(Vec<String>),
}
