//! MCP (Model Context Protocol) client.
//!
//! The tool server is reached over MCP's streamable HTTP transport: every
//! JSON-RPC message is POSTed to a single endpoint, and the server answers
//! either with a plain JSON body or with a short SSE stream carrying the
//! response.

pub mod client;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ToolDescriptor;

pub use client::McpClient;

/// Protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Header carrying the server-assigned session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// JSON-RPC request (or notification when `id` is `None`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params: None,
        }
    }
}

/// JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// `tools/list` result page.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// `tools/call` result.
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Text of all text chunks, used as the message when `is_error` is set.
    pub fn error_text(&self) -> String {
        let text: Vec<&str> = self
            .content
            .iter()
            .filter_map(|c| c.get("text").and_then(Value::as_str))
            .collect();
        if text.is_empty() {
            "tool returned isError without a message".to_string()
        } else {
            text.join("\n")
        }
    }
}

/// Pull the JSON-RPC messages out of an SSE body.
///
/// Events may span several `data:` lines, which are joined with `\n`
/// before parsing. Events that are not JSON are ignored.
pub fn parse_sse_messages(body: &str) -> Vec<Value> {
    let mut messages = Vec::new();
    let mut data = String::new();

    for line in body.lines().map(|l| l.trim_end_matches('\r')) {
        if line.is_empty() {
            flush_event(&mut data, &mut messages);
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    flush_event(&mut data, &mut messages);
    messages
}

/// Accumulates raw SSE bytes and hands out complete events.
///
/// Bytes are decoded only once an event is complete, so a multi-byte
/// character split across network chunks arrives intact.
#[derive(Debug, Default)]
pub struct SseBuffer {
    bytes: Vec<u8>,
}

impl SseBuffer {
    /// Add a chunk and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // CR only ever appears in line terminators; JSON escapes it in data.
        self.bytes.extend(chunk.iter().copied().filter(|&b| b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.bytes.windows(2).position(|w| w == b"\n\n") {
            let event: Vec<u8> = self.bytes.drain(..end + 2).collect();
            events.push(String::from_utf8_lossy(&event).into_owned());
        }
        events
    }

    /// Whatever is left once the stream ends.
    pub fn finish(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

fn flush_event(data: &mut String, out: &mut Vec<Value>) {
    if data.is_empty() {
        return;
    }
    if let Ok(value) = serde_json::from_str::<Value>(data) {
        out.push(value);
    }
    data.clear();
}
