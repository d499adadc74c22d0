//! MCP client for the remote tool server.
//!
//! Performs the `initialize` handshake, discovers tools with `tools/list`
//! and runs them with `tools/call`. Implements [`ToolInvoker`] so the agent
//! can use it without knowing about MCP.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::{
    parse_sse_messages, CallToolResult, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    SseBuffer, PROTOCOL_VERSION, SESSION_HEADER,
};
use crate::config::ServerConfig;
use crate::error::InvokeError;
use crate::tools::ToolInvoker;
use crate::types::{ToolDescriptor, ToolOutput};

/// A connected MCP session over streamable HTTP.
pub struct McpClient {
    endpoint: String,
    http: reqwest::Client,
    /// Assigned by the server during `initialize`, sent on every later request
    session_id: Option<String>,
    server_name: Option<String>,
    next_id: AtomicU64,
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl McpClient {
    /// Connect to the server and complete the MCP handshake.
    ///
    /// The whole handshake is bounded by the configured connect timeout.
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let timeout = config.connect_timeout();
        tokio::time::timeout(timeout, Self::handshake(config))
            .await
            .map_err(|_| anyhow!("Timed out after {:?} connecting to {}", timeout, config.url))?
    }

    async fn handshake(config: &ServerConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = config.auth_token() {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|_| anyhow!("Invalid bearer token for MCP server"))?,
            );
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;

        let mut client = Self {
            endpoint: config.url.clone(),
            http,
            session_id: None,
            server_name: None,
            next_id: AtomicU64::new(1),
            connect_timeout: config.connect_timeout(),
            call_timeout: config.call_timeout(),
        };

        let request = client.new_request(
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION")
                }
            })),
        );
        let response = client
            .post(&request)
            .await
            .with_context(|| format!("connect failed: {}", config.url))?;
        client.session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let init = read_response(response, request.id)
            .await
            .context("Invalid initialize response")?;
        if let Some(error) = init.error {
            bail!("initialize failed: {} (code {})", error.message, error.code);
        }
        let result = init.result.unwrap_or(Value::Null);
        client.server_name = result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .map(str::to_string);
        debug!(
            protocol = ?result.get("protocolVersion"),
            session = ?client.session_id,
            "MCP initialize complete"
        );

        client
            .post(&JsonRpcRequest::notification("notifications/initialized"))
            .await
            .context("Failed to send initialized notification")?;

        info!(
            url = %client.endpoint,
            server = client.server_name.as_deref().unwrap_or("unknown"),
            "connected to MCP server"
        );
        Ok(client)
    }

    /// Server name reported during the handshake.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Discover every tool the server exposes, following pagination.
    ///
    /// Discovery is part of connecting, so it shares the connect timeout.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        tokio::time::timeout(self.connect_timeout, self.fetch_tool_pages())
            .await
            .map_err(|_| {
                anyhow!(
                    "Timed out after {:?} listing tools from {}",
                    self.connect_timeout,
                    self.endpoint
                )
            })?
    }

    async fn fetch_tool_pages(&self) -> Result<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self
                .request("tools/list", params)
                .await
                .context("tools/list failed")?;
            let page: ListToolsResult =
                serde_json::from_value(result).context("Malformed tools/list result")?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if seen.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    warn!(cursor = %next, "tools/list cursor repeats, stopping pagination");
                    break;
                }
                None => break,
            }
        }

        info!(count = tools.len(), "loaded tools from MCP server");
        Ok(tools)
    }

    /// End the session. Servers that do not support explicit termination
    /// answer 405, which is fine.
    pub async fn close(&self) {
        let Some(session_id) = &self.session_id else {
            return;
        };
        let result = self
            .http
            .delete(&self.endpoint)
            .header(SESSION_HEADER, session_id)
            .send()
            .await;
        match result {
            Ok(resp) => debug!(status = %resp.status(), "MCP session closed"),
            Err(e) => warn!(error = %e, "failed to close MCP session"),
        }
    }

    fn new_request(&self, method: &str, params: Option<Value>) -> JsonRpcRequest {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        JsonRpcRequest::new(id, method, params)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, InvokeError> {
        let request = self.new_request(method, params);
        debug!(method, id = ?request.id, "sending MCP request");

        let response = self
            .post(&request)
            .await
            .map_err(|e| InvokeError::Transport(format!("{e:#}")))?;
        let rpc = read_response(response, request.id)
            .await
            .map_err(|e| InvokeError::Transport(format!("{e:#}")))?;

        if let Some(error) = rpc.error {
            return Err(InvokeError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(rpc.result.unwrap_or(Value::Null))
    }

    async fn post(&self, message: &JsonRpcRequest) -> Result<reqwest::Response> {
        let mut builder = self
            .http
            .post(&self.endpoint)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(session_id) = &self.session_id {
            builder = builder.header(SESSION_HEADER, session_id);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("HTTP error {}: {}", status, body);
        }
        Ok(response)
    }
}

/// Read the JSON-RPC response to request `id` from either a JSON body or an
/// SSE stream. The stream is read only until the matching message shows up.
async fn read_response(response: reqwest::Response, id: Option<u64>) -> Result<JsonRpcResponse> {
    let is_sse = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |ct| ct.starts_with("text/event-stream"));

    if !is_sse {
        let response: JsonRpcResponse = response
            .json()
            .await
            .context("Failed to parse MCP response")?;
        return Ok(response);
    }

    let mut stream = response.bytes_stream();
    let mut buffer = SseBuffer::default();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("MCP stream read error")?;
        for event in buffer.push(&chunk) {
            if let Some(found) = match_response(parse_sse_messages(&event), id) {
                return Ok(found);
            }
        }
    }

    match_response(parse_sse_messages(&buffer.finish()), id)
        .with_context(|| format!("MCP stream ended without a response to request {:?}", id))
}

fn match_response(messages: Vec<Value>, id: Option<u64>) -> Option<JsonRpcResponse> {
    messages
        .into_iter()
        .filter(|m| m.get("id").and_then(Value::as_u64) == id)
        .find_map(|m| serde_json::from_value(m).ok())
}

#[async_trait]
impl ToolInvoker for McpClient {
    async fn invoke(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ToolOutput, InvokeError> {
        let params = json!({ "name": name, "arguments": arguments });
        let result = tokio::time::timeout(self.call_timeout, self.request("tools/call", Some(params)))
            .await
            .map_err(|_| InvokeError::Timeout(self.call_timeout))??;

        let result: CallToolResult = serde_json::from_value(result)
            .map_err(|e| InvokeError::Transport(format!("malformed tools/call result: {e}")))?;
        if result.is_error {
            return Err(InvokeError::Tool(result.error_text()));
        }
        Ok(ToolOutput {
            content: result.content,
        })
    }
}
