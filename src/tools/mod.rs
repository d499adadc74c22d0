//! Tool System module.
//!
//! This module defines the `ToolInvoker` trait and the `ToolRegistry`
//! that together describe what the LLM may call and how calls reach the
//! tool server.
//!
//! Key concepts:
//! - **ToolInvoker**: the capability to run a named tool with a JSON object
//!   of arguments. The agent only knows this trait; the MCP client is the
//!   production implementation.
//! - **ToolRegistry**: the descriptors discovered at startup, indexed by
//!   name, with each tool's input schema compiled once so that arguments
//!   can be checked before anything goes over the wire.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{ArgumentError, InvokeError};
use crate::types::{ToolDescriptor, ToolOutput};

/// Something that can execute tools by name.
///
/// Implementations must be safe to call repeatedly; the agent assumes no
/// state is carried between calls.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ToolOutput, InvokeError>;
}

#[async_trait]
impl<T: ToolInvoker + ?Sized> ToolInvoker for Arc<T> {
    async fn invoke(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ToolOutput, InvokeError> {
        (**self).invoke(name, arguments).await
    }
}

/// Immutable set of tools available for one session.
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
    /// Compiled input schemas; tools whose schema did not compile are
    /// only checked for being a JSON object
    validators: HashMap<String, JSONSchema>,
}

impl ToolRegistry {
    /// Build the registry from discovered descriptors.
    ///
    /// Later duplicates of a name are dropped.
    pub fn new(descriptors: Vec<ToolDescriptor>) -> Self {
        let mut tools = Vec::with_capacity(descriptors.len());
        let mut index = HashMap::new();
        let mut validators = HashMap::new();

        for descriptor in descriptors {
            if index.contains_key(&descriptor.name) {
                warn!(tool = %descriptor.name, "duplicate tool name, keeping the first");
                continue;
            }
            match JSONSchema::compile(&descriptor.input_schema) {
                Ok(schema) => {
                    validators.insert(descriptor.name.clone(), schema);
                }
                Err(e) => {
                    warn!(tool = %descriptor.name, error = %e, "input schema does not compile");
                }
            }
            index.insert(descriptor.name.clone(), tools.len());
            tools.push(descriptor);
        }

        Self {
            tools,
            index,
            validators,
        }
    }

    /// All descriptors, in discovery order (for sending to the LLM).
    pub fn list(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Parse a tool call's raw arguments and check them against the tool's
    /// input schema.
    pub fn validate(&self, name: &str, raw_arguments: &str) -> Result<Map<String, Value>, ArgumentError> {
        if !self.index.contains_key(name) {
            return Err(ArgumentError::UnknownTool(name.to_string()));
        }

        // Some models send an empty string for tools without parameters.
        let raw = if raw_arguments.trim().is_empty() {
            "{}"
        } else {
            raw_arguments
        };
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ArgumentError::Malformed(e.to_string()))?;

        if let Some(schema) = self.validators.get(name) {
            if let Err(errors) = schema.validate(&value) {
                let reasons: Vec<String> = errors.map(|e| e.to_string()).collect();
                return Err(ArgumentError::SchemaViolation(reasons));
            }
        }

        match value {
            Value::Object(map) => Ok(map),
            other => Err(ArgumentError::NotAnObject(json_kind(&other))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
