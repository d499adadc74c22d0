//! mcpquery: answer natural-language queries with an LLM that calls tools
//! on a remote MCP server.
//!
//! The [`agent::Agent`] runs the tool-augmented loop; [`llm`] and
//! [`mcp`] provide the completion API and the tool server behind the
//! [`llm::LlmProvider`] and [`tools::ToolInvoker`] traits.

pub mod agent;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod session;
pub mod tools;
pub mod types;
