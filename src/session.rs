//! Session persistence for multi-turn memory.
//!
//! When memory is on, the conversation carried between queries can be
//! saved with `/save` and picked up again with `--resume <id>`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::conversation::check_tool_references;
use crate::types::Message;

/// Persistent session data saved to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub id: String,
    pub created_at: String,
    /// MCP server the tool results came from
    #[serde(default)]
    pub server_url: String,
    pub messages: Vec<Message>,
}

impl SessionData {
    pub fn new(server_url: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: generate_session_id(),
            created_at: now_timestamp(),
            server_url: server_url.into(),
            messages,
        }
    }
}

pub fn sessions_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".mcpquery").join("sessions"))
}

pub fn save_session(dir: &Path, data: &SessionData) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create sessions directory: {}", dir.display()))?;
    let path = dir.join(format!("{}.json", data.id));
    let json = serde_json::to_string_pretty(data)?;
    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write session: {}", path.display()))?;
    Ok(path)
}

/// Load a saved session; its history must still satisfy the tool-call
/// back-reference rule.
pub fn load_session(dir: &Path, id: &str) -> Result<SessionData> {
    if !is_session_id(id) {
        bail!("Invalid session id '{}': expected 8 hex characters", id);
    }
    let path = dir.join(format!("{}.json", id));
    let content =
        std::fs::read_to_string(&path).with_context(|| format!("Session '{}' not found", id))?;
    let data: SessionData = serde_json::from_str(&content)
        .with_context(|| format!("Session '{}' is corrupt", id))?;
    check_tool_references(&data.messages)
        .with_context(|| format!("Session '{}' has an inconsistent history", id))?;
    Ok(data)
}

/// All readable sessions, newest first.
pub fn list_sessions(dir: &Path) -> Result<Vec<SessionData>> {
    let mut sessions = Vec::new();
    if !dir.exists() {
        return Ok(sessions);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |ext| ext == "json") {
            if let Ok(content) = std::fs::read_to_string(&path) {
                if let Ok(data) = serde_json::from_str::<SessionData>(&content) {
                    sessions.push(data);
                }
            }
        }
    }
    sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(sessions)
}

pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}

/// Ids are the first 8 characters of a v4 uuid.
fn is_session_id(id: &str) -> bool {
    id.len() == 8 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
