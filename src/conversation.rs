//! Append-only conversation log for one query.
//!
//! The log is the single source of truth for what has been said and done;
//! its order is the order the LLM sees. Every tool result must point at a
//! tool call issued by an earlier assistant turn, and `append` enforces it.

use std::collections::HashSet;

use crate::error::ConversationError;
use crate::types::{Message, Role};

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    /// Ids of every tool call issued so far
    issued_calls: HashSet<String>,
}

impl Conversation {
    /// Start a fresh conversation seeded with the user's query.
    pub fn new(query: impl Into<String>) -> Self {
        let mut conversation = Self::default();
        conversation.messages.push(Message::user(query));
        conversation
    }

    /// Continue from an earlier history, then add the new query.
    ///
    /// The history is replayed through `append`, so a history that breaks
    /// the back-reference rule is rejected.
    pub fn resume(
        history: impl IntoIterator<Item = Message>,
        query: impl Into<String>,
    ) -> Result<Self, ConversationError> {
        let mut conversation = Self::default();
        for message in history {
            conversation.append(message)?;
        }
        conversation.append(Message::user(query))?;
        Ok(conversation)
    }

    pub fn append(&mut self, message: Message) -> Result<(), ConversationError> {
        match message.role {
            Role::Tool => {
                let id = message
                    .tool_call_id
                    .as_deref()
                    .ok_or(ConversationError::MissingToolCallId)?;
                if !self.issued_calls.contains(id) {
                    return Err(ConversationError::UnknownToolCallId(id.to_string()));
                }
            }
            Role::Assistant => {
                self.issued_calls
                    .extend(message.tool_calls.iter().map(|c| c.id.clone()));
            }
            Role::User => {}
        }
        if message.role != Role::Assistant && !message.tool_calls.is_empty() {
            return Err(ConversationError::UnexpectedToolCalls);
        }

        self.messages.push(message);
        Ok(())
    }

    /// Copy of the log, in order, for sending to the LLM.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

/// Check the back-reference rule over an arbitrary message sequence.
pub fn check_tool_references(messages: &[Message]) -> Result<(), ConversationError> {
    let mut conversation = Conversation::default();
    for message in messages {
        conversation.append(message.clone())?;
    }
    Ok(())
}
