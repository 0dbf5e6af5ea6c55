//! Conversation messages exchanged with agents
//!
//! A conversation strictly alternates between [`Role::User`] and
//! [`Role::Assistant`]. Tool calls live inside assistant messages and tool
//! results inside user messages, so alternation holds across tool loops.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One block of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        tool_name: Option<String>,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    /// Number of characters this block contributes to the context
    pub fn char_len(&self) -> usize {
        match self {
            Self::Text { text } => text.chars().count(),
            Self::ToolUse { id, name, input } => {
                id.chars().count() + name.chars().count() + input.to_string().chars().count()
            }
            Self::ToolResult {
                tool_use_id, output, ..
            } => tool_use_id.chars().count() + output.chars().count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::Text { text: text.into() }])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::Text { text: text.into() }])
    }

    /// All text blocks joined with newlines
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn char_len(&self) -> usize {
        self.content.iter().map(ContentBlock::char_len).sum()
    }
}
