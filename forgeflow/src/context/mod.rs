//! Context window management
//!
//! Two layers keep the conversation handed to an agent bounded:
//!
//! 1. [`truncation`]: each tool output is cut according to the kind of tool
//!    that produced it.
//! 2. [`compaction`]: once the whole history crosses a token threshold, the
//!    middle of the conversation is replaced by a short summary.
//!
//! Both layers are pure functions over messages.

pub mod compaction;
pub mod tokens;
pub mod truncation;

pub use compaction::{compact_history, ContextCompactionResult};
pub use tokens::estimate_tokens;
pub use truncation::{truncate_tool_output, ToolClass, TruncationResult};

use forgeflow_sdk::{ContentBlock, Message};
use tracing::debug;

use crate::config::{CompactionConfig, ContextConfig, TruncationLimits};

#[derive(Debug, Clone, Default)]
pub struct ContextWindowManager {
    limits: TruncationLimits,
    compaction: CompactionConfig,
}

impl ContextWindowManager {
    pub fn new(config: &ContextConfig) -> Self {
        Self {
            limits: config.truncation.clone(),
            compaction: config.compaction.clone(),
        }
    }

    pub fn truncate_tool_output(&self, tool_name: &str, raw: &str) -> TruncationResult {
        let result = truncate_tool_output(tool_name, raw, &self.limits);
        if result.was_truncated {
            debug!(
                tool = tool_name,
                original = result.original_length,
                truncated = result.truncated_length,
                "Truncated tool output"
            );
        }
        result
    }

    /// Truncate every tool result in place. Results without a tool name use the generic cap.
    pub fn truncate_messages(&self, messages: &mut [Message]) {
        for block in messages.iter_mut().flat_map(|message| message.content.iter_mut()) {
            if let ContentBlock::ToolResult {
                tool_name, output, ..
            } = block
            {
                let name = tool_name.as_deref().unwrap_or("");
                let result = self.truncate_tool_output(name, output);
                if result.was_truncated {
                    *output = result.output;
                }
            }
        }
    }

    /// Compact when the estimate exceeds the threshold, `None` otherwise
    pub fn compact_if_needed(&self, messages: &[Message]) -> Option<ContextCompactionResult> {
        let estimated = estimate_tokens(messages);
        if estimated <= self.compaction.threshold_tokens {
            return None;
        }

        let result = compact_history(messages, self.compaction.preserve_turns);
        debug!(
            estimated_tokens = estimated,
            threshold = self.compaction.threshold_tokens,
            turn_pairs_removed = result.turn_pairs_removed,
            "Compacted conversation history"
        );
        Some(result)
    }

    /// Both layers, in order: the history an agent call should see
    pub fn prepare(&self, messages: &[Message]) -> Vec<Message> {
        let mut messages = messages.to_vec();
        self.truncate_messages(&mut messages);
        match self.compact_if_needed(&messages) {
            Some(result) => result.messages,
            None => messages,
        }
    }
}
