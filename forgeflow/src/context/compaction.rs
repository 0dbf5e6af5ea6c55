//! Layer 2: whole-history compaction
//!
//! Keeps the first message (the task) with a synthesized summary appended,
//! keeps the most recent turn pairs, and drops everything in between.

use forgeflow_sdk::{ContentBlock, Message};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Test-result lines carried into a summary
const MAX_TEST_LINES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextCompactionResult {
    pub messages: Vec<Message>,
    pub turn_pairs_removed: usize,
    /// Empty when nothing was removed
    pub summary: String,
}

impl ContextCompactionResult {
    fn unchanged(messages: &[Message]) -> Self {
        Self {
            messages: messages.to_vec(),
            turn_pairs_removed: 0,
            summary: String::new(),
        }
    }
}

/// Compact `messages`, keeping the most recent `preserve_turns` pairs verbatim.
/// At least one pair is always kept.
pub fn compact_history(messages: &[Message], preserve_turns: usize) -> ContextCompactionResult {
    let keep = preserve_turns.max(1).saturating_mul(2);
    if messages.len() <= keep.saturating_add(1) {
        return ContextCompactionResult::unchanged(messages);
    }

    // The kept tail must not start with the first message's role
    let mut split = messages.len() - keep;
    if messages[split].role == messages[0].role {
        split -= 1;
    }
    if split <= 1 {
        return ContextCompactionResult::unchanged(messages);
    }

    let discarded = &messages[1..split];
    let summary = summarize(discarded);

    let mut first = messages[0].clone();
    first.content.push(ContentBlock::Text {
        text: summary.clone(),
    });

    let mut compacted = Vec::with_capacity(messages.len() - discarded.len());
    compacted.push(first);
    compacted.extend_from_slice(&messages[split..]);

    ContextCompactionResult {
        messages: merge_same_role(compacted),
        turn_pairs_removed: (discarded.len() + 1) / 2,
        summary,
    }
}

/// Merge adjacent messages sharing a role so roles strictly alternate
pub fn merge_same_role(messages: Vec<Message>) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match merged.last_mut() {
            Some(previous) if previous.role == message.role => {
                previous.content.extend(message.content);
            }
            _ => merged.push(message),
        }
    }
    merged
}

/// True when no two consecutive messages share a role
pub fn alternates(messages: &[Message]) -> bool {
    messages.windows(2).all(|pair| pair[0].role != pair[1].role)
}

fn test_result_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)\b(\d+)\s+(passed|failed)\b").ok())
        .as_ref()
}

/// Build the summary of the removed messages. Sections without evidence are left out.
fn summarize(discarded: &[Message]) -> String {
    let mut test_lines: Vec<String> = Vec::new();
    let mut files: BTreeSet<String> = BTreeSet::new();
    let mut tools: BTreeSet<String> = BTreeSet::new();

    for block in discarded.iter().flat_map(|message| message.content.iter()) {
        match block {
            ContentBlock::Text { text } => collect_test_lines(text, &mut test_lines),
            ContentBlock::ToolUse { name, input, .. } => {
                tools.insert(name.clone());
                for key in ["file_path", "path", "notebook_path"] {
                    if let Some(path) = input.get(key).and_then(|value| value.as_str()) {
                        files.insert(path.to_string());
                    }
                }
            }
            ContentBlock::ToolResult { output, .. } => collect_test_lines(output, &mut test_lines),
        }
    }

    let mut summary = format!(
        "[Context compacted: {} earlier messages were removed to stay within the context window.]",
        discarded.len()
    );

    if !test_lines.is_empty() {
        let start = test_lines.len().saturating_sub(MAX_TEST_LINES);
        summary.push_str("\nTest results seen:");
        for line in &test_lines[start..] {
            summary.push_str(&format!("\n- {}", line));
        }
    }
    if !files.is_empty() {
        summary.push_str("\nFiles touched: ");
        summary.push_str(&files.into_iter().collect::<Vec<_>>().join(", "));
    }
    if !tools.is_empty() {
        summary.push_str("\nTools used: ");
        summary.push_str(&tools.into_iter().collect::<Vec<_>>().join(", "));
    }

    summary
}

fn collect_test_lines(text: &str, out: &mut Vec<String>) {
    let Some(pattern) = test_result_pattern() else {
        return;
    };
    for line in text.lines() {
        let line = line.trim();
        if pattern.is_match(line) && !out.iter().any(|seen| seen == line) {
            out.push(line.to_string());
        }
    }
}
