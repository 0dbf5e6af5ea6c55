//! Token estimation
//!
//! A deliberately rough estimate: one token per four characters. The
//! compaction threshold is configurable, so callers tune that instead.

use forgeflow_sdk::Message;

pub const CHARS_PER_TOKEN: usize = 4;

pub fn estimate_text_tokens(text: &str) -> usize {
    text.chars().count() / CHARS_PER_TOKEN
}

pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(Message::char_len).sum::<usize>() / CHARS_PER_TOKEN
}
