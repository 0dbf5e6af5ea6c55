//! Layer 1: per-call tool output truncation
//!
//! Every policy is a no-op under its limit and idempotent: truncating an
//! already truncated output returns it unchanged. Line policies count content
//! lines only, ignoring omission markers; character policies reserve room for
//! the marker so the result never exceeds the cap. Line-policy output is
//! additionally held to the generic character cap, so one enormous line is
//! still cut.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::config::{TruncationLimits, MIN_CHAR_CAP};

/// Upper bound on the length of a character marker including newlines
const CHAR_MARKER_RESERVE: usize = 64;

/// Which truncation policy applies to a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    Shell,
    FileRead,
    PatternSearch,
    PathListing,
    Other,
}

impl ToolClass {
    pub fn from_tool_name(tool_name: &str) -> Self {
        let name = tool_name.to_ascii_lowercase();
        match name.as_str() {
            "bash" | "shell" | "sh" | "run_command" | "execute_command" | "bashoutput" => {
                Self::Shell
            }
            "read" | "read_file" | "view" | "cat" | "notebookread" => Self::FileRead,
            "grep" | "search" | "search_files" | "rg" | "ripgrep" => Self::PatternSearch,
            "glob" | "ls" | "list" | "list_files" | "list_directory" | "find" => {
                Self::PathListing
            }
            _ if name.contains("bash") || name.contains("shell") => Self::Shell,
            _ if name.contains("grep") || name.contains("search") => Self::PatternSearch,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TruncationResult {
    pub output: String,
    pub was_truncated: bool,
    /// Length of the raw output in characters
    pub original_length: usize,
    /// Length of `output` in characters
    pub truncated_length: usize,
}

impl TruncationResult {
    fn unchanged(raw: &str) -> Self {
        let length = raw.chars().count();
        Self {
            output: raw.to_string(),
            was_truncated: false,
            original_length: length,
            truncated_length: length,
        }
    }

    fn truncated(raw: &str, output: String) -> Self {
        let truncated_length = output.chars().count();
        Self {
            output,
            was_truncated: true,
            original_length: raw.chars().count(),
            truncated_length,
        }
    }
}

fn marker(count: usize, unit: &str) -> String {
    format!("[... {} {} omitted ...]", count, unit)
}

fn is_marker(line: &str) -> bool {
    static MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    MARKER
        .get_or_init(|| {
            Regex::new(r"^\[\.\.\. \d+ (lines|characters|matches|paths) omitted \.\.\.\]$").ok()
        })
        .as_ref()
        .map(|re| re.is_match(line.trim()))
        .unwrap_or(false)
}

/// Truncate `raw` according to the policy for `tool_name`
pub fn truncate_tool_output(
    tool_name: &str,
    raw: &str,
    limits: &TruncationLimits,
) -> TruncationResult {
    let by_lines = match ToolClass::from_tool_name(tool_name) {
        ToolClass::Shell => {
            truncate_head_tail_lines(raw, limits.shell_head_lines, limits.shell_tail_lines)
        }
        ToolClass::PatternSearch => {
            truncate_leading_lines(raw, limits.search_max_matches, "matches")
        }
        ToolClass::PathListing => truncate_leading_lines(raw, limits.listing_max_paths, "paths"),
        ToolClass::FileRead => return truncate_head_tail_chars(raw, limits.file_read_max_chars),
        ToolClass::Other => return truncate_flat_chars(raw, limits.generic_max_chars),
    };

    let capped = truncate_flat_chars(&by_lines.output, limits.generic_max_chars);
    if !capped.was_truncated {
        return by_lines;
    }
    TruncationResult::truncated(raw, capped.output)
}

/// Keep the first `head` and last `tail` lines
pub fn truncate_head_tail_lines(raw: &str, head: usize, tail: usize) -> TruncationResult {
    let lines: Vec<&str> = raw.lines().collect();
    let content_lines = lines.iter().filter(|line| !is_marker(line)).count();
    if content_lines <= head + tail {
        return TruncationResult::unchanged(raw);
    }

    let omitted = lines.len() - head - tail;
    let mut kept: Vec<String> = lines[..head].iter().map(|line| line.to_string()).collect();
    kept.push(marker(omitted, "lines"));
    kept.extend(lines[lines.len() - tail..].iter().map(|line| line.to_string()));

    TruncationResult::truncated(raw, kept.join("\n"))
}

/// Keep the first `max` lines, e.g. search matches or listed paths
pub fn truncate_leading_lines(raw: &str, max: usize, unit: &str) -> TruncationResult {
    let lines: Vec<&str> = raw.lines().collect();
    let content_lines = lines.iter().filter(|line| !is_marker(line)).count();
    if content_lines <= max {
        return TruncationResult::unchanged(raw);
    }

    let mut kept: Vec<String> = lines[..max].iter().map(|line| line.to_string()).collect();
    kept.push(marker(lines.len() - max, unit));

    TruncationResult::truncated(raw, kept.join("\n"))
}

/// Keep a head and a tail whose combined length fits `max_chars`
pub fn truncate_head_tail_chars(raw: &str, max_chars: usize) -> TruncationResult {
    let max_chars = max_chars.max(MIN_CHAR_CAP);
    let total = raw.chars().count();
    if total <= max_chars {
        return TruncationResult::unchanged(raw);
    }

    let budget = max_chars - CHAR_MARKER_RESERVE;
    let head_len = budget / 2;
    let tail_len = budget - head_len;
    let omitted = total - head_len - tail_len;

    let head: String = raw.chars().take(head_len).collect();
    let tail: String = raw.chars().skip(total - tail_len).collect();
    let output = format!("{}\n{}\n{}", head, marker(omitted, "characters"), tail);

    TruncationResult::truncated(raw, output)
}

/// Keep only the first `max_chars` characters
pub fn truncate_flat_chars(raw: &str, max_chars: usize) -> TruncationResult {
    let max_chars = max_chars.max(MIN_CHAR_CAP);
    let total = raw.chars().count();
    if total <= max_chars {
        return TruncationResult::unchanged(raw);
    }

    let keep = max_chars - CHAR_MARKER_RESERVE;
    let head: String = raw.chars().take(keep).collect();
    let output = format!("{}\n{}", head, marker(total - keep, "characters"));

    TruncationResult::truncated(raw, output)
}
