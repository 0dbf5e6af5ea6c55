//! Extraction helpers for free-form agent answers

use serde::de::DeserializeOwned;

/// Contents of the first fenced code block tagged `lang` (or untagged)
///
/// Handles:
/// - ```json / ```yaml blocks
/// - Generic ``` blocks
/// Returns `None` when the text has no fence.
pub fn extract_fenced_block<'a>(text: &'a str, lang: &str) -> Option<&'a str> {
    let tagged = format!("```{}", lang);
    let start = match text.find(&tagged) {
        Some(pos) => pos + tagged.len(),
        None => text.find("```")? + 3,
    };
    let body = &text[start..];
    // Skip the rest of the opening fence line
    let body = body.split_once('\n').map(|(_, rest)| rest).unwrap_or(body);
    let end = body.find("```").unwrap_or(body.len());
    Some(body[..end].trim())
}

/// Best-effort JSON object from an agent's final answer.
///
/// Tries, in order: the whole text, a ```json block, the outermost `{...}`.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(block) = extract_fenced_block(trimmed, "json") {
        if let Ok(value) = serde_json::from_str(block) {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// YAML from a ```yaml block or raw text, without a leading `---`
pub fn extract_yaml(text: &str) -> String {
    let yaml = extract_fenced_block(text, "yaml").unwrap_or(text.trim());
    yaml.trim_start_matches("---").trim().to_string()
}

/// Parse YAML, falling back to JSON
pub fn parse_yaml_or_json<T: DeserializeOwned>(text: &str) -> Result<T, serde_yaml::Error> {
    match serde_json::from_str(text) {
        Ok(value) => Ok(value),
        Err(_) => serde_yaml::from_str(&extract_yaml(text)),
    }
}
