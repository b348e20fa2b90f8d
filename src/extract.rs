//! Extraction of one action object from free-form model output.
//!
//! Models are asked to reply with a single JSON object but routinely prepend
//! prose or wrap the object in a code fence. Three pattern attempts run in
//! order; the first match wins. Kept independent of the network call so it is
//! testable in isolation.

use serde_json::Value;

use crate::agent::AgentError;
use crate::protocol::{ActionCommand, ScrollDirection};

/// Pull the action object out of `raw` and validate its shape.
pub fn parse_action(raw: &str) -> Result<ActionCommand, AgentError> {
    let json = extract_json(raw).ok_or(AgentError::NoJsonFound)?;
    let value: Value = serde_json::from_str(json).map_err(|_| AgentError::InvalidActionShape)?;
    let verb = value
        .get("action")
        .and_then(Value::as_str)
        .ok_or(AgentError::InvalidActionShape)?;

    match verb {
        "navigate" => {
            let url = value
                .get("url")
                .and_then(Value::as_str)
                .ok_or(AgentError::InvalidActionShape)?;
            Ok(ActionCommand::Navigate { url: url.to_string() })
        }
        "click" => Ok(ActionCommand::Click { element_id: element_id(&value)? }),
        "input" => {
            let text = value
                .get("text")
                .and_then(Value::as_str)
                .ok_or(AgentError::InvalidActionShape)?;
            Ok(ActionCommand::Input {
                element_id: element_id(&value)?,
                text: text.to_string(),
            })
        }
        "scroll" => {
            // Missing or unrecognized direction falls back to down, matching
            // the executor's default.
            let direction = match value.get("direction").and_then(Value::as_str) {
                Some("up") => ScrollDirection::Up,
                _ => ScrollDirection::Down,
            };
            Ok(ActionCommand::Scroll { direction })
        }
        "finish" => Ok(ActionCommand::Finish),
        other => Ok(ActionCommand::Other { verb: other.to_string() }),
    }
}

fn element_id(value: &Value) -> Result<u32, AgentError> {
    value
        .get("elementId")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(AgentError::InvalidActionShape)
}

/// Ordered extraction: fenced block interior, then first-`{`-to-last-`}`
/// containing an `"action"` key, then a bare fence-stripped object.
fn extract_json(text: &str) -> Option<&str> {
    fenced_block(text)
        .or_else(|| braced_with_action(text))
        .or_else(|| stripped_fence(text))
}

/// Interior of the first ```-fenced block, narrowed to its outermost braces.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip the optional language tag; a fence with no newline is not a block.
    let body = &after[after.find('\n')? + 1..];
    let inner = &body[..body.find("```")?];
    let first = inner.find('{')?;
    let last = inner.rfind('}')?;
    (last > first).then(|| &inner[first..=last])
}

/// First `{` to last `}`, accepted only when the slice mentions `"action"`.
fn braced_with_action(text: &str) -> Option<&str> {
    let first = text.find('{')?;
    let last = text.rfind('}')?;
    if last <= first {
        return None;
    }
    let candidate = &text[first..=last];
    candidate.contains("\"action\"").then_some(candidate)
}

/// Strip a leading/trailing triple-backtick marker (optionally tagged "json")
/// and accept the remainder if it is brace-delimited.
fn stripped_fence(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let body = body.strip_suffix("```").unwrap_or(body).trim();
    (body.starts_with('{') && body.ends_with('}')).then_some(body)
}
