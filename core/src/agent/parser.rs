//! Block parser
//!
//! Turns accumulated model output into an ordered list of blocks. Prose and
//! ordinary code fences become text; a fence tagged `yaml` carries tool
//! invocations. Malformed input never fails, it degrades to text.

use serde::Serialize;
use serde_json::{Map, Value};

const FENCE: &str = "```";
const TOOL_TAG: &str = "yaml";
const TOOL_KEY: &str = "tool";

/// One unit of decoded model output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Block {
    Text {
        content: String,
        partial: bool,
    },
    ToolUse {
        name: String,
        params: Map<String, Value>,
        partial: bool,
    },
}

impl Block {
    pub fn text(content: impl Into<String>, partial: bool) -> Self {
        Self::Text {
            content: content.into(),
            partial,
        }
    }

    /// Whether the block may still grow as more stream arrives
    pub fn is_partial(&self) -> bool {
        match self {
            Self::Text { partial, .. } | Self::ToolUse { partial, .. } => *partial,
        }
    }

    pub fn set_partial(&mut self, value: bool) {
        match self {
            Self::Text { partial, .. } | Self::ToolUse { partial, .. } => *partial = value,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }
}

/// Parse the full accumulated text.
///
/// Blocks come out in source order. Only the trailing free text and an
/// unterminated final fence are marked partial.
pub fn parse(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut cursor = 0usize;

    while let Some(relative) = text[cursor..].find(FENCE) {
        let open = cursor + relative;
        push_prose(&mut blocks, &text[cursor..open], false);

        let after_marker = open + FENCE.len();
        let Some(line_end) = text[after_marker..].find('\n') else {
            // The opening line itself is still streaming.
            push_raw(&mut blocks, &text[open..], true);
            return blocks;
        };

        let is_tool_fence = text[after_marker..after_marker + line_end].trim() == TOOL_TAG;
        let body_start = after_marker + line_end + 1;

        match text[body_start..].find(FENCE) {
            Some(relative_close) => {
                let close = body_start + relative_close;
                let end = close + FENCE.len();
                if is_tool_fence {
                    decode_tool_fence(&mut blocks, &text[body_start..close]);
                } else {
                    push_raw(&mut blocks, &text[open..end], false);
                }
                cursor = end;
            }
            None => {
                let content = if is_tool_fence {
                    &text[body_start..]
                } else {
                    &text[open..]
                };
                push_raw(&mut blocks, content, true);
                return blocks;
            }
        }
    }

    push_prose(&mut blocks, &text[cursor..], true);
    blocks
}

fn push_prose(blocks: &mut Vec<Block>, segment: &str, partial: bool) {
    let trimmed = segment.trim();
    if !trimmed.is_empty() {
        blocks.push(Block::text(trimmed, partial));
    }
}

fn push_raw(blocks: &mut Vec<Block>, segment: &str, partial: bool) {
    if !segment.trim().is_empty() {
        blocks.push(Block::text(segment, partial));
    }
}

fn decode_tool_fence(blocks: &mut Vec<Block>, body: &str) {
    let decoded = decode_tool_calls(body);
    if decoded.is_empty() {
        push_raw(blocks, body, false);
    } else {
        blocks.extend(decoded);
    }
}

fn decode_tool_calls(body: &str) -> Vec<Block> {
    if body.trim().is_empty() {
        return Vec::new();
    }
    let Ok(yaml) = serde_yml::from_str::<serde_yml::Value>(body) else {
        return Vec::new();
    };
    // Round-trip through JSON so params keep a stable, ordered representation.
    let Ok(value) = serde_json::to_value(&yaml) else {
        return Vec::new();
    };

    match value {
        Value::Array(items) => items.into_iter().filter_map(tool_block).collect(),
        object @ Value::Object(_) => tool_block(object).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn tool_block(value: Value) -> Option<Block> {
    let Value::Object(mut params) = value else {
        return None;
    };
    let name = match params.get(TOOL_KEY) {
        Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
        _ => return None,
    };
    params.shift_remove(TOOL_KEY);
    Some(Block::ToolUse {
        name,
        params,
        partial: false,
    })
}
