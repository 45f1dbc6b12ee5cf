//! Wire types for LLM conversation content: the tagged content-block union,
//! messages, tool descriptors, and completion results.
//!
//! Ported from the original's `TextRaw`/`ToolUse`/`ToolUseResult`/
//! `ThinkingBlock` union and its `dump_content`/`load_content`
//! discriminator (`type: "text" | "tool_use" | "tool_use_result" |
//! "thinking"`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Plain assistant/user text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRaw {
    pub text: String,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// The result of executing a tool, paired back into the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

/// A `ToolUse` paired with the `ToolResult` it produced, carried as a
/// single content block once the tool has actually run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseResult {
    pub tool_use: ToolUse,
    pub tool_result: ToolResult,
}

impl ToolUseResult {
    pub fn from_tool_use(tool_use: ToolUse, tool_result: ToolResult) -> Self {
        Self {
            tool_use,
            tool_result,
        }
    }
}

/// Extended reasoning emitted by thinking-capable models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingBlock {
    pub thinking: String,
}

/// Tagged union of everything that can appear in a message's content list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextRaw),
    ToolUse(ToolUse),
    ToolUseResult(ToolUseResult),
    Thinking(ThinkingBlock),
}

impl ContentBlock {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(TextRaw { text: s.into() })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(&t.text),
            _ => None,
        }
    }
}

/// Merge consecutive `Text` blocks into one, joined by a single space —
/// the invariant the original enforces on every read-back of stored
/// content so that continuation turns don't fragment a sentence across
/// multiple blocks.
pub fn merge_adjacent_text(blocks: Vec<ContentBlock>) -> Vec<ContentBlock> {
    let mut merged: Vec<ContentBlock> = Vec::with_capacity(blocks.len());
    for block in blocks {
        match (merged.last_mut(), &block) {
            (Some(ContentBlock::Text(prev)), ContentBlock::Text(next)) => {
                prev.text.push(' ');
                prev.text.push_str(&next.text);
            }
            _ => merged.push(block),
        }
    }
    merged
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: merge_adjacent_text(content),
        }
    }
}

/// A tool description handed to the LLM provider, mirroring the original's
/// `Tool` TypedDict (`name`, `description`, `input_schema`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

/// A single completion turn returned by a provider, before continuation
/// merging. `stop_reason == "max_tokens"` signals the caller should issue
/// another turn and append the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub stop_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_text_merges_with_space() {
        let blocks = vec![
            ContentBlock::text("hello"),
            ContentBlock::text("world"),
            ContentBlock::ToolUse(ToolUse {
                name: "write_file".into(),
                input: serde_json::json!({"path": "a.rs"}),
                id: Some("1".into()),
            }),
            ContentBlock::text("done"),
        ];
        let merged = merge_adjacent_text(blocks);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].as_text(), Some("hello world"));
        assert_eq!(merged[2].as_text(), Some("done"));
    }

    #[test]
    fn content_block_round_trips_through_json() {
        let block = ContentBlock::ToolUseResult(ToolUseResult::from_tool_use(
            ToolUse {
                name: "read_file".into(),
                input: serde_json::json!({"path": "a.rs"}),
                id: None,
            },
            ToolResult {
                content: "fn main() {}".into(),
                tool_use_id: None,
                name: Some("read_file".into()),
                is_error: false,
            },
        ));
        let json = serde_json::to_string(&block).unwrap();
        assert!(json.contains("\"type\":\"tool_use_result\""));
        let back: ContentBlock = serde_json::from_str(&json).unwrap();
        assert_eq!(block, back);
    }
}
