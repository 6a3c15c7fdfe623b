//! Conversation data model.
//!
//! Replaces the dynamic, freeform block lists a JS/TS agent runtime
//! typically passes around with a tagged sum of block variants, per the
//! replacement pattern spec.md §9 calls for. Every block variant the
//! sampling loop produces or consumes is represented here; nothing
//! downstream re-parses strings looking for base64 images or role tags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One role in a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Image bytes plus content type, carried alongside an optional stable URL.
///
/// Both slots may be populated at once: the URL is stable and persists
/// beyond the request, the inline bytes may later be demoted by
/// `ContextShaper`. Avoid re-deriving one from the other by string
/// sniffing — that's the smuggling pattern spec.md §9 tells us to avoid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageContent {
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_bytes: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ImageContent {
    pub fn inline(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            inline_bytes: Some(bytes),
            url: None,
        }
    }

    /// Drop the inline bytes, keeping only the URL pointer. Used by
    /// `ContextShaper::demote_screenshots`; never done anywhere else.
    pub fn demote_to_url_only(&mut self) {
        self.inline_bytes = None;
    }
}

/// One piece of a tool result's content (spec.md §3 "Message").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultContent {
    Text { text: String },
    Image { image: ImageContent },
}

/// A single content block inside a `Message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    /// Extended-thinking content. `signature` is opaque and must be
    /// round-tripped verbatim back to the model port on the next call.
    Reasoning {
        text: String,
        signature: String,
    },
    ToolUse {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolResult {
        id: String,
        content: Vec<ToolResultContent>,
        is_error: bool,
    },
}

impl Block {
    pub fn is_tool_use(&self) -> bool {
        matches!(self, Block::ToolUse { .. })
    }

    pub fn is_reasoning(&self) -> bool {
        matches!(self, Block::Reasoning { .. })
    }

    pub fn as_tool_use(&self) -> Option<(&str, &str, &serde_json::Value)> {
        match self {
            Block::ToolUse { id, name, args } => Some((id, name, args)),
            _ => None,
        }
    }
}

/// One conversational turn, ordered by `iteration` within a task.
///
/// Ordering is by creation timestamp / iteration number within a session;
/// ordering must remain stable across reconnects (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: uuid::Uuid,
    pub task_id: uuid::Uuid,
    pub role: Role,
    pub blocks: Vec<Block>,
    pub iteration: u32,
    pub created_at: DateTime<Utc>,
    /// Round-trip latency of the model call that produced this message,
    /// `None` for synthesized user-role tool-result messages.
    pub api_response_time_ms: Option<u64>,
    /// Full outgoing/incoming payload for audit, present only when
    /// `FULL_ANTHROPIC_PAYLOAD` is enabled (spec.md §6).
    pub raw_payload: Option<serde_json::Value>,
}

impl Message {
    pub fn new(task_id: uuid::Uuid, role: Role, blocks: Vec<Block>, iteration: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            task_id,
            role,
            blocks,
            iteration,
            created_at: Utc::now(),
            api_response_time_ms: None,
            raw_payload: None,
        }
    }

    pub fn tool_use_blocks(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.blocks.iter().filter_map(Block::as_tool_use)
    }

    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A user-role message carrying every `tool_result` block produced while
/// dispatching one assistant turn's `tool_use` blocks.
pub fn synthesize_tool_results_message(
    task_id: uuid::Uuid,
    iteration: u32,
    results: Vec<Block>,
) -> Message {
    debug_assert!(results.iter().all(|b| matches!(b, Block::ToolResult { .. })));
    Message::new(task_id, Role::User, results, iteration)
}
