//! Pure transforms over a conversation (spec.md §4.C).
//!
//! Every function here allocates a fresh `Vec<Message>` and never mutates
//! its input — the same discipline the teacher's `AgentHistoryList`
//! applies when appending steps (`add_step_with_completion` never rewrites
//! earlier entries). This is the single place in the runtime allowed to
//! downgrade a screenshot to a URL reference or drop a reasoning block;
//! no other component may silently drop an image.

use crate::conversation::{Block, Message, Role, ToolResultContent};

/// Traverse user-role messages newest-to-oldest; for each embedded
/// `tool_result` image, keep inline bytes for the first `keep_inline`
/// encountered and replace the rest with a `[Screenshot URL: ...]` text
/// marker. Relative block order is preserved; no message is reordered.
pub fn demote_screenshots(messages: &[Message], keep_inline: usize) -> Vec<Message> {
    let mut out: Vec<Message> = messages.to_vec();
    let mut seen = 0usize;

    for msg in out.iter_mut().rev() {
        if msg.role != Role::User {
            continue;
        }
        for block in msg.blocks.iter_mut() {
            let Block::ToolResult { content, .. } = block else {
                continue;
            };
            for item in content.iter_mut() {
                let ToolResultContent::Image { image } = item else {
                    continue;
                };
                if image.inline_bytes.is_none() {
                    continue;
                }
                seen += 1;
                if seen > keep_inline {
                    image.demote_to_url_only();
                }
            }
        }
    }

    // Ensure every demoted image has a text pointer alongside it, extracted
    // from the URL the inline bytes used to travel with. Appended rather
    // than replacing existing text so sibling context is preserved.
    for msg in out.iter_mut() {
        if msg.role != Role::User {
            continue;
        }
        for block in msg.blocks.iter_mut() {
            let Block::ToolResult { content, .. } = block else {
                continue;
            };
            let pointers: Vec<String> = content
                .iter()
                .filter_map(|item| match item {
                    ToolResultContent::Image { image } if image.inline_bytes.is_none() => {
                        image.url.clone().map(|url| format!("[Screenshot URL: {url}]"))
                    }
                    _ => None,
                })
                .collect();
            for pointer in pointers {
                let already_present = content.iter().any(|item| {
                    matches!(item, ToolResultContent::Text { text } if text == &pointer)
                });
                if !already_present {
                    content.push(ToolResultContent::Text { text: pointer });
                }
            }
        }
    }

    out
}

/// Keep `Reasoning` blocks only on the last `keep_recent` assistant
/// messages that hold them, stripping older ones in reverse-index order.
pub fn prune_reasoning(messages: &[Message], keep_recent: usize) -> Vec<Message> {
    let mut out: Vec<Message> = messages.to_vec();

    let reasoning_indices: Vec<usize> = out
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::Assistant && m.blocks.iter().any(Block::is_reasoning))
        .map(|(i, _)| i)
        .collect();

    if reasoning_indices.len() <= keep_recent {
        return out;
    }

    let drop_count = reasoning_indices.len() - keep_recent;
    for &idx in reasoning_indices.iter().take(drop_count) {
        out[idx].blocks.retain(|b| !b.is_reasoning());
    }

    out
}

/// Marker carried on the last tool definition and the system prompt so the
/// inference backend knows to reuse computed prefix work across iterations.
pub const CACHE_BREAKPOINT_MARKER: &str = "cache_control:ephemeral";

/// Tag describing where caching breakpoints should be applied for one
/// outgoing request. `ModelPort` implementations translate this into
/// whatever wire representation the backend wants (e.g. Anthropic's
/// `cache_control: {"type": "ephemeral"}` on the last tool and the system
/// prompt block).
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheAnnotation {
    pub cache_last_tool: bool,
    pub cache_system_prompt: bool,
}

pub fn annotate_caching(enable_prompt_caching: bool, enable_context_management: bool) -> CacheAnnotation {
    // Context edits invalidate a cached prefix; only annotate tools/system
    // when context management won't immediately invalidate the cache this
    // same iteration (spec.md §9 Open Question #1).
    let cache = enable_prompt_caching && enable_context_management;
    CacheAnnotation {
        cache_last_tool: cache,
        cache_system_prompt: cache,
    }
}

/// Apply `demote_screenshots` then `prune_reasoning`, the composition
/// `SamplingLoop` uses to build one outgoing request.
pub fn shape(messages: &[Message], keep_inline_screenshots: usize, keep_recent_reasoning: usize) -> Vec<Message> {
    let demoted = demote_screenshots(messages, keep_inline_screenshots);
    prune_reasoning(&demoted, keep_recent_reasoning)
}

/// Heuristic: approximate characters per token for English/mixed text.
const CHARS_PER_TOKEN: u64 = 4;

fn block_char_len(block: &Block) -> usize {
    match block {
        Block::Text { text } => text.len(),
        Block::Reasoning { text, signature } => text.len() + signature.len(),
        Block::ToolUse { name, args, .. } => name.len() + args.to_string().len(),
        Block::ToolResult { content, .. } => content
            .iter()
            .map(|c| match c {
                ToolResultContent::Text { text } => text.len(),
                ToolResultContent::Image { .. } => 0,
            })
            .sum(),
    }
}

/// Heuristic token estimate over every block's text content (~4 chars per
/// token), the same ratio the teacher's upstream compaction module uses.
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    let total_chars: usize = messages.iter().flat_map(|m| m.blocks.iter()).map(block_char_len).sum();
    (total_chars as u64) / CHARS_PER_TOKEN
}

/// Auto-context-management: once the estimated token count crosses
/// `trigger_tokens`, clear the content of the oldest `tool_use`/`tool_result`
/// pairs — skipping the most recent `keep_tool_uses` and any tool named in
/// `exclude_tools` — until at least `clear_min_tokens` worth of estimated
/// tokens have been freed. Returns the shaped messages and the number of
/// tokens actually cleared, so the caller can report it on the performance
/// metric instead of hardcoding zero.
///
/// `trigger_tokens == 0` means "let the inference backend pick its own
/// default" (spec.md §6); locally that falls back to `clear_min_tokens` as
/// the trigger so this function still has a concrete threshold to compare
/// against.
pub fn apply_context_management(
    messages: &[Message],
    keep_tool_uses: usize,
    trigger_tokens: u64,
    clear_min_tokens: u64,
    exclude_tools: &[String],
) -> (Vec<Message>, u64) {
    let mut out: Vec<Message> = messages.to_vec();

    let effective_trigger = if trigger_tokens == 0 { clear_min_tokens } else { trigger_tokens };
    if effective_trigger == 0 || estimate_tokens(&out) <= effective_trigger {
        return (out, 0);
    }

    // Ordered oldest-to-newest; (message_index, block_index, id, name).
    let tool_uses: Vec<(usize, usize, String, String)> = out
        .iter()
        .enumerate()
        .flat_map(|(mi, m)| {
            m.blocks.iter().enumerate().filter_map(move |(bi, b)| match b {
                Block::ToolUse { id, name, .. } => Some((mi, bi, id.clone(), name.clone())),
                _ => None,
            })
        })
        .collect();

    if tool_uses.len() <= keep_tool_uses {
        return (out, 0);
    }
    let clearable = &tool_uses[..tool_uses.len() - keep_tool_uses];

    let mut cleared_tokens = 0u64;
    for (mi, bi, id, name) in clearable {
        if cleared_tokens >= clear_min_tokens {
            break;
        }
        if exclude_tools.iter().any(|t| t == name) {
            continue;
        }

        let before: usize = block_char_len(&out[*mi].blocks[*bi])
            + out
                .iter()
                .flat_map(|m| m.blocks.iter())
                .filter(|b| matches!(b, Block::ToolResult { id: rid, .. } if rid == id))
                .map(block_char_len)
                .sum::<usize>();

        if let Block::ToolUse { args, .. } = &mut out[*mi].blocks[*bi] {
            *args = serde_json::Value::Null;
        }
        for m in out.iter_mut() {
            for b in m.blocks.iter_mut() {
                if let Block::ToolResult { id: rid, content, .. } = b {
                    if rid == id {
                        *content = vec![ToolResultContent::Text { text: "[cleared by context management]".into() }];
                    }
                }
            }
        }

        let after: usize = block_char_len(&out[*mi].blocks[*bi])
            + out
                .iter()
                .flat_map(|m| m.blocks.iter())
                .filter(|b| matches!(b, Block::ToolResult { id: rid, .. } if rid == id))
                .map(block_char_len)
                .sum::<usize>();

        cleared_tokens += (before.saturating_sub(after) as u64) / CHARS_PER_TOKEN;
    }

    (out, cleared_tokens)
}

/// Full request-shaping composition: `shape` followed by auto-context-management
/// when `config.enable_context_management` is set. Returns the shaped messages
/// and the number of tokens cleared this call, for `PerformanceMetric::context_cleared_tokens`.
pub fn shape_full(messages: &[Message], config: &crate::config::ContextConfig) -> (Vec<Message>, u64) {
    let shaped = shape(messages, config.max_base64_screenshots, config.keep_recent_thinking_blocks);
    if !config.enable_context_management {
        return (shaped, 0);
    }
    apply_context_management(
        &shaped,
        config.context_keep_tool_uses,
        config.context_trigger_tokens,
        config.context_clear_min_tokens,
        &config.context_exclude_tools,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ImageContent;
    use uuid::Uuid;

    fn screenshot_message(task_id: Uuid, iteration: u32, url: &str) -> Message {
        Message::new(
            task_id,
            Role::User,
            vec![Block::ToolResult {
                id: format!("tu-{iteration}"),
                content: vec![ToolResultContent::Image {
                    image: ImageContent {
                        content_type: "image/png".into(),
                        inline_bytes: Some(vec![1, 2, 3]),
                        url: Some(url.to_string()),
                    },
                }],
                is_error: false,
            }],
            iteration,
        )
    }

    fn reasoning_message(task_id: Uuid, iteration: u32) -> Message {
        Message::new(
            task_id,
            Role::Assistant,
            vec![
                Block::Reasoning {
                    text: "thinking...".into(),
                    signature: format!("sig-{iteration}"),
                },
                Block::Text { text: "ok".into() },
            ],
            iteration,
        )
    }

    #[test]
    fn demotes_all_but_k_newest_screenshots() {
        let task_id = Uuid::new_v4();
        let messages: Vec<Message> = (0..7)
            .map(|i| screenshot_message(task_id, i, &format!("https://example.com/{i}.png")))
            .collect();

        let shaped = demote_screenshots(&messages, 3);

        let inline_count = shaped
            .iter()
            .flat_map(|m| m.blocks.iter())
            .filter_map(|b| match b {
                Block::ToolResult { content, .. } => Some(content),
                _ => None,
            })
            .flatten()
            .filter(|c| matches!(c, ToolResultContent::Image { image } if image.inline_bytes.is_some()))
            .count();

        assert_eq!(inline_count, 3);

        // the newest three (iterations 4,5,6) must be the ones kept inline
        for (i, msg) in shaped.iter().enumerate() {
            let has_inline = msg.blocks.iter().any(|b| match b {
                Block::ToolResult { content, .. } => content.iter().any(|c| {
                    matches!(c, ToolResultContent::Image { image } if image.inline_bytes.is_some())
                }),
                _ => false,
            });
            if i >= 4 {
                assert!(has_inline, "message {i} should still carry inline bytes");
            } else {
                assert!(!has_inline, "message {i} should have been demoted");
            }
        }
    }

    #[test]
    fn demoted_screenshots_carry_text_pointer() {
        let task_id = Uuid::new_v4();
        let messages = vec![screenshot_message(task_id, 0, "https://example.com/0.png")];
        let shaped = demote_screenshots(&messages, 0);

        let Block::ToolResult { content, .. } = &shaped[0].blocks[0] else {
            panic!("expected tool result block");
        };
        assert!(content.iter().any(
            |c| matches!(c, ToolResultContent::Text { text } if text == "[Screenshot URL: https://example.com/0.png]")
        ));
    }

    #[test]
    fn prunes_reasoning_keeping_only_last_r() {
        let task_id = Uuid::new_v4();
        let messages: Vec<Message> = (0..4).map(|i| reasoning_message(task_id, i)).collect();
        let shaped = prune_reasoning(&messages, 1);

        let reasoning_count = shaped
            .iter()
            .filter(|m| m.blocks.iter().any(Block::is_reasoning))
            .count();
        assert_eq!(reasoning_count, 1);
        assert!(shaped[3].blocks.iter().any(Block::is_reasoning));
        assert!(!shaped[0].blocks.iter().any(Block::is_reasoning));
    }

    #[test]
    fn shape_is_idempotent() {
        let task_id = Uuid::new_v4();
        let mut messages: Vec<Message> = (0..7)
            .map(|i| screenshot_message(task_id, i, &format!("https://example.com/{i}.png")))
            .collect();
        messages.extend((7..9).map(|i| reasoning_message(task_id, i)));

        let once = shape(&messages, 3, 1);
        let twice = shape(&once, 3, 1);

        assert_eq!(
            serde_json::to_value(&once).unwrap(),
            serde_json::to_value(&twice).unwrap()
        );
    }

    #[test]
    fn shape_is_pure_function_of_input() {
        let task_id = Uuid::new_v4();
        let messages: Vec<Message> = (0..5)
            .map(|i| screenshot_message(task_id, i, &format!("https://example.com/{i}.png")))
            .collect();

        let a = shape(&messages, 2, 1);
        let b = shape(&messages, 2, 1);
        assert_eq!(serde_json::to_value(&a).unwrap(), serde_json::to_value(&b).unwrap());
    }

    fn tool_pair(task_id: Uuid, iteration: u32, id: &str, name: &str, payload_len: usize) -> Vec<Message> {
        let assistant = Message::new(
            task_id,
            Role::Assistant,
            vec![Block::ToolUse { id: id.into(), name: name.into(), args: serde_json::json!({ "k": "x".repeat(payload_len) }) }],
            iteration,
        );
        let user = Message::new(
            task_id,
            Role::User,
            vec![Block::ToolResult {
                id: id.into(),
                content: vec![ToolResultContent::Text { text: "x".repeat(payload_len) }],
                is_error: false,
            }],
            iteration,
        );
        vec![assistant, user]
    }

    #[test]
    fn apply_context_management_below_trigger_is_a_no_op() {
        let task_id = Uuid::new_v4();
        let messages = tool_pair(task_id, 0, "tu-0", "navigate", 10);
        let (out, cleared) = apply_context_management(&messages, 5, 10_000, 1_000, &[]);
        assert_eq!(cleared, 0);
        assert_eq!(serde_json::to_value(&out).unwrap(), serde_json::to_value(&messages).unwrap());
    }

    #[test]
    fn apply_context_management_clears_oldest_pairs_first() {
        let task_id = Uuid::new_v4();
        let mut messages = Vec::new();
        for i in 0..6 {
            messages.extend(tool_pair(task_id, i, &format!("tu-{i}"), "navigate", 200));
        }

        let (out, cleared) = apply_context_management(&messages, 2, 10, 100, &[]);
        assert!(cleared > 0, "expected some tokens to be reported cleared");

        // oldest tool_use's args must be cleared
        let Block::ToolUse { args, .. } = &out[0].blocks[0] else { panic!("expected tool_use") };
        assert_eq!(*args, serde_json::Value::Null);

        // newest two tool_use/tool_result pairs (keep_tool_uses = 2) survive untouched
        let Block::ToolUse { args, .. } = &out[10].blocks[0] else { panic!("expected tool_use") };
        assert_ne!(*args, serde_json::Value::Null);
        let Block::ToolResult { content, .. } = &out[11].blocks[0] else { panic!("expected tool_result") };
        assert!(content.iter().any(|c| matches!(c, ToolResultContent::Text { text } if text.len() == 200)));
    }

    #[test]
    fn apply_context_management_never_clears_excluded_tools() {
        let task_id = Uuid::new_v4();
        let mut messages = Vec::new();
        for i in 0..6 {
            messages.extend(tool_pair(task_id, i, &format!("tu-{i}"), "memory", 200));
        }

        let (out, _cleared) = apply_context_management(&messages, 0, 10, 100, &["memory".to_string()]);

        let Block::ToolUse { args, .. } = &out[0].blocks[0] else { panic!("expected tool_use") };
        assert_ne!(*args, serde_json::Value::Null, "excluded tool must never be cleared");
    }

    #[test]
    fn estimate_tokens_uses_four_chars_per_token() {
        let task_id = Uuid::new_v4();
        let messages = vec![Message::new(task_id, Role::User, vec![Block::Text { text: "x".repeat(8) }], 0)];
        assert_eq!(estimate_tokens(&messages), 2);
    }
}
