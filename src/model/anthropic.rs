//! `reqwest`-based `ModelPort` against Anthropic's Messages API.
//!
//! Request/response shape grounded on `querymt-querymt`'s
//! `providers::anthropic::AnthropicCompleteRequest`/`AnthropicContent` (the
//! `content`/`tool_use`/`tool_result` block split, `thinking` config,
//! `usage` accounting), adapted to round-trip `Block::Reasoning`'s opaque
//! signature verbatim and to emit `cache_control` breakpoints per
//! `ContextShaper::CacheAnnotation` (spec.md §4.C, §9 Open Question #1).

use super::{ModelError, ModelPort, ModelResponse, ModelResult, StopReason, ToolSpec, Usage};
use crate::config::ModelConfig;
use crate::context_shaper::CacheAnnotation;
use crate::conversation::{Block, Message, Role, ToolResultContent};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Model call deadline (spec.md §5 "Timeouts: per-iteration model call deadline").
const MODEL_CALL_TIMEOUT: Duration = Duration::from_secs(180);

pub struct AnthropicModelPort {
    client: reqwest::Client,
    api_key: String,
}

impl AnthropicModelPort {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), api_key: api_key.into() }
    }

    /// Read `ANTHROPIC_API_KEY` from the process environment.
    pub fn from_env() -> ModelResult<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ModelError::Request("ANTHROPIC_API_KEY not set".into()))?;
        Ok(Self::new(api_key))
    }
}

#[derive(Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    kind: &'static str,
}

fn cache_control() -> CacheControl {
    CacheControl { kind: "ephemeral" }
}

#[derive(Serialize)]
struct WireTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireSourceContent<'a> {
    Text { text: &'a str },
    Image { source: WireImageSource<'a> },
}

#[derive(Serialize)]
struct WireImageSource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: &'a str,
    data: String,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock<'a> {
    Text {
        text: &'a str,
    },
    Thinking {
        thinking: &'a str,
        signature: &'a str,
    },
    ToolUse {
        id: &'a str,
        name: &'a str,
        input: &'a Value,
    },
    ToolResult {
        tool_use_id: &'a str,
        content: Vec<WireSourceContent<'a>>,
        is_error: bool,
    },
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: Vec<WireBlock<'a>>,
}

#[derive(Serialize)]
struct WireSystemBlock<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Serialize)]
struct ThinkingConfig {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u64,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u64,
    system: Vec<WireSystemBlock<'a>>,
    messages: Vec<WireMessage<'a>>,
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn to_wire_message(message: &Message) -> WireMessage<'_> {
    let content = message
        .blocks
        .iter()
        .filter_map(|block| match block {
            Block::Text { text } => Some(WireBlock::Text { text }),
            Block::Reasoning { text, signature } => Some(WireBlock::Thinking { thinking: text, signature }),
            Block::ToolUse { id, name, args } => Some(WireBlock::ToolUse { id, name, input: args }),
            Block::ToolResult { id, content, is_error } => Some(WireBlock::ToolResult {
                tool_use_id: id,
                content: content
                    .iter()
                    .map(|c| match c {
                        ToolResultContent::Text { text } => WireSourceContent::Text { text },
                        ToolResultContent::Image { image } => WireSourceContent::Image {
                            source: WireImageSource {
                                kind: "base64",
                                media_type: &image.content_type,
                                data: image
                                    .inline_bytes
                                    .as_ref()
                                    .map(|bytes| BASE64.encode(bytes))
                                    .unwrap_or_default(),
                            },
                        },
                    })
                    .collect(),
                is_error: *is_error,
            }),
        })
        .collect();
    WireMessage { role: role_str(message.role), content }
}

#[derive(Deserialize, Debug)]
struct ResponseBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
    thinking: Option<String>,
    signature: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<Value>,
}

#[derive(Deserialize, Debug, Default)]
struct ResponseUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

#[derive(Deserialize, Debug)]
struct ApiResponse {
    id: String,
    model: String,
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: ResponseUsage,
}

#[derive(Deserialize, Debug)]
struct ApiErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

fn parse_stop_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("tool_use") => StopReason::ToolUse,
        Some("end_turn") | Some("stop_sequence") => StopReason::EndTurn,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::Other,
    }
}

#[async_trait]
impl ModelPort for AnthropicModelPort {
    async fn invoke(
        &self,
        system_prompt: &str,
        messages: &[Message],
        tools: &[ToolSpec],
        config: &ModelConfig,
        cache: CacheAnnotation,
    ) -> ModelResult<ModelResponse> {
        let system = vec![WireSystemBlock {
            kind: "text",
            text: system_prompt,
            cache_control: cache.cache_system_prompt.then(cache_control),
        }];

        let wire_tools: Vec<WireTool> = tools
            .iter()
            .enumerate()
            .map(|(i, t)| WireTool {
                name: &t.name,
                description: &t.description,
                input_schema: &t.input_schema,
                cache_control: (cache.cache_last_tool && i == tools.len() - 1).then(cache_control),
            })
            .collect();

        let wire_messages: Vec<WireMessage> = messages.iter().map(to_wire_message).collect();

        let request = WireRequest {
            model: &config.model,
            max_tokens: config.max_tokens,
            system,
            messages: wire_messages,
            tools: wire_tools,
            thinking: config.thinking_enabled.then(|| ThinkingConfig {
                kind: "enabled",
                budget_tokens: config.thinking_budget_tokens,
            }),
        };

        let request_size_bytes = serde_json::to_vec(&request).map(|v| v.len()).unwrap_or(0);
        debug!(request_size_bytes, "invoking anthropic model");

        let mut builder = self
            .client
            .post(ANTHROPIC_API_BASE)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .timeout(MODEL_CALL_TIMEOUT);

        if !config.betas.is_empty() {
            builder = builder.header("anthropic-beta", config.betas.join(","));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| if e.is_timeout() { ModelError::Timeout(MODEL_CALL_TIMEOUT) } else { ModelError::Request(e.to_string()) })?;

        let status = response.status();
        let raw_body = response.text().await.map_err(|e| ModelError::Request(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorEnvelope>(&raw_body)
                .map(|e| e.error.message)
                .unwrap_or(raw_body);
            return Err(ModelError::BackendError(format!("{status}: {message}")));
        }

        let parsed: ApiResponse = serde_json::from_str(&raw_body).map_err(|e| ModelError::MalformedResponse(e.to_string()))?;

        let blocks = parsed
            .content
            .into_iter()
            .filter_map(|b| match b.block_type.as_str() {
                "text" => Some(Block::Text { text: b.text.unwrap_or_default() }),
                "thinking" => Some(Block::Reasoning {
                    text: b.thinking.unwrap_or_default(),
                    signature: b.signature.unwrap_or_default(),
                }),
                "tool_use" => Some(Block::ToolUse {
                    id: b.id.unwrap_or_default(),
                    name: b.name.unwrap_or_default(),
                    args: b.input.unwrap_or(Value::Null),
                }),
                other => {
                    warn!(block_type = other, "unrecognized anthropic response block, dropping");
                    None
                }
            })
            .collect();

        Ok(ModelResponse {
            id: parsed.id,
            model: parsed.model,
            blocks,
            stop_reason: parse_stop_reason(parsed.stop_reason.as_deref()),
            usage: Usage {
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
                cache_read_tokens: parsed.usage.cache_read_input_tokens,
                cache_creation_tokens: parsed.usage.cache_creation_input_tokens,
            },
            raw_payload: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_maps_tool_use() {
        assert_eq!(parse_stop_reason(Some("tool_use")), StopReason::ToolUse);
        assert_eq!(parse_stop_reason(Some("end_turn")), StopReason::EndTurn);
        assert_eq!(parse_stop_reason(Some("max_tokens")), StopReason::MaxTokens);
        assert_eq!(parse_stop_reason(None), StopReason::Other);
    }

    #[test]
    fn wire_message_round_trips_reasoning_signature() {
        let task_id = uuid::Uuid::new_v4();
        let message = Message::new(
            task_id,
            Role::Assistant,
            vec![Block::Reasoning { text: "thinking".into(), signature: "sig-123".into() }],
            0,
        );
        let wire = to_wire_message(&message);
        let value = serde_json::to_value(&wire).unwrap();
        assert_eq!(value["content"][0]["signature"], json!("sig-123"));
    }
}
