//! `ModelPort` (spec.md §4.D inputs, §6) — the boundary to the remote
//! inference service. The service itself is out of scope (spec.md §1);
//! this module specifies the trait and ships a `reqwest`-based Anthropic
//! implementation because spec.md §6's configuration surface
//! (`ANTHROPIC_MODEL`, `ANTHROPIC_THINKING_ENABLED`, `THINKING_BUDGET_TOKENS`)
//! names that vendor's API directly.

mod anthropic;

pub use anthropic::AnthropicModelPort;

use crate::config::ModelConfig;
use crate::context_shaper::CacheAnnotation;
use crate::conversation::Message;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("request to model backend failed: {0}")]
    Request(String),
    #[error("model backend returned an error response: {0}")]
    BackendError(String),
    #[error("failed to parse model response: {0}")]
    MalformedResponse(String),
    #[error("model call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type ModelResult<T> = Result<T, ModelError>;

/// A tool definition passed to the model so it knows what it can call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Usage and cost accounting returned alongside a model response, persisted
/// into `PerformanceMetric` (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

/// Why the model stopped generating, used by `SamplingLoop` to decide
/// whether an iteration produced tool calls to dispatch or a final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ToolUse,
    EndTurn,
    MaxTokens,
    Other,
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub id: String,
    pub model: String,
    pub blocks: Vec<crate::conversation::Block>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    /// The raw request/response payload, populated only when
    /// `FULL_ANTHROPIC_PAYLOAD` is enabled (spec.md §6).
    pub raw_payload: Option<serde_json::Value>,
}

/// The boundary `SamplingLoop` calls once per iteration (spec.md §4.D).
#[async_trait]
pub trait ModelPort: Send + Sync {
    async fn invoke(
        &self,
        system_prompt: &str,
        messages: &[Message],
        tools: &[ToolSpec],
        config: &ModelConfig,
        cache: CacheAnnotation,
    ) -> ModelResult<ModelResponse>;
}
