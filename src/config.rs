//! Configuration surface.
//!
//! Every knob enumerated here is read from the process environment, with
//! the defaults spelled out as `default_x()` functions in the same style
//! the teacher crate uses for its `Config`/`BrowserConfig` (see
//! `load_yaml_config` in the original `kodegen_tools_browser::lib`) —
//! except sourced from `std::env` rather than a YAML file, since this
//! runtime's configuration surface is environment-variable based.

use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

/// Model invocation configuration, read from `ANTHROPIC_*` / `THINKING_*`.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model: String,
    pub max_tokens: u64,
    pub thinking_enabled: bool,
    pub thinking_budget_tokens: u64,
    /// Comma-separated beta feature flags sent as the `anthropic-beta` header.
    pub betas: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: env_string("ANTHROPIC_MODEL", "claude-sonnet-4-5-20250929"),
            max_tokens: env_u64("ANTHROPIC_MAX_TOKENS", 4096),
            thinking_enabled: env_bool("ANTHROPIC_THINKING_ENABLED", true),
            thinking_budget_tokens: env_u64("THINKING_BUDGET_TOKENS", 1024),
            betas: env_string("ANTHROPIC_BETAS", "")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Context-management knobs consumed by `ContextShaper` and `SamplingLoop`.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub max_base64_screenshots: usize,
    pub keep_recent_thinking_blocks: usize,
    pub full_anthropic_payload: bool,
    pub enable_prompt_caching: bool,
    pub enable_context_management: bool,
    /// 0 means "let the inference backend pick its own default".
    pub context_trigger_tokens: u64,
    pub context_keep_tool_uses: usize,
    pub context_clear_min_tokens: u64,
    pub context_exclude_tools: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_base64_screenshots: env_usize("MAX_BASE64_SCREENSHOTS", 3),
            keep_recent_thinking_blocks: env_usize("KEEP_RECENT_THINKING_BLOCKS", 1),
            full_anthropic_payload: env_bool("FULL_ANTHROPIC_PAYLOAD", false),
            enable_prompt_caching: env_bool("ENABLE_PROMPT_CACHING", true),
            enable_context_management: env_bool("ENABLE_CONTEXT_MANAGEMENT", true),
            context_trigger_tokens: env_u64("CONTEXT_TRIGGER_TOKENS", 0),
            context_keep_tool_uses: env_usize("CONTEXT_KEEP_TOOL_USES", 5),
            context_clear_min_tokens: env_u64("CONTEXT_CLEAR_MIN_TOKENS", 20_000),
            context_exclude_tools: env_string("CONTEXT_EXCLUDE_TOOLS", "report_task_status,memory")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Browser launch / interaction configuration.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub typing_delay_ms: u64,
    pub onkernel_timeout_secs: u64,
    pub browser_persistence: bool,
    pub onkernel_use_profiles: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            typing_delay_ms: env_u64("TYPING_DELAY_MS", 5),
            onkernel_timeout_secs: env_u64("ONKERNEL_TIMEOUT_SECONDS", 60),
            browser_persistence: env_bool("BROWSER_PERSISTENCE", false),
            onkernel_use_profiles: env_bool("ONKERNEL_USE_PROFILES", false),
        }
    }
}

impl BrowserConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.onkernel_timeout_secs)
    }
}

/// Per-task / per-iteration execution configuration (spec.md §4.D "Inputs").
///
/// This is the value threaded through `SamplingLoop`. It starts from process
/// defaults and is overlaid by `BatchExecution.global_config_overrides` and
/// then by a task's own `config_overrides`, task-level winning — see
/// `ExecutionConfig::merge`.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub max_iterations: usize,
    pub sampling_loop_delay_ms: u64,
    pub model: ModelConfig,
    pub context: ContextConfig,
    pub browser: BrowserConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_iterations: env_usize("AGENT_MAX_ITERATIONS", 35),
            sampling_loop_delay_ms: env_u64("SAMPLING_LOOP_DELAY_MS", 100),
            model: ModelConfig::default(),
            context: ContextConfig::default(),
            browser: BrowserConfig::default(),
        }
    }
}

impl ExecutionConfig {
    pub fn inter_iteration_delay(&self) -> Duration {
        Duration::from_millis(self.sampling_loop_delay_ms)
    }

    /// Overlay `overrides` on top of `self`, `overrides` winning field-by-field.
    /// Used both for global-over-default and task-over-global merges
    /// (spec.md §4.F: "task-level wins").
    pub fn merge(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(v) = overrides.max_iterations {
            self.max_iterations = v;
        }
        if let Some(v) = &overrides.model {
            self.model.model = v.clone();
        }
        if let Some(v) = overrides.max_tokens {
            self.model.max_tokens = v;
        }
        if let Some(v) = overrides.thinking_enabled {
            self.model.thinking_enabled = v;
        }
        if let Some(v) = overrides.max_base64_screenshots {
            self.context.max_base64_screenshots = v;
        }
        if let Some(v) = overrides.keep_recent_thinking_blocks {
            self.context.keep_recent_thinking_blocks = v;
        }
        if let Some(v) = overrides.typing_delay_ms {
            self.browser.typing_delay_ms = v;
        }
        self
    }
}

/// Sparse per-task/per-batch overrides layered onto `ExecutionConfig`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ConfigOverrides {
    pub max_iterations: Option<usize>,
    pub model: Option<String>,
    pub max_tokens: Option<u64>,
    pub thinking_enabled: Option<bool>,
    pub max_base64_screenshots: Option<usize>,
    pub keep_recent_thinking_blocks: Option<usize>,
    pub typing_delay_ms: Option<u64>,
}

/// Shared secret required by the batch endpoint (`API_KEY_SECRET`).
pub fn api_key_secret() -> Option<String> {
    std::env::var("API_KEY_SECRET").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_execution_config_matches_documented_defaults() {
        let cfg = ExecutionConfig::default();
        assert_eq!(cfg.max_iterations, 35);
        assert_eq!(cfg.sampling_loop_delay_ms, 100);
        assert_eq!(cfg.context.max_base64_screenshots, 3);
        assert_eq!(cfg.context.keep_recent_thinking_blocks, 1);
        assert_eq!(cfg.context.context_exclude_tools, vec!["report_task_status", "memory"]);
    }

    #[test]
    fn merge_applies_task_overrides_over_defaults() {
        let cfg = ExecutionConfig::default();
        let overrides = ConfigOverrides {
            max_iterations: Some(10),
            max_base64_screenshots: Some(1),
            ..Default::default()
        };
        let merged = cfg.merge(&overrides);
        assert_eq!(merged.max_iterations, 10);
        assert_eq!(merged.context.max_base64_screenshots, 1);
        // untouched field keeps the default
        assert_eq!(merged.context.keep_recent_thinking_blocks, 1);
    }
}
