//! `SamplingLoop` (spec.md §4.D) — drives one task from its current
//! iteration to model-terminates, agent-reports-status, explicit stop, or
//! `max_iterations`.
//!
//! Grounded on the teacher's `AgentInner::process_step`
//! (`agent/core/processor.rs`): stop-check before work, browser-state
//! fetch, LLM call, action execution, history append — generalized here
//! from a fixed five-action browser protocol to the open `computer` /
//! `report_task_status` / `memory` tool set, and from a local Candle
//! model to a remote `ModelPort`.

use crate::config::ExecutionConfig;
use crate::context_shaper::{annotate_caching, shape_full};
use crate::conversation::{Block, Message, Role, ToolResultContent, synthesize_tool_results_message};
use crate::error::{CoreError, CoreResult};
use crate::memory_port::{MemoryPort, ViewResult};
use crate::model::{ModelPort, ToolSpec};
use crate::object_store::{ObjectStore, SCREENSHOT_URL_TTL};
use crate::session_manager::{Action, ActionOutcome, SessionManager};
use crate::store::{AgentReportedStatus, StateStore, TaskStatus as StoredTaskStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// One `computer`/`report_task_status`/`memory` tool call's outcome,
/// carried on the `message` SSE event (spec.md §4.G).
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub success: bool,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallSummary {
    pub id: String,
    pub name: String,
    pub args: Value,
    pub result: ToolCallResult,
}

/// Events `SamplingLoop` emits, translated into SSE by `event_stream`
/// (spec.md §4.G).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Metadata {
        session_id: Uuid,
        browser_session_id: String,
        stream_url: String,
        task_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    Message {
        id: Uuid,
        role: Role,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        tool_calls: Vec<ToolCallSummary>,
    },
    TaskStatus {
        status: StoredTaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_status: Option<AgentReportedStatus>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        evidence: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        final_response: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

/// Tool definitions advertised to the model (spec.md §4.D step 9, §6).
pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "computer".into(),
            description: "Control the remote browser's active tab: click, move the mouse, scroll, type, press keys, wait, or take a screenshot.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["left_click", "right_click", "double_click", "mouse_move", "scroll", "type", "key", "wait", "cursor_position", "screenshot"]
                    },
                    "coordinate": { "type": "array", "items": { "type": "number" }, "minItems": 2, "maxItems": 2 },
                    "delta": { "type": "array", "items": { "type": "number" }, "minItems": 2, "maxItems": 2 },
                    "text": { "type": "string" },
                    "duration_ms": { "type": "integer" }
                },
                "required": ["action"]
            }),
        },
        ToolSpec {
            name: "report_task_status".into(),
            description: "Report that the task has finished, failed, or needs clarification from the user.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "status": { "type": "string", "enum": ["completed", "failed", "needs_clarification"] },
                    "message": { "type": "string" },
                    "evidence": {}
                },
                "required": ["status", "message"]
            }),
        },
        ToolSpec {
            name: "memory".into(),
            description: "Read or edit a task-scoped memory file under /memories/{task_id}/.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "enum": ["view", "create", "str_replace", "insert", "delete", "rename"] },
                    "path": { "type": "string" },
                    "text": { "type": "string" },
                    "old_str": { "type": "string" },
                    "new_str": { "type": "string" },
                    "insert_line": { "type": "integer" },
                    "new_path": { "type": "string" }
                },
                "required": ["command", "path"]
            }),
        },
    ]
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are operating a remote browser on the user's behalf through the `computer` tool. \
Work step by step: observe a screenshot before acting, prefer precise coordinates over guessing, and call \
`report_task_status` once the task is complete, has failed, or needs clarification. Use the `memory` tool to persist \
notes you will need in a later iteration.";

enum IterationOutcome {
    Continue,
    Stopped,
    Completed,
    Failed(String),
}

pub struct SamplingLoop {
    model: Arc<dyn ModelPort>,
    sessions: Arc<SessionManager>,
    store: Arc<dyn StateStore>,
    objects: Arc<dyn ObjectStore>,
    memory: Arc<dyn MemoryPort>,
}

impl SamplingLoop {
    pub fn new(
        model: Arc<dyn ModelPort>,
        sessions: Arc<SessionManager>,
        store: Arc<dyn StateStore>,
        objects: Arc<dyn ObjectStore>,
        memory: Arc<dyn MemoryPort>,
    ) -> Self {
        Self { model, sessions, store, objects, memory }
    }

    fn emit(&self, tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
        if let Err(e) = tx.try_send(event) {
            warn!(error = %e, "dropping stream event, receiver full or gone");
        }
    }

    /// Run a task starting at `start_iteration` with `initial_messages`
    /// already reconstructed by `TaskCoordinator` (spec.md §4.D, §4.E).
    pub async fn run(
        &self,
        task_id: Uuid,
        chat_session_id: Uuid,
        remote_session_id: String,
        start_iteration: u32,
        mut messages: Vec<Message>,
        config: ExecutionConfig,
        tx: mpsc::Sender<StreamEvent>,
    ) -> CoreResult<()> {
        let tools = tool_specs();
        let mut iteration = start_iteration;
        let mut task_status_reported = false;
        let mut reported_status: Option<AgentReportedStatus> = None;
        let mut reported_message: Option<String> = None;
        let mut reported_evidence: Option<Value> = None;
        let mut final_response: Option<String> = None;

        loop {
            if iteration >= config.max_iterations as u32 {
                self.finish_max_iterations(task_id, &mut messages, iteration, &tx).await?;
                return Ok(());
            }

            match self
                .run_iteration(
                    task_id,
                    chat_session_id,
                    &remote_session_id,
                    iteration,
                    &mut messages,
                    &tools,
                    &config,
                    &tx,
                    &mut task_status_reported,
                    &mut reported_status,
                    &mut reported_message,
                    &mut reported_evidence,
                    &mut final_response,
                )
                .await
            {
                Ok(IterationOutcome::Continue) => {
                    iteration += 1;
                    tokio::time::sleep(config.inter_iteration_delay()).await;
                }
                Ok(IterationOutcome::Stopped) => return Ok(()),
                Ok(IterationOutcome::Completed) => return Ok(()),
                Ok(IterationOutcome::Failed(reason)) => {
                    self.emit(&tx, StreamEvent::Error { message: reason });
                    return Ok(());
                }
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "sampling loop iteration failed");
                    self.fail_task(task_id, &e.to_string()).await;
                    self.emit(&tx, StreamEvent::Error { message: e.to_string() });
                    return Err(e);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_iteration(
        &self,
        task_id: Uuid,
        chat_session_id: Uuid,
        remote_session_id: &str,
        iteration: u32,
        messages: &mut Vec<Message>,
        tools: &[ToolSpec],
        config: &ExecutionConfig,
        tx: &mpsc::Sender<StreamEvent>,
        task_status_reported: &mut bool,
        reported_status: &mut Option<AgentReportedStatus>,
        reported_message: &mut Option<String>,
        reported_evidence: &mut Option<Value>,
        final_response: &mut Option<String>,
    ) -> CoreResult<IterationOutcome> {
        // Step 1: advance current_iteration.
        let mut task = self.store.get_task(task_id).await?;
        task.current_iteration = iteration + 1;
        self.store.update_task(task.clone()).await?;

        // Step 2: stop-check A.
        if task.status == StoredTaskStatus::Stopped {
            self.emit_task_status(tx, task.status, None, task.agent_message.clone(), None);
            return Ok(IterationOutcome::Stopped);
        }

        // Step 3: shape the outgoing request.
        let cache = annotate_caching(config.context.enable_prompt_caching, config.context.enable_context_management);
        let (shaped, context_cleared_tokens) = shape_full(messages, &config.context);

        // Step 4: log request size / image count.
        let request_size_bytes = serde_json::to_vec(&shaped).map(|v| v.len() as u64).unwrap_or(0);
        let image_count = shaped
            .iter()
            .flat_map(|m| m.blocks.iter())
            .filter_map(|b| match b {
                Block::ToolResult { content, .. } => Some(content),
                _ => None,
            })
            .flatten()
            .filter(|c| matches!(c, ToolResultContent::Image { .. }))
            .count() as u32;
        info!(task_id = %task_id, iteration, request_size_bytes, image_count, "built outgoing request");

        // Step 5: stop-check B.
        let task_recheck = self.store.get_task(task_id).await?;
        if task_recheck.status == StoredTaskStatus::Stopped {
            self.emit_task_status(tx, task_recheck.status, None, task_recheck.agent_message.clone(), None);
            return Ok(IterationOutcome::Stopped);
        }

        // Step 6: invoke the model, timing the call.
        let started = Instant::now();
        let response = self.model.invoke(DEFAULT_SYSTEM_PROMPT, &shaped, tools, &config.model, cache).await?;
        let api_response_time_ms = started.elapsed().as_millis() as u64;

        // Step 7/8: append the assistant turn verbatim (signatures intact).
        let mut assistant_message = Message::new(task_id, Role::Assistant, response.blocks.clone(), iteration);
        assistant_message.api_response_time_ms = Some(api_response_time_ms);
        if config.context.full_anthropic_payload {
            assistant_message.raw_payload = response.raw_payload.clone();
        }
        messages.push(assistant_message.clone());

        // Step 9: dispatch each tool_use block.
        let tool_use_blocks: Vec<(String, String, Value)> = assistant_message
            .tool_use_blocks()
            .map(|(id, name, args)| (id.to_string(), name.to_string(), args.clone()))
            .collect();

        let mut tool_results = Vec::with_capacity(tool_use_blocks.len());
        let mut tool_call_summaries = Vec::with_capacity(tool_use_blocks.len());

        for (id, name, args) in &tool_use_blocks {
            let (result_block, summary) = self
                .dispatch_tool(
                    task_id,
                    chat_session_id,
                    remote_session_id,
                    config,
                    id,
                    name,
                    args,
                    task_status_reported,
                    reported_status,
                    reported_message,
                    reported_evidence,
                )
                .await;
            tool_results.push(result_block);
            tool_call_summaries.push(summary);
        }

        // Step 10: persist the assistant message and a performance metric.
        self.store.append_message(assistant_message.clone()).await?;
        self.store
            .append_performance_metric(crate::store::PerformanceMetric {
                task_id,
                iteration,
                api_response_time_ms,
                tool_execution_time_ms: 0,
                iteration_total_time_ms: started.elapsed().as_millis() as u64,
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
                cache_read_tokens: response.usage.cache_read_tokens,
                cache_creation_tokens: response.usage.cache_creation_tokens,
                context_cleared_tokens,
                request_size_bytes,
                image_count,
            })
            .await?;

        // Step 11: stream the message event.
        let reasoning_text = assistant_message
            .blocks
            .iter()
            .find_map(|b| match b {
                Block::Reasoning { text, .. } => Some(text.clone()),
                _ => None,
            });
        self.emit(
            tx,
            StreamEvent::Message {
                id: assistant_message.id,
                role: assistant_message.role,
                content: assistant_message.text(),
                reasoning: reasoning_text,
                tool_calls: tool_call_summaries,
            },
        );

        // Step 12: termination checks.
        if tool_use_blocks.is_empty() {
            *final_response = Some(assistant_message.text());
            self.complete_task(task_id, chat_session_id, remote_session_id, assistant_message.text()).await?;
            self.emit(
                tx,
                StreamEvent::Done { final_response: final_response.clone(), timestamp: Utc::now() },
            );
            return Ok(IterationOutcome::Completed);
        }

        if *task_status_reported {
            let mapped = match reported_status {
                Some(AgentReportedStatus::Completed) => StoredTaskStatus::Completed,
                Some(AgentReportedStatus::Failed) => StoredTaskStatus::Failed,
                Some(AgentReportedStatus::NeedsClarification) => StoredTaskStatus::Paused,
                None => StoredTaskStatus::Completed,
            };
            self.finalize_reported_status(
                task_id,
                chat_session_id,
                remote_session_id,
                mapped,
                *reported_status,
                reported_message.clone(),
                reported_evidence.clone(),
            )
            .await?;
            self.emit_task_status(tx, mapped, *reported_status, reported_message.clone(), reported_evidence.clone());
            self.emit(
                tx,
                StreamEvent::Done { final_response: reported_message.clone(), timestamp: Utc::now() },
            );
            return Ok(IterationOutcome::Completed);
        }

        let tool_results_message = synthesize_tool_results_message(task_id, iteration, tool_results);
        messages.push(tool_results_message.clone());
        self.store.append_message(tool_results_message).await?;

        Ok(IterationOutcome::Continue)
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tool(
        &self,
        task_id: Uuid,
        chat_session_id: Uuid,
        remote_session_id: &str,
        config: &ExecutionConfig,
        id: &str,
        name: &str,
        args: &Value,
        task_status_reported: &mut bool,
        reported_status: &mut Option<AgentReportedStatus>,
        reported_message: &mut Option<String>,
        reported_evidence: &mut Option<Value>,
    ) -> (Block, ToolCallSummary) {
        let (content, outcome) = match name {
            "computer" => self.dispatch_computer(task_id, remote_session_id, chat_session_id, config, args).await,
            "report_task_status" => {
                let status = args.get("status").and_then(Value::as_str).unwrap_or("completed");
                let message = args.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
                let evidence = args.get("evidence").cloned();

                *task_status_reported = true;
                *reported_status = Some(match status {
                    "failed" => AgentReportedStatus::Failed,
                    "needs_clarification" => AgentReportedStatus::NeedsClarification,
                    _ => AgentReportedStatus::Completed,
                });
                *reported_message = Some(message.clone());
                *reported_evidence = evidence.clone();

                (
                    vec![ToolResultContent::Text { text: "status recorded".into() }],
                    ToolCallResult { success: true, description: format!("reported status: {status}"), error: None, screenshot_base64: None, screenshot_url: None },
                )
            }
            "memory" => self.dispatch_memory(task_id, args).await,
            other => (
                vec![ToolResultContent::Text { text: format!("unknown tool: {other}") }],
                ToolCallResult { success: false, description: "unknown tool".into(), error: Some(format!("no such tool `{other}`")), screenshot_base64: None, screenshot_url: None },
            ),
        };

        let is_error = !outcome.success;
        let block = Block::ToolResult { id: id.to_string(), content, is_error };
        let summary = ToolCallSummary { id: id.to_string(), name: name.to_string(), args: args.clone(), result: outcome };
        (block, summary)
    }

    async fn dispatch_computer(
        &self,
        task_id: Uuid,
        remote_session_id: &str,
        chat_session_id: Uuid,
        config: &ExecutionConfig,
        args: &Value,
    ) -> (Vec<ToolResultContent>, ToolCallResult) {
        // Tool-level stop check (spec.md §4.D step 9 "computer").
        if let Ok(task) = self.store.get_task(task_id).await {
            if task.status == StoredTaskStatus::Stopped {
                return (
                    vec![ToolResultContent::Text { text: "User interrupted execution".into() }],
                    ToolCallResult { success: false, description: "interrupted".into(), error: Some("User interrupted execution".into()), screenshot_base64: None, screenshot_url: None },
                );
            }
        }

        let action_name = args.get("action").and_then(Value::as_str).unwrap_or_default();
        let coordinate = args.get("coordinate").and_then(Value::as_array);
        let xy = |idx: usize| coordinate.and_then(|c| c.get(idx)).and_then(Value::as_f64).unwrap_or(0.0);
        let delta = args.get("delta").and_then(Value::as_array);
        let dxy = |idx: usize| delta.and_then(|c| c.get(idx)).and_then(Value::as_f64).unwrap_or(0.0);
        let text_opt = args.get("text").and_then(Value::as_str);
        let text = text_opt.unwrap_or_default();

        // Argument validation (spec.md §4.B "each action validates its
        // arguments") — `SessionManagerError::InvalidAction` carries the
        // message through the same `Display` the dispatch-failure arm below
        // already uses, rather than silently defaulting to (0, 0) or "".
        let requires_coordinate = matches!(action_name, "left_click" | "right_click" | "double_click" | "mouse_move" | "scroll");
        let requires_text = matches!(action_name, "type" | "key");
        if requires_coordinate && coordinate.is_none() {
            let err = crate::session_manager::SessionManagerError::InvalidAction(format!("`{action_name}` requires a `coordinate` argument"));
            return (
                vec![ToolResultContent::Text { text: err.to_string() }],
                ToolCallResult { success: false, description: action_name.to_string(), error: Some(err.to_string()), screenshot_base64: None, screenshot_url: None },
            );
        }
        if requires_text && text_opt.is_none() {
            let err = crate::session_manager::SessionManagerError::InvalidAction(format!("`{action_name}` requires a `text` argument"));
            return (
                vec![ToolResultContent::Text { text: err.to_string() }],
                ToolCallResult { success: false, description: action_name.to_string(), error: Some(err.to_string()), screenshot_base64: None, screenshot_url: None },
            );
        }

        let action = match action_name {
            "left_click" => Action::LeftClick { x: xy(0), y: xy(1) },
            "right_click" => Action::RightClick { x: xy(0), y: xy(1) },
            "double_click" => Action::DoubleClick { x: xy(0), y: xy(1) },
            "mouse_move" => Action::MouseMove { x: xy(0), y: xy(1) },
            "scroll" => Action::Scroll { x: xy(0), y: xy(1), dx: dxy(0), dy: dxy(1) },
            "type" => Action::Type { text: text.to_string(), per_char_delay: Duration::from_millis(config.browser.typing_delay_ms) },
            "key" => Action::Key { combo: text.to_string() },
            "wait" => Action::Wait { duration: Duration::from_millis(args.get("duration_ms").and_then(Value::as_u64).unwrap_or(500)) },
            "cursor_position" => Action::CursorPosition,
            "screenshot" => Action::Screenshot,
            other => {
                return (
                    vec![ToolResultContent::Text { text: format!("unknown computer action: {other}") }],
                    ToolCallResult { success: false, description: "unknown action".into(), error: Some(format!("unknown computer action `{other}`")), screenshot_base64: None, screenshot_url: None },
                );
            }
        };

        match self.sessions.perform(remote_session_id, action).await {
            Ok(ActionOutcome::Ack) => (
                vec![ToolResultContent::Text { text: format!("{action_name} ok") }],
                ToolCallResult { success: true, description: action_name.to_string(), error: None, screenshot_base64: None, screenshot_url: None },
            ),
            Ok(ActionOutcome::CursorPosition { x, y }) => (
                vec![ToolResultContent::Text { text: format!("cursor at ({x}, {y})") }],
                ToolCallResult { success: true, description: "cursor_position".into(), error: None, screenshot_base64: None, screenshot_url: None },
            ),
            Ok(ActionOutcome::Screenshot(bytes)) => self.handle_screenshot(chat_session_id, bytes).await,
            Err(e) => (
                vec![ToolResultContent::Text { text: e.to_string() }],
                ToolCallResult { success: false, description: action_name.to_string(), error: Some(e.to_string()), screenshot_base64: None, screenshot_url: None },
            ),
        }
    }

    async fn handle_screenshot(&self, chat_session_id: Uuid, bytes: Vec<u8>) -> (Vec<ToolResultContent>, ToolCallResult) {
        let path = format!("{chat_session_id}/{}.png", Utc::now().timestamp_millis());
        if let Err(e) = self.objects.put(&path, bytes.clone(), "image/png").await {
            return (
                vec![ToolResultContent::Text { text: format!("screenshot captured but upload failed: {e}") }],
                ToolCallResult { success: false, description: "screenshot".into(), error: Some(e.to_string()), screenshot_base64: None, screenshot_url: None },
            );
        }
        let url = match self.objects.signed_url(&path, SCREENSHOT_URL_TTL).await {
            Ok(url) => url,
            Err(e) => {
                return (
                    vec![ToolResultContent::Text { text: format!("screenshot captured but signing failed: {e}") }],
                    ToolCallResult { success: false, description: "screenshot".into(), error: Some(e.to_string()), screenshot_base64: None, screenshot_url: None },
                );
            }
        };

        let image = crate::conversation::ImageContent { content_type: "image/png".into(), inline_bytes: Some(bytes.clone()), url: Some(url.clone()) };
        let content = vec![
            ToolResultContent::Image { image },
            ToolResultContent::Text { text: format!("[Screenshot URL: {url}]") },
        ];
        let summary = ToolCallResult {
            success: true,
            description: "screenshot".into(),
            error: None,
            screenshot_base64: Some(base64_encode(&bytes)),
            screenshot_url: Some(url),
        };
        (content, summary)
    }

    async fn dispatch_memory(&self, task_id: Uuid, args: &Value) -> (Vec<ToolResultContent>, ToolCallResult) {
        let command = args.get("command").and_then(Value::as_str).unwrap_or_default();
        let path = args.get("path").and_then(Value::as_str).unwrap_or_default();

        let result: Result<String, crate::memory_port::MemoryError> = async {
            match command {
                "view" => match self.memory.view(task_id, path).await? {
                    ViewResult::File(text) => Ok(text),
                    ViewResult::Directory(entries) => Ok(entries.into_iter().map(|e| e.path).collect::<Vec<_>>().join("\n")),
                },
                "create" => {
                    let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
                    self.memory.create(task_id, path, text).await?;
                    Ok("created".to_string())
                }
                "str_replace" => {
                    let old = args.get("old_str").and_then(Value::as_str).unwrap_or_default();
                    let new = args.get("new_str").and_then(Value::as_str).unwrap_or_default();
                    self.memory.str_replace(task_id, path, old, new).await?;
                    Ok("replaced".to_string())
                }
                "insert" => {
                    let line = args.get("insert_line").and_then(Value::as_u64).unwrap_or(0) as usize;
                    let new = args.get("new_str").and_then(Value::as_str).unwrap_or_default();
                    self.memory.insert(task_id, path, line, new).await?;
                    Ok("inserted".to_string())
                }
                "delete" => {
                    self.memory.delete(task_id, path).await?;
                    Ok("deleted".to_string())
                }
                "rename" => {
                    let new_path = args.get("new_path").and_then(Value::as_str).unwrap_or_default();
                    self.memory.rename(task_id, path, new_path).await?;
                    Ok("renamed".to_string())
                }
                other => Err(crate::memory_port::MemoryError::InvalidPath(format!("unknown command `{other}`"))),
            }
        }
        .await;

        match result {
            Ok(text) => (
                vec![ToolResultContent::Text { text: text.clone() }],
                ToolCallResult { success: true, description: format!("memory {command}"), error: None, screenshot_base64: None, screenshot_url: None },
            ),
            Err(e) => (
                vec![ToolResultContent::Text { text: e.to_string() }],
                ToolCallResult { success: false, description: format!("memory {command}"), error: Some(e.to_string()), screenshot_base64: None, screenshot_url: None },
            ),
        }
    }

    fn emit_task_status(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        status: StoredTaskStatus,
        agent_status: Option<AgentReportedStatus>,
        message: Option<String>,
        evidence: Option<Value>,
    ) {
        self.emit(tx, StreamEvent::TaskStatus { status, agent_status, message, evidence, timestamp: Utc::now() });
    }

    async fn complete_task(&self, task_id: Uuid, chat_session_id: Uuid, remote_session_id: &str, result_message: String) -> CoreResult<()> {
        let mut task = self.store.get_task(task_id).await?;
        task.status = StoredTaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.result_message = Some(result_message);
        self.store.update_task(task).await?;
        self.bump_session_aggregates(chat_session_id).await;
        if let Err(e) = self.sessions.disconnect_cdp(remote_session_id).await {
            warn!(remote_session_id, error = %e, "best-effort CDP auto-disconnect failed");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_reported_status(
        &self,
        task_id: Uuid,
        chat_session_id: Uuid,
        remote_session_id: &str,
        status: StoredTaskStatus,
        agent_status: Option<AgentReportedStatus>,
        agent_message: Option<String>,
        agent_evidence: Option<Value>,
    ) -> CoreResult<()> {
        let mut task = self.store.get_task(task_id).await?;
        task.status = status;
        task.completed_at = Some(Utc::now());
        task.agent_status = agent_status;
        task.agent_message = agent_message.clone();
        task.agent_evidence = agent_evidence;
        task.result_message = agent_message;
        self.store.update_task(task).await?;
        self.bump_session_aggregates(chat_session_id).await;
        if let Err(e) = self.sessions.disconnect_cdp(remote_session_id).await {
            warn!(remote_session_id, error = %e, "best-effort CDP auto-disconnect failed");
        }
        Ok(())
    }

    async fn bump_session_aggregates(&self, chat_session_id: Uuid) {
        if let Ok(mut session) = self.store.get_chat_session(chat_session_id).await {
            session.total_iterations += 1;
            session.updated_at = Utc::now();
            let _ = self.store.update_chat_session(session).await;
        }
    }

    async fn fail_task(&self, task_id: Uuid, error_message: &str) {
        if let Ok(mut task) = self.store.get_task(task_id).await {
            task.status = StoredTaskStatus::Failed;
            task.error_message = Some(error_message.to_string());
            task.completed_at = Some(Utc::now());
            let _ = self.store.update_task(task).await;
        }
    }

    async fn finish_max_iterations(&self, task_id: Uuid, messages: &mut Vec<Message>, iteration: u32, tx: &mpsc::Sender<StreamEvent>) -> CoreResult<()> {
        let text = "maximum iterations reached".to_string();
        let message = Message::new(task_id, Role::Assistant, vec![Block::Text { text: text.clone() }], iteration);
        messages.push(message.clone());
        self.store.append_message(message.clone()).await?;

        let mut task = self.store.get_task(task_id).await?;
        task.status = StoredTaskStatus::Failed;
        task.error_message = Some("max iterations reached".to_string());
        task.completed_at = Some(Utc::now());
        self.store.update_task(task).await?;

        self.emit(
            tx,
            StreamEvent::Message { id: message.id, role: message.role, content: text, reasoning: None, tool_calls: vec![] },
        );
        self.emit(tx, StreamEvent::Error { message: "max iterations reached".to_string() });
        Ok(())
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserError, BrowserResult, CreateOptions, CreatedSession, MouseButton};
    use crate::memory_port::FsMemoryPort;
    use crate::model::{ModelError, ModelResponse, ModelResult};
    use crate::object_store::InMemoryObjectStore;
    use crate::store::InMemoryStateStore;

    #[test]
    fn tool_specs_names_match_spec_surface() {
        let names: Vec<_> = tool_specs().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["computer", "report_task_status", "memory"]);
    }

    struct UnusedModel;

    #[async_trait::async_trait]
    impl ModelPort for UnusedModel {
        async fn invoke(
            &self,
            _system_prompt: &str,
            _messages: &[Message],
            _tools: &[ToolSpec],
            _config: &crate::config::ModelConfig,
            _cache: crate::context_shaper::CacheAnnotation,
        ) -> ModelResult<ModelResponse> {
            Err(ModelError::Request("not used in this test".into()))
        }
    }

    struct UnusedBrowser;

    #[async_trait::async_trait]
    impl crate::browser::RemoteBrowserPort for UnusedBrowser {
        async fn create(&self, _options: CreateOptions) -> BrowserResult<CreatedSession> {
            Err(BrowserError::Launch("not used in this test".into()))
        }
        async fn connect(&self, _debugger_ws_url: &str) -> BrowserResult<Vec<String>> {
            Ok(vec![])
        }
        async fn poll_events(&self, _remote_session_id: &str) -> BrowserResult<Vec<crate::browser::BrowserEvent>> {
            Ok(vec![])
        }
        async fn click(&self, _remote_session_id: &str, _page_id: &str, _x: f64, _y: f64, _button: MouseButton, _clicks: u32) -> BrowserResult<()> {
            Ok(())
        }
        async fn move_mouse(&self, _remote_session_id: &str, _page_id: &str, _x: f64, _y: f64) -> BrowserResult<()> {
            Ok(())
        }
        async fn scroll(&self, _remote_session_id: &str, _page_id: &str, _x: f64, _y: f64, _dx: f64, _dy: f64) -> BrowserResult<()> {
            Ok(())
        }
        async fn type_text(&self, _remote_session_id: &str, _page_id: &str, _text: &str, _per_char_delay: Duration) -> BrowserResult<()> {
            Ok(())
        }
        async fn press(&self, _remote_session_id: &str, _page_id: &str, _key_combo: &str) -> BrowserResult<()> {
            Ok(())
        }
        async fn screenshot(&self, _remote_session_id: &str, _page_id: &str, _deadline: Duration) -> BrowserResult<Vec<u8>> {
            Ok(vec![])
        }
        async fn list_files(&self, _remote_session_id: &str, _path: &str) -> BrowserResult<Vec<String>> {
            Ok(vec![])
        }
        async fn read_file(&self, _remote_session_id: &str, _path: &str) -> BrowserResult<Vec<u8>> {
            Ok(vec![])
        }
        async fn destroy(&self, _remote_session_id: &str) -> BrowserResult<()> {
            Ok(())
        }
    }

    fn test_loop() -> SamplingLoop {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let sessions = Arc::new(SessionManager::new(Arc::new(UnusedBrowser), store.clone()));
        let objects: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new(b"test-signing-key".to_vec(), "http://localhost/objects".into()));
        let memory: Arc<dyn MemoryPort> = Arc::new(FsMemoryPort::new(std::env::temp_dir().join("sampling_loop_tests")));
        SamplingLoop::new(Arc::new(UnusedModel), sessions, store, objects, memory)
    }

    #[tokio::test]
    async fn dispatch_computer_rejects_click_missing_coordinate() {
        let sampling_loop = test_loop();
        let config = ExecutionConfig::default();
        let args = serde_json::json!({ "action": "left_click" });

        let (content, result) = sampling_loop
            .dispatch_computer(Uuid::new_v4(), "rs-1", Uuid::new_v4(), &config, &args)
            .await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or_default().contains("coordinate"));
        assert!(content.iter().any(|c| matches!(c, ToolResultContent::Text { text } if text.contains("coordinate"))));
    }

    #[tokio::test]
    async fn dispatch_computer_rejects_type_missing_text() {
        let sampling_loop = test_loop();
        let config = ExecutionConfig::default();
        let args = serde_json::json!({ "action": "type" });

        let (_content, result) = sampling_loop
            .dispatch_computer(Uuid::new_v4(), "rs-1", Uuid::new_v4(), &config, &args)
            .await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or_default().contains("text"));
    }
}
