//! Durable entities and the `StateStore` port (spec.md §3, §6).
//!
//! The real backend — relational tables plus object storage — is an
//! external collaborator (spec.md §1); this module defines the entities
//! and the trait the rest of the runtime talks to, plus an in-process
//! `DashMap`-backed implementation sufficient to drive the sampling loop
//! and the test suite end to end. The concurrent-map-plus-global-singleton
//! shape follows the teacher's `research::session_manager::ResearchSessionManager`.

mod memory_store;

pub use memory_store::InMemoryStateStore;

use crate::conversation::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatSessionStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub status: ChatSessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_conversation_time_ms: u64,
    pub total_iterations: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub metadata: serde_json::Value,
}

impl ChatSession {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: ChatSessionStatus::Active,
            created_at: now,
            updated_at: now,
            total_conversation_time_ms: 0,
            total_iterations: 0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cost_usd: 0.0,
            metadata: serde_json::Value::Null,
        }
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserSessionStatus {
    Active,
    Stopped,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSession {
    pub id: Uuid,
    pub chat_session_id: Uuid,
    pub remote_session_id: String,
    pub debugger_ws_url: String,
    pub live_view_url: String,
    pub cdp_connected: bool,
    pub cdp_disconnected_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub status: BrowserSessionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Stopped,
    Paused,
    Failed,
    Completed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn is_resumable(self) -> bool {
        matches!(self, TaskStatus::Stopped | TaskStatus::Paused | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentReportedStatus {
    Completed,
    Failed,
    NeedsClarification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub chat_session_id: Uuid,
    pub user_message: String,
    pub status: TaskStatus,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub agent_status: Option<AgentReportedStatus>,
    pub agent_message: Option<String>,
    pub agent_evidence: Option<serde_json::Value>,
    pub result_message: Option<String>,
    pub error_message: Option<String>,
    pub config_overrides: crate::config::ConfigOverrides,
    pub batch_execution_id: Option<Uuid>,
    pub batch_task_index: Option<usize>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(chat_session_id: Uuid, user_message: String, max_iterations: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_session_id,
            user_message,
            status: TaskStatus::Queued,
            current_iteration: 0,
            max_iterations,
            started_at: None,
            completed_at: None,
            agent_status: None,
            agent_message: None,
            agent_evidence: None,
            result_message: None,
            error_message: None,
            config_overrides: crate::config::ConfigOverrides::default(),
            batch_execution_id: None,
            batch_task_index: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchExecution {
    pub id: Uuid,
    pub chat_session_id: Uuid,
    pub browser_session_id: Option<Uuid>,
    pub total: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub status: BatchStatus,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub global_config_overrides: crate::config::ConfigOverrides,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub task_id: Uuid,
    pub iteration: u32,
    pub api_response_time_ms: u64,
    pub tool_execution_time_ms: u64,
    pub iteration_total_time_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub context_cleared_tokens: u64,
    pub request_size_bytes: u64,
    pub image_count: u32,
}

/// Durable state-store port (spec.md §6). Every method is independently
/// fallible; per spec.md §7, writes to `tasks.status` are the one write
/// that must be durably attempted — callers treat other `StoreError`s as
/// logged-and-continue, never fatal to the task.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create_chat_session(&self) -> StoreResult<ChatSession>;
    async fn get_chat_session(&self, id: Uuid) -> StoreResult<ChatSession>;
    async fn update_chat_session(&self, session: ChatSession) -> StoreResult<()>;
    /// All chat sessions, newest first — backs `GET /sessions` and
    /// `GET /dashboard/sessions` (spec.md §6 "read-only reporting").
    async fn list_chat_sessions(&self) -> StoreResult<Vec<ChatSession>>;

    async fn create_browser_session(&self, session: BrowserSession) -> StoreResult<()>;
    async fn get_browser_session(&self, id: Uuid) -> StoreResult<BrowserSession>;
    async fn get_browser_session_by_remote_id(&self, remote_session_id: &str) -> StoreResult<BrowserSession>;
    async fn update_browser_session(&self, session: BrowserSession) -> StoreResult<()>;

    async fn create_task(&self, task: Task) -> StoreResult<()>;
    async fn get_task(&self, id: Uuid) -> StoreResult<Task>;
    async fn update_task(&self, task: Task) -> StoreResult<()>;
    /// The newest task in `chat_session_id`, returned only if that task's
    /// status is itself resumable — an older resumable task never resurfaces
    /// once a newer, non-resumable task exists in the same session
    /// (spec.md §4.E "resume").
    async fn latest_resumable_task(&self, chat_session_id: Uuid) -> StoreResult<Option<Task>>;
    /// The single running task for a chat session, if any (spec.md §3, §5 invariant).
    async fn running_task(&self, chat_session_id: Uuid) -> StoreResult<Option<Task>>;
    /// All tasks for a chat session, oldest first — backs
    /// `GET /dashboard/tasks/{sessionId}` (spec.md §6).
    async fn tasks_for_chat_session(&self, chat_session_id: Uuid) -> StoreResult<Vec<Task>>;

    async fn create_batch_execution(&self, batch: BatchExecution) -> StoreResult<()>;
    async fn get_batch_execution(&self, id: Uuid) -> StoreResult<BatchExecution>;
    async fn update_batch_execution(&self, batch: BatchExecution) -> StoreResult<()>;

    async fn append_message(&self, message: Message) -> StoreResult<()>;
    /// Messages for a task, ordered by iteration ascending (spec.md §3, §5 ordering).
    async fn messages_for_task(&self, task_id: Uuid) -> StoreResult<Vec<Message>>;
    /// The last appended message for a task, used by resume to prefer the
    /// last stored outgoing request payload (spec.md §4.E).
    async fn last_message_for_task(&self, task_id: Uuid) -> StoreResult<Option<Message>>;

    async fn append_performance_metric(&self, metric: PerformanceMetric) -> StoreResult<()>;
    async fn performance_metrics_for_task(&self, task_id: Uuid) -> StoreResult<Vec<PerformanceMetric>>;
}
