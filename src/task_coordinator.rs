//! `TaskCoordinator` (spec.md §4.E) — the Task state machine plus the
//! background-task handle that drives one `SamplingLoop` run to
//! completion.
//!
//! Grounded on the teacher's `agent::session::AgentSession` (background
//! `JoinHandle`, `completed`/`error` flags, `kill()` stopping gracefully
//! before aborting) and `agent::registry::AgentRegistry` (find-or-create,
//! get, remove, list), generalized from one in-process agent run to the
//! full `queued → running → {completed, failed, stopped, paused}` Task
//! machine, where the state store — not an in-memory flag — is the
//! source of truth (spec.md §5 "the state store is the coordination
//! point").

use crate::config::{ConfigOverrides, ExecutionConfig};
use crate::conversation::{Message, Role};
use crate::error::{CoreError, CoreResult};
use crate::sampling_loop::{SamplingLoop, StreamEvent};
use crate::store::{StateStore, Task, TaskStatus};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

pub struct TaskCoordinator {
    sampling_loop: Arc<SamplingLoop>,
    store: Arc<dyn StateStore>,
    base_config: ExecutionConfig,
    /// Background run handles, keyed by task id, so a wedged run can be
    /// aborted directly (spec.md §4.E "stop" is cooperative; `kill` below
    /// is the non-cooperative escape hatch).
    handles: Arc<DashMap<Uuid, JoinHandle<()>>>,
}

impl TaskCoordinator {
    pub fn new(sampling_loop: Arc<SamplingLoop>, store: Arc<dyn StateStore>, base_config: ExecutionConfig) -> Self {
        Self { sampling_loop, store, base_config, handles: Arc::new(DashMap::new()) }
    }

    /// Create a new running Task and spawn its `SamplingLoop` in the
    /// background (spec.md §4.E "create").
    pub async fn create(
        &self,
        chat_session_id: Uuid,
        user_message: String,
        remote_session_id: String,
        config_overrides: ConfigOverrides,
        tx: mpsc::Sender<StreamEvent>,
    ) -> CoreResult<Task> {
        if self.store.running_task(chat_session_id).await?.is_some() {
            return Err(CoreError::Validation {
                field: "chat_session_id".into(),
                message: "a task is already running for this chat session".into(),
            });
        }

        let config = self.base_config.clone().merge(&config_overrides);
        let mut task = Task::new(chat_session_id, user_message.clone(), config.max_iterations as u32);
        task.status = TaskStatus::Running;
        task.started_at = Some(chrono::Utc::now());
        task.config_overrides = config_overrides;
        self.store.create_task(task.clone()).await?;

        let initial_message = Message::new(task.id, Role::User, vec![crate::conversation::Block::Text { text: user_message }], 0);
        self.store.append_message(initial_message.clone()).await?;

        self.spawn(task.clone(), remote_session_id, vec![initial_message], 0, config, tx);
        Ok(task)
    }

    /// Resume the newest `stopped`/`paused`/`failed` task in a chat
    /// session (spec.md §4.E "resume").
    pub async fn resume(&self, chat_session_id: Uuid, remote_session_id: String, tx: mpsc::Sender<StreamEvent>) -> CoreResult<Task> {
        let mut task = self
            .store
            .latest_resumable_task(chat_session_id)
            .await?
            .ok_or_else(|| CoreError::Validation { field: "chat_session_id".into(), message: "no resumable task found".into() })?;

        task.status = TaskStatus::Running;
        task.started_at = Some(chrono::Utc::now());
        self.store.update_task(task.clone()).await?;

        let config = self.base_config.clone().merge(&task.config_overrides);
        let messages = self.reconstruct_messages(task.id).await?;
        let start_iteration = task.current_iteration;

        self.spawn(task.clone(), remote_session_id, messages, start_iteration, config, tx);
        Ok(task)
    }

    /// Prefer the last stored outgoing request payload plus the
    /// assistant response content; fall back to concatenating every
    /// `Message` row in creation order (spec.md §4.E "Message
    /// reconstruction on resume"). Our `Message` rows already preserve
    /// the full block structure the model expects (tool_use/tool_result
    /// pairing, reasoning signatures), so ordered-by-iteration
    /// concatenation recovers the same conversation the last outgoing
    /// request payload would have.
    async fn reconstruct_messages(&self, task_id: Uuid) -> CoreResult<Vec<Message>> {
        Ok(self.store.messages_for_task(task_id).await?)
    }

    /// Cooperative stop: set `status=stopped` and let `SamplingLoop`
    /// observe it at its next stop check (spec.md §4.E "stop").
    pub async fn stop(&self, task_id: Uuid) -> CoreResult<()> {
        let mut task = self.store.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(());
        }
        task.status = TaskStatus::Stopped;
        task.completed_at = Some(chrono::Utc::now());
        task.agent_message = Some("Task stopped by user".to_string());
        self.store.update_task(task).await?;
        Ok(())
    }

    /// Abort the background run unconditionally, bypassing the
    /// cooperative stop — used only when a run is wedged and must be
    /// torn down (not part of the ordinary state machine).
    pub fn kill(&self, task_id: Uuid) {
        if let Some((_, handle)) = self.handles.remove(&task_id) {
            handle.abort();
        }
    }

    fn spawn(&self, task: Task, remote_session_id: String, messages: Vec<Message>, start_iteration: u32, config: ExecutionConfig, tx: mpsc::Sender<StreamEvent>) {
        let sampling_loop = self.sampling_loop.clone();
        let task_id = task.id;
        let chat_session_id = task.chat_session_id;
        let handles = self.handles.clone();

        let handle = tokio::spawn(async move {
            info!(task_id = %task_id, %start_iteration, "sampling loop starting");
            if let Err(e) = sampling_loop.run(task_id, chat_session_id, remote_session_id, start_iteration, messages, config, tx).await {
                warn!(task_id = %task_id, error = %e, "sampling loop exited with error");
            }
            handles.remove(&task_id);
        });
        self.handles.insert(task_id, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserError, BrowserEvent, BrowserResult, CreateOptions, CreatedSession, MouseButton, RemoteBrowserPort};
    use crate::memory_port::FsMemoryPort;
    use crate::model::{ModelPort, ModelResponse, ModelResult, StopReason, ToolSpec, Usage};
    use crate::object_store::InMemoryObjectStore;
    use crate::session_manager::SessionManager;
    use crate::store::InMemoryStateStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoopBrowser;

    #[async_trait]
    impl RemoteBrowserPort for NoopBrowser {
        async fn create(&self, _options: CreateOptions) -> BrowserResult<CreatedSession> {
            Ok(CreatedSession { remote_session_id: "rs-1".into(), debugger_ws_url: "ws://fake".into(), live_view_url: "https://fake".into() })
        }
        async fn connect(&self, _debugger_ws_url: &str) -> BrowserResult<Vec<String>> {
            Ok(vec!["page-1".into()])
        }
        async fn poll_events(&self, _remote_session_id: &str) -> BrowserResult<Vec<BrowserEvent>> {
            Ok(vec![])
        }
        async fn click(&self, _: &str, _: &str, _: f64, _: f64, _: MouseButton, _: u32) -> BrowserResult<()> {
            Ok(())
        }
        async fn move_mouse(&self, _: &str, _: &str, _: f64, _: f64) -> BrowserResult<()> {
            Ok(())
        }
        async fn scroll(&self, _: &str, _: &str, _: f64, _: f64, _: f64, _: f64) -> BrowserResult<()> {
            Ok(())
        }
        async fn type_text(&self, _: &str, _: &str, _: &str, _: Duration) -> BrowserResult<()> {
            Ok(())
        }
        async fn press(&self, _: &str, _: &str, _: &str) -> BrowserResult<()> {
            Ok(())
        }
        async fn screenshot(&self, _: &str, _: &str, _: Duration) -> BrowserResult<Vec<u8>> {
            Err(BrowserError::PageUnresponsive("no display in tests".into()))
        }
        async fn list_files(&self, _: &str, _: &str) -> BrowserResult<Vec<String>> {
            Ok(vec![])
        }
        async fn read_file(&self, _: &str, _: &str) -> BrowserResult<Vec<u8>> {
            Ok(vec![])
        }
        async fn destroy(&self, _: &str) -> BrowserResult<()> {
            Ok(())
        }
    }

    struct ImmediateCompletionModel;

    #[async_trait]
    impl ModelPort for ImmediateCompletionModel {
        async fn invoke(
            &self,
            _system_prompt: &str,
            _messages: &[Message],
            _tools: &[ToolSpec],
            _config: &crate::config::ModelConfig,
            _cache: crate::context_shaper::CacheAnnotation,
        ) -> ModelResult<ModelResponse> {
            Ok(ModelResponse {
                id: "msg-1".into(),
                model: "test-model".into(),
                blocks: vec![crate::conversation::Block::Text { text: "done".into() }],
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
                raw_payload: None,
            })
        }
    }

    fn coordinator() -> (TaskCoordinator, Arc<InMemoryStateStore>) {
        let store = Arc::new(InMemoryStateStore::new());
        let sessions = Arc::new(SessionManager::new(Arc::new(NoopBrowser), store.clone()));
        let objects = Arc::new(InMemoryObjectStore::new(b"k".to_vec(), "https://o.test"));
        let memory = Arc::new(FsMemoryPort::new(std::env::temp_dir().join("sampling-loop-tests")));
        let model = Arc::new(ImmediateCompletionModel);
        let sampling_loop = Arc::new(SamplingLoop::new(model, sessions, store.clone(), objects, memory));
        let coordinator = TaskCoordinator::new(sampling_loop, store.clone(), ExecutionConfig::default());
        (coordinator, store)
    }

    #[tokio::test]
    async fn create_rejects_second_running_task_for_same_session() {
        let (coordinator, store) = coordinator();
        let session = store.create_chat_session().await.unwrap();
        let (tx, _rx) = mpsc::channel(16);
        coordinator.create(session.id, "first".into(), "rs-1".into(), ConfigOverrides::default(), tx).await.unwrap();

        let (tx2, _rx2) = mpsc::channel(16);
        let err = coordinator.create(session.id, "second".into(), "rs-1".into(), ConfigOverrides::default(), tx2).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn stop_on_terminal_task_is_a_no_op() {
        let (coordinator, store) = coordinator();
        let session = store.create_chat_session().await.unwrap();
        let mut task = Task::new(session.id, "hi".into(), 10);
        task.status = TaskStatus::Completed;
        store.create_task(task.clone()).await.unwrap();
        coordinator.stop(task.id).await.unwrap();
        let reloaded = store.get_task(task.id).await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Completed);
    }
}
