//! `BatchExecutor` (spec.md §4.F) — runs N tasks sequentially against one
//! shared browser session, reporting `task_status` transitions to an
//! optional webhook.
//!
//! New code: no teacher equivalent exists for "many tasks, one session,
//! asynchronous" batch execution. Grounded on the teacher's sequential
//! `Agent::run` step loop for the "one iteration's failure does not
//! abort the whole run" discipline (applied here at the task level
//! instead of the step level), and on [[webhook]] for the outbound
//! notification.

use crate::browser::CreateOptions;
use crate::config::{ConfigOverrides, ExecutionConfig};
use crate::conversation::{Block, Message, Role};
use crate::error::CoreResult;
use crate::sampling_loop::{SamplingLoop, StreamEvent};
use crate::session_manager::SessionManager;
use crate::store::{BatchExecution, BatchStatus, StateStore, Task, TaskStatus};
use crate::webhook::WebhookSender;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// One task in a batch request (spec.md §4.F "Inputs").
#[derive(Debug, Clone)]
pub struct BatchTaskInput {
    pub task_id: Uuid,
    pub message: String,
    pub config_overrides: ConfigOverrides,
    pub destroy_browser_on_completion: bool,
}

pub struct BatchExecutor {
    sampling_loop: Arc<SamplingLoop>,
    sessions: Arc<SessionManager>,
    store: Arc<dyn StateStore>,
    webhook: Arc<WebhookSender>,
    base_config: ExecutionConfig,
}

impl BatchExecutor {
    pub fn new(sampling_loop: Arc<SamplingLoop>, sessions: Arc<SessionManager>, store: Arc<dyn StateStore>, webhook: Arc<WebhookSender>, base_config: ExecutionConfig) -> Self {
        Self { sampling_loop, sessions, store, webhook, base_config }
    }

    pub async fn run(
        &self,
        batch_execution_id: Uuid,
        chat_session_id: Uuid,
        tasks: Vec<BatchTaskInput>,
        global_config_overrides: ConfigOverrides,
        webhook_url: Option<String>,
        webhook_secret: Option<String>,
    ) -> CoreResult<()> {
        // Step 1: one shared browser session for the whole batch.
        let browser_session = self.sessions.create(chat_session_id, CreateOptions::default()).await?;

        let mut batch = self.store.get_batch_execution(batch_execution_id).await?;
        batch.browser_session_id = Some(browser_session.id);
        self.store.update_batch_execution(batch.clone()).await?;

        let total = tasks.len();
        let mut harness_failed = false;

        for (index, task_input) in tasks.into_iter().enumerate() {
            let result = self
                .run_one_task(
                    &batch,
                    index,
                    task_input.clone(),
                    chat_session_id,
                    &browser_session.remote_session_id,
                    &global_config_overrides,
                    webhook_url.as_deref(),
                    webhook_secret.as_deref(),
                )
                .await;

            match result {
                Ok(()) => batch.completed_count += 1,
                Err(e) => {
                    warn!(batch_execution_id = %batch_execution_id, task_index = index, error = %e, "batch task failed, continuing to next task");
                    batch.failed_count += 1;
                    harness_failed = true;
                }
            }
            self.store.update_batch_execution(batch.clone()).await?;

            if index == total.saturating_sub(1) && task_input.destroy_browser_on_completion {
                if let Err(e) = self.sessions.destroy(&browser_session.remote_session_id).await {
                    warn!(error = %e, "failed to destroy browser session at end of batch");
                }
            }
        }

        batch.status = if harness_failed && batch.completed_count == 0 { BatchStatus::Failed } else { BatchStatus::Completed };
        self.store.update_batch_execution(batch).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one_task(
        &self,
        batch: &BatchExecution,
        index: usize,
        task_input: BatchTaskInput,
        chat_session_id: Uuid,
        remote_session_id: &str,
        global_config_overrides: &ConfigOverrides,
        webhook_url: Option<&str>,
        webhook_secret: Option<&str>,
    ) -> CoreResult<()> {
        // Merge config: process defaults, overlay global overrides, overlay
        // this task's own overrides (task-level wins).
        let config = self.base_config.clone().merge(global_config_overrides).merge(&task_input.config_overrides);

        let mut task = Task::new(chat_session_id, task_input.message.clone(), config.max_iterations as u32);
        task.id = task_input.task_id;
        task.status = TaskStatus::Running;
        task.started_at = Some(chrono::Utc::now());
        task.batch_execution_id = Some(batch.id);
        task.batch_task_index = Some(index);
        task.config_overrides = task_input.config_overrides.clone();
        self.store.create_task(task.clone()).await?;

        // Tag the content sent to the model with the task id while storing
        // the original message verbatim for UI (spec.md §4.F step 2).
        let tagged = format!("<task_id>{}</task_id>\n{}", task.id, task_input.message);
        let initial_message = Message::new(task.id, Role::User, vec![Block::Text { text: tagged }], 0);
        self.store.append_message(initial_message.clone()).await?;

        let (tx, rx) = mpsc::channel(64);
        let forwarder = self.spawn_webhook_forwarder(rx, batch.id, task.id, index, webhook_url.map(str::to_string), webhook_secret.map(str::to_string));

        let run_result = self
            .sampling_loop
            .run(task.id, chat_session_id, remote_session_id.to_string(), 0, vec![initial_message], config, tx)
            .await;

        let _ = forwarder.await;
        run_result
    }

    fn spawn_webhook_forwarder(
        &self,
        mut rx: mpsc::Receiver<StreamEvent>,
        batch_execution_id: Uuid,
        task_id: Uuid,
        task_index: usize,
        webhook_url: Option<String>,
        webhook_secret: Option<String>,
    ) -> tokio::task::JoinHandle<()> {
        let webhook = self.webhook.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let StreamEvent::TaskStatus { status, agent_status, message, evidence, timestamp } = event else {
                    continue;
                };
                let Some(url) = webhook_url.as_deref() else { continue };

                let payload = json!({
                    "batchExecutionId": batch_execution_id,
                    "taskId": task_id,
                    "taskIndex": task_index,
                    "status": status,
                    "agentStatus": agent_status,
                    "message": message,
                    "evidence": evidence,
                    "timestamp": timestamp,
                });
                if let Err(e) = webhook.send(url, webhook_secret.as_deref(), &payload).await {
                    warn!(task_id = %task_id, error = %e, "webhook delivery failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_task_input_carries_destroy_flag_per_task() {
        let input = BatchTaskInput {
            task_id: Uuid::new_v4(),
            message: "go".into(),
            config_overrides: ConfigOverrides::default(),
            destroy_browser_on_completion: true,
        };
        assert!(input.destroy_browser_on_completion);
    }
}
