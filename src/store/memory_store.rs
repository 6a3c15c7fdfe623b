//! In-process `StateStore` implementation.
//!
//! Grounded on the teacher's `research::session_manager::ResearchSessionManager`:
//! one `DashMap` per entity, `Arc<Self>` handed out for shared ownership,
//! no actor/event loop needed because `DashMap` is internally sharded and
//! safe to mutate from many tasks concurrently.

use super::{
    BatchExecution, BrowserSession, ChatSession, PerformanceMetric, StateStore, StoreError, StoreResult, Task,
};
use crate::conversation::Message;
use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryStateStore {
    chat_sessions: DashMap<Uuid, ChatSession>,
    browser_sessions: DashMap<Uuid, BrowserSession>,
    browser_sessions_by_remote_id: DashMap<String, Uuid>,
    tasks: DashMap<Uuid, Task>,
    batches: DashMap<Uuid, BatchExecution>,
    messages: DashMap<Uuid, Vec<Message>>,
    metrics: DashMap<Uuid, Vec<PerformanceMetric>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_chat_session(&self) -> StoreResult<ChatSession> {
        let session = ChatSession::new();
        self.chat_sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_chat_session(&self, id: Uuid) -> StoreResult<ChatSession> {
        self.chat_sessions
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("chat session {id}")))
    }

    async fn update_chat_session(&self, session: ChatSession) -> StoreResult<()> {
        self.chat_sessions.insert(session.id, session);
        Ok(())
    }

    async fn list_chat_sessions(&self) -> StoreResult<Vec<ChatSession>> {
        let mut sessions: Vec<ChatSession> = self.chat_sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        Ok(sessions)
    }

    async fn create_browser_session(&self, session: BrowserSession) -> StoreResult<()> {
        self.browser_sessions_by_remote_id
            .insert(session.remote_session_id.clone(), session.id);
        self.browser_sessions.insert(session.id, session);
        Ok(())
    }

    async fn get_browser_session(&self, id: Uuid) -> StoreResult<BrowserSession> {
        self.browser_sessions
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("browser session {id}")))
    }

    async fn get_browser_session_by_remote_id(&self, remote_session_id: &str) -> StoreResult<BrowserSession> {
        let id = *self
            .browser_sessions_by_remote_id
            .get(remote_session_id)
            .ok_or_else(|| StoreError::NotFound(format!("browser session for remote id {remote_session_id}")))?;
        self.get_browser_session(id).await
    }

    async fn update_browser_session(&self, session: BrowserSession) -> StoreResult<()> {
        self.browser_sessions_by_remote_id
            .insert(session.remote_session_id.clone(), session.id);
        self.browser_sessions.insert(session.id, session);
        Ok(())
    }

    async fn create_task(&self, task: Task) -> StoreResult<()> {
        self.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> StoreResult<Task> {
        self.tasks
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))
    }

    async fn update_task(&self, task: Task) -> StoreResult<()> {
        self.tasks.insert(task.id, task);
        Ok(())
    }

    async fn latest_resumable_task(&self, chat_session_id: Uuid) -> StoreResult<Option<Task>> {
        // The newest task in the session wins regardless of status; it's
        // only returned if *that* task's status is resumable — a task
        // sitting one slot back in {stopped, paused, failed} does not
        // resurrect once a newer task has moved past it.
        let newest = self.tasks_for_chat_session(chat_session_id).await?.pop();
        Ok(newest.filter(|t| t.status.is_resumable()))
    }

    async fn running_task(&self, chat_session_id: Uuid) -> StoreResult<Option<Task>> {
        Ok(self
            .tasks
            .iter()
            .find(|e| e.chat_session_id == chat_session_id && e.status == super::TaskStatus::Running)
            .map(|e| e.value().clone()))
    }

    async fn tasks_for_chat_session(&self, chat_session_id: Uuid) -> StoreResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.iter().filter(|e| e.chat_session_id == chat_session_id).map(|e| e.value().clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn create_batch_execution(&self, batch: BatchExecution) -> StoreResult<()> {
        self.batches.insert(batch.id, batch);
        Ok(())
    }

    async fn get_batch_execution(&self, id: Uuid) -> StoreResult<BatchExecution> {
        self.batches
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("batch execution {id}")))
    }

    async fn update_batch_execution(&self, batch: BatchExecution) -> StoreResult<()> {
        self.batches.insert(batch.id, batch);
        Ok(())
    }

    async fn append_message(&self, message: Message) -> StoreResult<()> {
        self.messages.entry(message.task_id).or_default().push(message);
        Ok(())
    }

    async fn messages_for_task(&self, task_id: Uuid) -> StoreResult<Vec<Message>> {
        let mut messages = self.messages.get(&task_id).map(|e| e.value().clone()).unwrap_or_default();
        messages.sort_by_key(|m| m.iteration);
        Ok(messages)
    }

    async fn last_message_for_task(&self, task_id: Uuid) -> StoreResult<Option<Message>> {
        Ok(self.messages.get(&task_id).and_then(|e| e.value().last().cloned()))
    }

    async fn append_performance_metric(&self, metric: PerformanceMetric) -> StoreResult<()> {
        self.metrics.entry(metric.task_id).or_default().push(metric);
        Ok(())
    }

    async fn performance_metrics_for_task(&self, task_id: Uuid) -> StoreResult<Vec<PerformanceMetric>> {
        Ok(self.metrics.get(&task_id).map(|e| e.value().clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_resumable_task_picks_the_newest() {
        let store = InMemoryStateStore::new();
        let chat = store.create_chat_session().await.unwrap();

        let mut older = Task::new(chat.id, "first".into(), 35);
        older.status = super::super::TaskStatus::Stopped;
        store.create_task(older.clone()).await.unwrap();

        let mut newer = Task::new(chat.id, "second".into(), 35);
        newer.status = super::super::TaskStatus::Failed;
        store.create_task(newer.clone()).await.unwrap();

        let resumable = store.latest_resumable_task(chat.id).await.unwrap().unwrap();
        assert_eq!(resumable.id, newer.id);
    }

    #[tokio::test]
    async fn latest_resumable_task_is_none_when_the_newest_task_is_not_resumable() {
        let store = InMemoryStateStore::new();
        let chat = store.create_chat_session().await.unwrap();

        let mut stopped = Task::new(chat.id, "first".into(), 35);
        stopped.status = super::super::TaskStatus::Stopped;
        store.create_task(stopped.clone()).await.unwrap();

        // Ensure the second task sorts strictly after the first.
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;

        let mut completed = Task::new(chat.id, "second".into(), 35);
        completed.status = super::super::TaskStatus::Completed;
        store.create_task(completed.clone()).await.unwrap();

        // The most recent task (`completed`) isn't resumable, so no task in
        // this session should be returned even though an older one is.
        assert!(store.latest_resumable_task(chat.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn messages_for_task_are_ordered_by_iteration() {
        let store = InMemoryStateStore::new();
        let task_id = Uuid::new_v4();
        for i in [2u32, 0, 1] {
            store
                .append_message(Message::new(task_id, crate::conversation::Role::User, vec![], i))
                .await
                .unwrap();
        }
        let messages = store.messages_for_task(task_id).await.unwrap();
        let iterations: Vec<u32> = messages.iter().map(|m| m.iteration).collect();
        assert_eq!(iterations, vec![0, 1, 2]);
    }
}
