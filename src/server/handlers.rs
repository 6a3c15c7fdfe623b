//! Handler bodies for each route in [`super::router`]. Grouped by the
//! resource spec.md §6 groups them under: chat/streaming, batch
//! execution, task control, session/dashboard reads, browser passthroughs.

use super::{ApiError, AppState};
use crate::browser::CreateOptions;
use crate::config::ConfigOverrides;
use crate::error::CoreError;
use crate::event_stream;
use crate::sampling_loop::StreamEvent;
use crate::store::{BatchExecution, BatchStatus, ChatSession, StoreError};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

fn store_err(err: StoreError) -> ApiError {
    ApiError(CoreError::from(err))
}

// ---------------------------------------------------------------- chat

#[derive(Debug, Deserialize)]
pub struct ChatMessageInput {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessageInput>,
    pub session_id: Option<Uuid>,
    pub browser_session_id: Option<String>,
    pub continue_agent: Option<bool>,
    pub stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    message: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Uuid,
    #[serde(rename = "browserSessionId")]
    browser_session_id: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "streamUrl")]
    stream_url: Option<String>,
    status: String,
    timestamp: chrono::DateTime<Utc>,
}

/// `POST /chat` (spec.md §6). Streams SSE by default; returns a
/// collected JSON summary when `stream:false` is requested.
pub async fn chat(State(state): State<Arc<AppState>>, Json(body): Json<ChatRequest>) -> Result<Response, ApiError> {
    let chat_session = match body.session_id {
        Some(id) => state.store.get_chat_session(id).await.map_err(store_err)?,
        None => state.store.create_chat_session().await.map_err(store_err)?,
    };

    let browser_session = match &body.browser_session_id {
        Some(remote_id) => state.store.get_browser_session_by_remote_id(remote_id).await.map_err(store_err)?,
        None => state.sessions.create(chat_session.id, CreateOptions::default()).await.map_err(|e| ApiError(e.into()))?,
    };

    let user_message = body
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .unwrap_or_default();

    let (tx, mut rx) = mpsc::channel(256);

    let task = if body.continue_agent.unwrap_or(false) {
        state.coordinator.resume(chat_session.id, browser_session.remote_session_id.clone(), tx.clone()).await?
    } else {
        state
            .coordinator
            .create(chat_session.id, user_message, browser_session.remote_session_id.clone(), ConfigOverrides::default(), tx.clone())
            .await?
    };

    let _ = tx.try_send(StreamEvent::Metadata {
        session_id: chat_session.id,
        browser_session_id: browser_session.remote_session_id.clone(),
        stream_url: browser_session.live_view_url.clone(),
        task_id: task.id,
        timestamp: Utc::now(),
    });

    if body.stream.unwrap_or(true) {
        let stream = event_stream::sse_stream(rx);
        return Ok(Sse::new(stream).into_response());
    }

    let mut final_message = None;
    let mut status = "running".to_string();
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Done { final_response, .. } => {
                final_message = final_response;
                break;
            }
            StreamEvent::TaskStatus { status: s, .. } => status = format!("{s:?}").to_lowercase(),
            StreamEvent::Error { message, .. } => {
                final_message = Some(message);
                status = "failed".into();
                break;
            }
            _ => {}
        }
    }

    Ok(Json(ChatResponse {
        message: final_message,
        session_id: chat_session.id,
        browser_session_id: browser_session.remote_session_id,
        stream_url: None,
        status,
        timestamp: Utc::now(),
    })
    .into_response())
}

// --------------------------------------------------------- batch execute

#[derive(Debug, Deserialize)]
pub struct BatchTaskRequest {
    pub message: String,
    #[serde(default)]
    pub config_overrides: ConfigOverrides,
    #[serde(default)]
    pub destroy_browser_on_completion: bool,
}

#[derive(Debug, Deserialize)]
pub struct BatchExecutionRequest {
    pub tasks: Vec<BatchTaskRequest>,
    #[serde(default)]
    pub global_config_overrides: ConfigOverrides,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct BatchExecutionAccepted {
    #[serde(rename = "batchExecutionId")]
    batch_execution_id: Uuid,
    #[serde(rename = "sessionId")]
    session_id: Uuid,
    #[serde(rename = "browserSessionId")]
    browser_session_id: String,
    #[serde(rename = "taskIds")]
    task_ids: Vec<Uuid>,
    status: String,
    timestamp: chrono::DateTime<Utc>,
}

/// `POST /tasks/execute` (spec.md §6). Bearer-token gated; execution runs
/// in the background and reports progress exclusively via webhooks.
pub async fn execute_batch(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(body): Json<BatchExecutionRequest>) -> Result<Response, ApiError> {
    require_bearer_token(&headers)?;

    let chat_session = state.store.create_chat_session().await.map_err(store_err)?;

    let task_inputs: Vec<crate::batch_executor::BatchTaskInput> = body
        .tasks
        .iter()
        .map(|t| crate::batch_executor::BatchTaskInput {
            task_id: Uuid::new_v4(),
            message: t.message.clone(),
            config_overrides: t.config_overrides.clone(),
            destroy_browser_on_completion: t.destroy_browser_on_completion,
        })
        .collect();
    let task_ids: Vec<Uuid> = task_inputs.iter().map(|t| t.task_id).collect();

    let batch = BatchExecution {
        id: Uuid::new_v4(),
        chat_session_id: chat_session.id,
        browser_session_id: None,
        total: task_inputs.len(),
        completed_count: 0,
        failed_count: 0,
        status: BatchStatus::Running,
        webhook_url: body.webhook_url.clone(),
        webhook_secret: body.webhook_secret.clone(),
        global_config_overrides: body.global_config_overrides.clone(),
        created_at: Utc::now(),
    };
    state.store.create_batch_execution(batch.clone()).await.map_err(store_err)?;

    let executor = state.batch_executor.clone();
    let batch_id = batch.id;
    let global_overrides = body.global_config_overrides.clone();
    let webhook_url = body.webhook_url.clone();
    let webhook_secret = body.webhook_secret.clone();
    tokio::spawn(async move {
        if let Err(e) = executor.run(batch_id, chat_session.id, task_inputs, global_overrides, webhook_url, webhook_secret).await {
            tracing::warn!(batch_execution_id = %batch_id, error = %e, "batch execution harness failed");
        }
    });

    let response = BatchExecutionAccepted {
        batch_execution_id: batch.id,
        session_id: batch.chat_session_id,
        browser_session_id: "pending".to_string(),
        task_ids,
        status: "running".to_string(),
        timestamp: Utc::now(),
    };
    Ok((StatusCode::ACCEPTED, Json(response)).into_response())
}

fn require_bearer_token(headers: &HeaderMap) -> Result<(), ApiError> {
    // Fail closed: an unconfigured API_KEY_SECRET must not be read as "auth
    // disabled" (spec.md §6 lists it required for this endpoint, §7 defines
    // AuthError as a standing 401 on it).
    let Some(secret) = crate::config::api_key_secret() else {
        return Err(ApiError(CoreError::Auth("API_KEY_SECRET is not configured; batch endpoint is disabled".into())));
    };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == secret => Ok(()),
        _ => Err(ApiError(CoreError::Auth("missing or invalid bearer token".into()))),
    }
}

// ----------------------------------------------------------- task control

pub async fn stop_task(State(state): State<Arc<AppState>>, Path(task_id): Path<Uuid>) -> Result<Response, ApiError> {
    state.coordinator.stop(task_id).await?;
    Ok(Json(json!({ "ok": true })).into_response())
}

pub async fn get_task(State(state): State<Arc<AppState>>, Path(task_id): Path<Uuid>) -> Result<Response, ApiError> {
    let task = state.store.get_task(task_id).await.map_err(store_err)?;
    Ok(Json(task).into_response())
}

// ------------------------------------------------------ sessions/dashboard

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let sessions = state.store.list_chat_sessions().await.map_err(store_err)?;
    Ok(Json(sessions).into_response())
}

pub async fn get_session(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<Response, ApiError> {
    let session = state.store.get_chat_session(id).await.map_err(store_err)?;
    Ok(Json(session).into_response())
}

#[derive(Debug, Deserialize)]
pub struct PatchSessionRequest {
    pub metadata: Option<serde_json::Value>,
}

pub async fn patch_session(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>, Json(body): Json<PatchSessionRequest>) -> Result<Response, ApiError> {
    let mut session: ChatSession = state.store.get_chat_session(id).await.map_err(store_err)?;
    if let Some(metadata) = body.metadata {
        session.metadata = metadata;
    }
    session.updated_at = Utc::now();
    state.store.update_chat_session(session.clone()).await.map_err(store_err)?;
    Ok(Json(session).into_response())
}

pub async fn tasks_for_session(State(state): State<Arc<AppState>>, Path(session_id): Path<Uuid>) -> Result<Response, ApiError> {
    let tasks = state.store.tasks_for_chat_session(session_id).await.map_err(store_err)?;
    Ok(Json(tasks).into_response())
}

pub async fn iterations_for_task(State(state): State<Arc<AppState>>, Path(task_id): Path<Uuid>) -> Result<Response, ApiError> {
    let metrics = state.store.performance_metrics_for_task(task_id).await.map_err(store_err)?;
    Ok(Json(metrics).into_response())
}

// -------------------------------------------------------- browser passthroughs

pub async fn browser_disconnect_cdp(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Response, ApiError> {
    state.sessions.disconnect_cdp(&id).await.map_err(|e| ApiError(e.into()))?;
    Ok(Json(json!({ "ok": true })).into_response())
}

pub async fn browser_reconnect_cdp(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Response, ApiError> {
    state.sessions.reconnect_cdp(&id).await.map_err(|e| ApiError(e.into()))?;
    Ok(Json(json!({ "ok": true })).into_response())
}

pub async fn browser_destroy(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Response, ApiError> {
    state.sessions.destroy(&id).await.map_err(|e| ApiError(e.into()))?;
    Ok(Json(json!({ "ok": true })).into_response())
}

pub async fn browser_screenshot(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let png = state.sessions.screenshot(&id).await.map_err(|e| ApiError(e.into()))?;
    Ok(([(axum::http::header::CONTENT_TYPE, "image/png")], png).into_response())
}

/// `POST /browser/{id}/{stop|pause|resume|screenshot}` (spec.md §6). Only
/// `screenshot` has a dedicated core operation; `stop`/`resume` flip the
/// stored `BrowserSession.status` (there is no session-level pause in the
/// core — pausing a run lives at the Task layer via `stop_task`).
pub async fn browser_lifecycle_action(State(state): State<Arc<AppState>>, Path((id, action)): Path<(String, String)>) -> Result<Response, ApiError> {
    match action.as_str() {
        "screenshot" => browser_screenshot(State(state), Path(id)).await,
        "stop" | "pause" => set_browser_session_status(&state, &id, crate::store::BrowserSessionStatus::Stopped).await,
        "resume" => set_browser_session_status(&state, &id, crate::store::BrowserSessionStatus::Active).await,
        other => Err(ApiError(CoreError::Validation { field: "action".into(), message: format!("unknown browser action `{other}`") })),
    }
}

async fn set_browser_session_status(state: &AppState, remote_session_id: &str, status: crate::store::BrowserSessionStatus) -> Result<Response, ApiError> {
    let mut session = state.store.get_browser_session_by_remote_id(remote_session_id).await.map_err(store_err)?;
    session.status = status;
    state.store.update_browser_session(session).await.map_err(store_err)?;
    Ok(Json(json!({ "ok": true })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_browser_action_is_a_validation_error() {
        let err = CoreError::Validation { field: "action".into(), message: "unknown browser action `jump`".into() };
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    // `API_KEY_SECRET` is process-global; serialize the two tests that touch it
    // so they can't interleave with each other under a parallel test runner.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn require_bearer_token_fails_closed_when_secret_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("API_KEY_SECRET");

        let headers = HeaderMap::new();
        let err = require_bearer_token(&headers).unwrap_err();
        assert!(matches!(err.0, CoreError::Auth(_)));
    }

    #[test]
    fn require_bearer_token_accepts_matching_secret() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("API_KEY_SECRET", "topsecret");

        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer topsecret".parse().unwrap());
        assert!(require_bearer_token(&headers).is_ok());

        std::env::remove_var("API_KEY_SECRET");
    }
}
