//! Thin `axum` HTTP layer (spec.md §6 "HTTP endpoints (shape, not
//! framework)") wiring the core ports to routable handlers. Present
//! because the teacher always ships an HTTP binary alongside its
//! library, not because routing/auth is in scope — the only
//! authentication this layer does is the single bearer-token check
//! spec.md §6 names for the batch endpoint.
//!
//! `AppState` + `router(state)` follows `hi-youichi-loom/serve/src/app.rs`'s
//! shape: one `Arc`-wrapped state struct, `Router::new().route(...).with_state(state)`.

mod handlers;

use crate::batch_executor::BatchExecutor;
use crate::config::ExecutionConfig;
use crate::error::CoreError;
use crate::session_manager::SessionManager;
use crate::store::StateStore;
use crate::task_coordinator::TaskCoordinator;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<TaskCoordinator>,
    pub batch_executor: Arc<BatchExecutor>,
    pub sessions: Arc<SessionManager>,
    pub store: Arc<dyn StateStore>,
    pub base_config: ExecutionConfig,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat", post(handlers::chat))
        .route("/tasks/execute", post(handlers::execute_batch))
        .route("/tasks/:task_id/stop", post(handlers::stop_task))
        .route("/tasks/:task_id", get(handlers::get_task))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/:id", get(handlers::get_session).patch(handlers::patch_session))
        .route("/dashboard/sessions", get(handlers::list_sessions))
        .route("/dashboard/tasks/:session_id", get(handlers::tasks_for_session))
        .route("/dashboard/iterations/:task_id", get(handlers::iterations_for_task))
        .route("/browser/:id/disconnect-cdp", post(handlers::browser_disconnect_cdp))
        .route("/browser/:id/reconnect-cdp", post(handlers::browser_reconnect_cdp))
        .route("/browser/:id/destroy", post(handlers::browser_destroy))
        .route("/browser/:id/screenshot", get(handlers::browser_screenshot))
        .route("/browser/:id/:action", post(handlers::browser_lifecycle_action))
        .with_state(state)
}

/// Wraps `CoreError` for use as an axum handler error type, mapping each
/// variant to the HTTP status a caller would expect (spec.md §7's kinds
/// mapped onto conventional REST semantics — not itself part of the
/// spec, since routing/auth is explicitly out of scope).
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation { .. } => StatusCode::BAD_REQUEST,
            CoreError::Auth(_) => StatusCode::UNAUTHORIZED,
            CoreError::SessionLost(_) | CoreError::PageUnresponsive(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::StopRequested => StatusCode::OK,
            CoreError::TransientTool(_) | CoreError::Model(_) | CoreError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
