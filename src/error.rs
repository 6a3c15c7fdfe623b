//! Crate-wide error kinds.
//!
//! Mirrors the error-kind taxonomy the runtime is built around: each
//! variant here corresponds to a boundary a caller needs to react to
//! differently (retry, surface to the model, or fail the task outright).
//! Narrower per-module errors (`BrowserError`, `ModelError`, `StoreError`)
//! convert into `CoreError` via `#[from]` rather than being matched
//! directly by callers several layers up.

use thiserror::Error;

/// Top-level error type for the agent runtime.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A single remote-browser action failed. Not retried by the core;
    /// surfaced to the model as a tool result with `is_error = true`.
    #[error("tool action failed: {0}")]
    TransientTool(String),

    /// Screenshot timed out on every tab in the session.
    #[error("page unresponsive: {0}")]
    PageUnresponsive(String),

    /// No live entry exists for a remote session id.
    #[error("session lost: {0}")]
    SessionLost(String),

    /// The model port failed to produce a response.
    #[error("model error: {0}")]
    Model(String),

    /// A state-store write or read failed.
    #[error("store error: {0}")]
    Store(String),

    /// Bearer-token authentication failed on the batch endpoint.
    #[error("unauthorized: {0}")]
    Auth(String),

    /// Request validation failed; `field` names the offending field.
    #[error("validation error on `{field}`: {message}")]
    Validation { field: String, message: String },

    /// Not an error: a clean, cooperative break of the sampling loop.
    #[error("stop requested")]
    StopRequested,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<crate::browser::BrowserError> for CoreError {
    fn from(err: crate::browser::BrowserError) -> Self {
        CoreError::TransientTool(err.to_string())
    }
}

impl From<crate::model::ModelError> for CoreError {
    fn from(err: crate::model::ModelError) -> Self {
        CoreError::Model(err.to_string())
    }
}

impl From<crate::store::StoreError> for CoreError {
    fn from(err: crate::store::StoreError) -> Self {
        CoreError::Store(err.to_string())
    }
}

impl From<crate::session_manager::SessionManagerError> for CoreError {
    fn from(err: crate::session_manager::SessionManagerError) -> Self {
        CoreError::TransientTool(err.to_string())
    }
}

impl From<crate::memory_port::MemoryError> for CoreError {
    fn from(err: crate::memory_port::MemoryError) -> Self {
        CoreError::TransientTool(err.to_string())
    }
}

impl From<crate::object_store::ObjectStoreError> for CoreError {
    fn from(err: crate::object_store::ObjectStoreError) -> Self {
        CoreError::Store(err.to_string())
    }
}
