//! `RemoteBrowserPort` (spec.md §4.A) — the boundary to the remote debugging
//! protocol. Grounded on the teacher's `browser_setup::launch_browser`
//! (Chrome discovery, managed-fetcher fallback, stealth flags, sandbox
//! detection) and `browser::wrapper::BrowserWrapper` (Drop-based handler/
//! profile cleanup), generalized from a single shared local browser to many
//! independently addressed remote sessions.

mod chromium;
mod keys;

pub use chromium::ChromiumBrowserPort;
pub use keys::canonicalize_key_combo;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use std::time::Duration;

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("failed to launch remote browser: {0}")]
    Launch(String),
    #[error("failed to connect debugger: {0}")]
    Connect(String),
    #[error("page unresponsive: {0}")]
    PageUnresponsive(String),
    #[error("no tab available")]
    NoTab,
    #[error("action failed: {0}")]
    Action(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("remote session not found: {0}")]
    NotFound(String),
}

pub type BrowserResult<T> = Result<T, BrowserError>;

/// Options passed to `RemoteBrowserPort::create` (spec.md §4.A).
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub timeout: Duration,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub stealth: bool,
    /// Reuse a named persistent profile directory across sessions when
    /// `BROWSER_PERSISTENCE` is enabled.
    pub persistent_profile: Option<String>,
    /// Bind a persistent remote session to a `ChatSession` so the same
    /// remote browser is reused on reconnect.
    pub persistence_id: Option<uuid::Uuid>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            viewport_width: 1920,
            viewport_height: 1080,
            stealth: true,
            persistent_profile: None,
            persistence_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub remote_session_id: String,
    pub debugger_ws_url: String,
    pub live_view_url: String,
}

/// Mouse button for `click` (spec.md §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Events a connection handle may surface to `SessionManager` (spec.md §4.A).
#[derive(Debug, Clone)]
pub enum BrowserEvent {
    Disconnected,
    PageOpened { page_id: String, url: String },
    PageClosed { page_id: String },
    DownloadWillBegin { filename: String, path: String },
    DownloadProgress { filename: String, progress_pct: f32, status: DownloadStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Started,
    InProgress,
    Completed,
    Failed,
}

/// The boundary `SessionManager` calls to drive one remote tab (spec.md §4.A).
///
/// All tab-scoped methods operate against an opaque `page_id` so callers
/// (`SessionManager`) own tab-stack bookkeeping; this port never tracks
/// which tab is "active".
#[async_trait]
pub trait RemoteBrowserPort: Send + Sync {
    async fn create(&self, options: CreateOptions) -> BrowserResult<CreatedSession>;

    /// Connect a debugger session and return the ids of tabs already open.
    async fn connect(&self, debugger_ws_url: &str) -> BrowserResult<Vec<String>>;

    /// Drain events queued since the last poll for a connected session.
    /// A real implementation backs this with a subscription channel; the
    /// cooperative-poll shape keeps `SessionManager` the single actor that
    /// observes and reacts to connection events (spec.md §9 "Session
    /// registry").
    async fn poll_events(&self, remote_session_id: &str) -> BrowserResult<Vec<BrowserEvent>>;

    async fn click(&self, remote_session_id: &str, page_id: &str, x: f64, y: f64, button: MouseButton, clicks: u32) -> BrowserResult<()>;
    async fn move_mouse(&self, remote_session_id: &str, page_id: &str, x: f64, y: f64) -> BrowserResult<()>;
    async fn scroll(&self, remote_session_id: &str, page_id: &str, x: f64, y: f64, dx: f64, dy: f64) -> BrowserResult<()>;
    async fn type_text(&self, remote_session_id: &str, page_id: &str, text: &str, per_char_delay: Duration) -> BrowserResult<()>;
    async fn press(&self, remote_session_id: &str, page_id: &str, key_combo: &str) -> BrowserResult<()>;

    /// Must return within `deadline` or produce `BrowserError::PageUnresponsive`
    /// (spec.md §4.A "Key contracts").
    async fn screenshot(&self, remote_session_id: &str, page_id: &str, deadline: Duration) -> BrowserResult<Vec<u8>>;

    async fn list_files(&self, remote_session_id: &str, path: &str) -> BrowserResult<Vec<String>>;
    async fn read_file(&self, remote_session_id: &str, path: &str) -> BrowserResult<Vec<u8>>;

    async fn destroy(&self, remote_session_id: &str) -> BrowserResult<()>;
}
