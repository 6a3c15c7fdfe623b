//! `SessionManager` (spec.md §4.B) — owns the live, process-local table of
//! connected remote browser sessions.
//!
//! Grounded on the teacher's `research::session_manager::ResearchSessionManager`
//! for the concurrency shape (`DashMap` + `Arc<tokio::sync::Mutex<_>>` per
//! entry, so one session's mutation never blocks another's) and on
//! `manager::BrowserManager` for the lazy-launch / fallback-on-failure
//! pattern used by `screenshot`.

use crate::browser::{BrowserError, BrowserEvent, BrowserResult, CreateOptions, DownloadStatus, MouseButton, RemoteBrowserPort};
use crate::store::{BrowserSession, BrowserSessionStatus, StateStore, StoreError};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

const SCREENSHOT_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SessionManagerError {
    #[error("remote session not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid action arguments: {0}")]
    InvalidAction(String),
}

pub type SessionManagerResult<T> = Result<T, SessionManagerError>;

#[derive(Debug, Clone)]
struct DownloadRecord {
    filename: String,
    path: String,
    status: DownloadStatus,
    progress_pct: f32,
}

/// The in-process counterpart of a `BrowserSession` row (spec.md §4.B).
struct LiveSession {
    remote_session_id: String,
    debugger_ws_url: String,
    live_view_url: String,
    /// Ordered oldest-to-newest; the last entry is the most recently opened.
    tabs: Vec<String>,
    active_tab: Option<String>,
    downloads: Vec<DownloadRecord>,
    intentional_disconnect: bool,
    last_cursor: (f64, f64),
}

impl LiveSession {
    fn push_tab(&mut self, page_id: String) {
        self.tabs.push(page_id.clone());
        self.active_tab = Some(page_id);
    }

    fn remove_tab(&mut self, page_id: &str) {
        self.tabs.retain(|t| t != page_id);
        if self.active_tab.as_deref() == Some(page_id) {
            self.active_tab = self.tabs.last().cloned();
        }
    }
}

/// Typed action dispatched through `SessionManager::perform` (spec.md §4.B).
#[derive(Debug, Clone)]
pub enum Action {
    LeftClick { x: f64, y: f64 },
    RightClick { x: f64, y: f64 },
    DoubleClick { x: f64, y: f64 },
    MouseMove { x: f64, y: f64 },
    Scroll { x: f64, y: f64, dx: f64, dy: f64 },
    Type { text: String, per_char_delay: Duration },
    Key { combo: String },
    Wait { duration: Duration },
    CursorPosition,
    Screenshot,
}

#[derive(Debug, Clone)]
pub enum ActionOutcome {
    Ack,
    CursorPosition { x: f64, y: f64 },
    Screenshot(Vec<u8>),
}

/// Metadata returned by `SessionManager::get` (spec.md §4.B operation 2).
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub status: BrowserSessionStatus,
    pub live_view_url: String,
    pub debugger_ws_url: String,
    pub created_at: chrono::DateTime<Utc>,
}

pub struct SessionManager {
    browser: Arc<dyn RemoteBrowserPort>,
    store: Arc<dyn StateStore>,
    live: DashMap<String, Arc<Mutex<LiveSession>>>,
}

impl SessionManager {
    pub fn new(browser: Arc<dyn RemoteBrowserPort>, store: Arc<dyn StateStore>) -> Self {
        Self { browser, store, live: DashMap::new() }
    }

    /// Allocate a remote browser, open a debugger connection, take the
    /// first tab as active, and persist the `BrowserSession` row.
    pub async fn create(&self, chat_session_id: Uuid, options: CreateOptions) -> SessionManagerResult<BrowserSession> {
        let created = self.browser.create(options.clone()).await?;
        let tabs = self.browser.connect(&created.debugger_ws_url).await?;
        let active_tab = tabs.first().cloned();

        let live = LiveSession {
            remote_session_id: created.remote_session_id.clone(),
            debugger_ws_url: created.debugger_ws_url.clone(),
            live_view_url: created.live_view_url.clone(),
            tabs,
            active_tab,
            downloads: Vec::new(),
            intentional_disconnect: false,
            last_cursor: (0.0, 0.0),
        };
        self.live.insert(created.remote_session_id.clone(), Arc::new(Mutex::new(live)));

        let row = BrowserSession {
            id: Uuid::new_v4(),
            chat_session_id,
            remote_session_id: created.remote_session_id.clone(),
            debugger_ws_url: created.debugger_ws_url,
            live_view_url: created.live_view_url,
            cdp_connected: true,
            cdp_disconnected_at: None,
            last_activity_at: Utc::now(),
            status: BrowserSessionStatus::Active,
            created_at: Utc::now(),
        };
        self.store.create_browser_session(row.clone()).await?;
        info!(remote_session_id = %created.remote_session_id, "browser session created");
        Ok(row)
    }

    /// Remote session ids currently tracked in the live table, used to
    /// drive the background `poll_events` cadence (spec.md §4.B).
    pub fn live_session_ids(&self) -> Vec<String> {
        self.live.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn get(&self, remote_session_id: &str) -> SessionManagerResult<SessionInfo> {
        let row = self.store.get_browser_session_by_remote_id(remote_session_id).await?;
        Ok(SessionInfo {
            status: row.status,
            live_view_url: row.live_view_url,
            debugger_ws_url: row.debugger_ws_url,
            created_at: row.created_at,
        })
    }

    fn live_session(&self, remote_session_id: &str) -> SessionManagerResult<Arc<Mutex<LiveSession>>> {
        self.live
            .get(remote_session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionManagerError::NotFound(remote_session_id.to_string()))
    }

    /// Attempt the active tab under a short deadline; fall back to other
    /// tabs in the stack; on total failure, refresh the page list and retry
    /// once before raising (spec.md §4.B operation 3).
    pub async fn screenshot(&self, remote_session_id: &str) -> SessionManagerResult<Vec<u8>> {
        let live = self.live_session(remote_session_id)?;
        let candidates = {
            let guard = live.lock().await;
            let mut ordered = Vec::new();
            ordered.extend(guard.active_tab.clone());
            ordered.extend(guard.tabs.iter().rev().filter(|t| guard.active_tab.as_deref() != Some(t)).cloned());
            ordered
        };

        for page_id in &candidates {
            match self.browser.screenshot(remote_session_id, page_id, SCREENSHOT_DEADLINE).await {
                Ok(bytes) => {
                    self.touch_activity(remote_session_id).await;
                    return Ok(bytes);
                }
                Err(e) => warn!(remote_session_id, page_id, error = %e, "screenshot failed on tab, trying next"),
            }
        }

        let refreshed = self.browser.connect(&{
            let guard = live.lock().await;
            guard.debugger_ws_url.clone()
        }).await?;
        {
            let mut guard = live.lock().await;
            guard.tabs = refreshed.clone();
            guard.active_tab = refreshed.last().cloned();
        }
        if let Some(page_id) = refreshed.last() {
            if let Ok(bytes) = self.browser.screenshot(remote_session_id, page_id, SCREENSHOT_DEADLINE).await {
                self.touch_activity(remote_session_id).await;
                return Ok(bytes);
            }
        }

        Err(SessionManagerError::Browser(BrowserError::PageUnresponsive(remote_session_id.to_string())))
    }

    pub async fn perform(&self, remote_session_id: &str, action: Action) -> SessionManagerResult<ActionOutcome> {
        let live = self.live_session(remote_session_id)?;
        let page_id = {
            let guard = live.lock().await;
            guard.active_tab.clone().ok_or(SessionManagerError::Browser(BrowserError::NoTab))?
        };

        let outcome = match action {
            Action::LeftClick { x, y } => {
                self.browser.click(remote_session_id, &page_id, x, y, MouseButton::Left, 1).await?;
                live.lock().await.last_cursor = (x, y);
                ActionOutcome::Ack
            }
            Action::RightClick { x, y } => {
                self.browser.click(remote_session_id, &page_id, x, y, MouseButton::Right, 1).await?;
                live.lock().await.last_cursor = (x, y);
                ActionOutcome::Ack
            }
            Action::DoubleClick { x, y } => {
                self.browser.click(remote_session_id, &page_id, x, y, MouseButton::Left, 2).await?;
                live.lock().await.last_cursor = (x, y);
                ActionOutcome::Ack
            }
            Action::MouseMove { x, y } => {
                self.browser.move_mouse(remote_session_id, &page_id, x, y).await?;
                live.lock().await.last_cursor = (x, y);
                ActionOutcome::Ack
            }
            Action::Scroll { x, y, dx, dy } => {
                self.browser.scroll(remote_session_id, &page_id, x, y, dx, dy).await?;
                ActionOutcome::Ack
            }
            Action::Type { text, per_char_delay } => {
                self.browser.type_text(remote_session_id, &page_id, &text, per_char_delay).await?;
                ActionOutcome::Ack
            }
            Action::Key { combo } => {
                self.browser.press(remote_session_id, &page_id, &combo).await?;
                ActionOutcome::Ack
            }
            Action::Wait { duration } => {
                tokio::time::sleep(duration).await;
                ActionOutcome::Ack
            }
            Action::CursorPosition => {
                let (x, y) = live.lock().await.last_cursor;
                ActionOutcome::CursorPosition { x, y }
            }
            Action::Screenshot => ActionOutcome::Screenshot(self.screenshot(remote_session_id).await?),
        };

        self.touch_activity(remote_session_id).await;
        Ok(outcome)
    }

    async fn touch_activity(&self, remote_session_id: &str) {
        if let Ok(mut row) = self.store.get_browser_session_by_remote_id(remote_session_id).await {
            row.last_activity_at = Utc::now();
            if let Err(e) = self.store.update_browser_session(row).await {
                warn!(remote_session_id, error = %e, "failed to persist last-activity timestamp");
            }
        }
    }

    /// Drain queued connection events and update the live table — new
    /// pages are pushed onto the tab stack, closed pages are popped, and
    /// an unsolicited `Disconnected` (not preceded by `disconnect_cdp`) is
    /// treated as unexpected (spec.md §4.B "Disconnection handling").
    pub async fn poll_events(&self, remote_session_id: &str) -> SessionManagerResult<()> {
        let live = self.live_session(remote_session_id)?;
        let events = self.browser.poll_events(remote_session_id).await?;
        for event in events {
            match event {
                BrowserEvent::PageOpened { page_id, .. } => live.lock().await.push_tab(page_id),
                BrowserEvent::PageClosed { page_id } => live.lock().await.remove_tab(&page_id),
                BrowserEvent::DownloadWillBegin { filename, path } => {
                    live.lock().await.downloads.push(DownloadRecord {
                        filename,
                        path,
                        status: DownloadStatus::Started,
                        progress_pct: 0.0,
                    });
                }
                BrowserEvent::DownloadProgress { filename, progress_pct, status } => {
                    let mut guard = live.lock().await;
                    if let Some(d) = guard.downloads.iter_mut().find(|d| d.filename == filename) {
                        d.progress_pct = progress_pct;
                        d.status = status;
                    }
                }
                BrowserEvent::Disconnected => {
                    let intentional = live.lock().await.intentional_disconnect;
                    if !intentional {
                        warn!(remote_session_id, "unexpected disconnect");
                        self.live.remove(remote_session_id);
                        if let Ok(mut row) = self.store.get_browser_session_by_remote_id(remote_session_id).await {
                            row.cdp_connected = false;
                            row.cdp_disconnected_at = Some(Utc::now());
                            let _ = self.store.update_browser_session(row).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// List downloaded artifacts under `path` (spec.md §4.A passthrough).
    pub async fn list_files(&self, remote_session_id: &str, path: &str) -> SessionManagerResult<Vec<String>> {
        Ok(self.browser.list_files(remote_session_id, path).await?)
    }

    pub async fn read_file(&self, remote_session_id: &str, path: &str) -> SessionManagerResult<Vec<u8>> {
        Ok(self.browser.read_file(remote_session_id, path).await?)
    }

    /// Close the debugger connection without killing the remote browser
    /// (spec.md §4.B operation 5 — "zero-cost standby").
    pub async fn disconnect_cdp(&self, remote_session_id: &str) -> SessionManagerResult<()> {
        if let Some(entry) = self.live.get(remote_session_id) {
            entry.value().lock().await.intentional_disconnect = true;
        }
        self.live.remove(remote_session_id);

        let mut row = self.store.get_browser_session_by_remote_id(remote_session_id).await?;
        row.cdp_connected = false;
        row.cdp_disconnected_at = Some(Utc::now());
        self.store.update_browser_session(row).await?;
        Ok(())
    }

    /// Reconnect using the persisted debugger URL, preferring a
    /// non-blank tab, else the most recently opened (spec.md §4.B
    /// operation 6).
    pub async fn reconnect_cdp(&self, remote_session_id: &str) -> SessionManagerResult<()> {
        let row = self.store.get_browser_session_by_remote_id(remote_session_id).await?;
        let tabs = self.browser.connect(&row.debugger_ws_url).await?;
        let active_tab = tabs.last().cloned();

        let live = LiveSession {
            remote_session_id: remote_session_id.to_string(),
            debugger_ws_url: row.debugger_ws_url.clone(),
            live_view_url: row.live_view_url.clone(),
            tabs,
            active_tab,
            downloads: Vec::new(),
            intentional_disconnect: false,
            last_cursor: (0.0, 0.0),
        };
        self.live.insert(remote_session_id.to_string(), Arc::new(Mutex::new(live)));

        let mut row = row;
        row.cdp_connected = true;
        row.last_activity_at = Utc::now();
        self.store.update_browser_session(row).await?;
        Ok(())
    }

    /// Close the debugger connection, destroy the remote browser, and
    /// mark the row stopped. Always attempts the remote destroy, even if
    /// the live entry is already gone (spec.md §4.B operation 7).
    pub async fn destroy(&self, remote_session_id: &str) -> SessionManagerResult<()> {
        self.live.remove(remote_session_id);
        let destroy_result = self.browser.destroy(remote_session_id).await;

        if let Ok(mut row) = self.store.get_browser_session_by_remote_id(remote_session_id).await {
            row.status = BrowserSessionStatus::Stopped;
            row.cdp_connected = false;
            self.store.update_browser_session(row).await?;
        }

        destroy_result?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserEvent, CreatedSession};
    use crate::store::InMemoryStateStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBrowser {
        screenshot_calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteBrowserPort for FakeBrowser {
        async fn create(&self, _options: CreateOptions) -> BrowserResult<CreatedSession> {
            Ok(CreatedSession {
                remote_session_id: "rs-1".into(),
                debugger_ws_url: "ws://fake".into(),
                live_view_url: "https://fake/live".into(),
            })
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
            self.screenshot_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1, 2, 3])
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

    fn make_manager() -> SessionManager {
        let browser = Arc::new(FakeBrowser { screenshot_calls: AtomicUsize::new(0) });
        let store = Arc::new(InMemoryStateStore::new());
        SessionManager::new(browser, store)
    }

    #[tokio::test]
    async fn create_then_screenshot_round_trips() {
        let manager = make_manager();
        let chat_session_id = Uuid::new_v4();
        let row = manager.create(chat_session_id, CreateOptions::default()).await.unwrap();
        let bytes = manager.screenshot(&row.remote_session_id).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn perform_cursor_position_tracks_last_click() {
        let manager = make_manager();
        let row = manager.create(Uuid::new_v4(), CreateOptions::default()).await.unwrap();
        manager.perform(&row.remote_session_id, Action::LeftClick { x: 10.0, y: 20.0 }).await.unwrap();
        let outcome = manager.perform(&row.remote_session_id, Action::CursorPosition).await.unwrap();
        match outcome {
            ActionOutcome::CursorPosition { x, y } => {
                assert_eq!(x, 10.0);
                assert_eq!(y, 20.0);
            }
            _ => panic!("expected CursorPosition"),
        }
    }

    #[tokio::test]
    async fn destroy_is_idempotent_when_live_entry_missing() {
        let manager = make_manager();
        let row = manager.create(Uuid::new_v4(), CreateOptions::default()).await.unwrap();
        manager.destroy(&row.remote_session_id).await.unwrap();
        assert!(manager.live.is_empty());
    }

    #[tokio::test]
    async fn get_returns_not_found_for_unknown_session() {
        let manager = make_manager();
        let err = manager.get("missing").await.unwrap_err();
        assert!(matches!(err, SessionManagerError::Store(StoreError::NotFound(_))));
    }

    struct ScriptedEventsBrowser {
        queued: Mutex<Vec<BrowserEvent>>,
    }

    #[async_trait]
    impl RemoteBrowserPort for ScriptedEventsBrowser {
        async fn create(&self, _options: CreateOptions) -> BrowserResult<CreatedSession> {
            Ok(CreatedSession {
                remote_session_id: "rs-1".into(),
                debugger_ws_url: "ws://fake".into(),
                live_view_url: "https://fake/live".into(),
            })
        }
        async fn connect(&self, _debugger_ws_url: &str) -> BrowserResult<Vec<String>> {
            Ok(vec!["page-1".into()])
        }
        async fn poll_events(&self, _remote_session_id: &str) -> BrowserResult<Vec<BrowserEvent>> {
            Ok(std::mem::take(&mut *self.queued.lock().await))
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
            Ok(vec![])
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

    #[tokio::test]
    async fn poll_events_tracks_new_tabs_and_unexpected_disconnect() {
        let browser = Arc::new(ScriptedEventsBrowser {
            queued: Mutex::new(vec![
                BrowserEvent::PageOpened { page_id: "page-2".into(), url: "https://example.com".into() },
                BrowserEvent::PageClosed { page_id: "page-1".into() },
            ]),
        });
        let store = Arc::new(InMemoryStateStore::new());
        let manager = SessionManager::new(browser.clone(), store.clone());
        let row = manager.create(Uuid::new_v4(), CreateOptions::default()).await.unwrap();

        manager.poll_events(&row.remote_session_id).await.unwrap();
        {
            let live = manager.live_session(&row.remote_session_id).unwrap();
            let guard = live.lock().await;
            assert_eq!(guard.tabs, vec!["page-2".to_string()]);
            assert_eq!(guard.active_tab.as_deref(), Some("page-2"));
        }

        *browser.queued.lock().await = vec![BrowserEvent::Disconnected];
        manager.poll_events(&row.remote_session_id).await.unwrap();
        assert!(manager.live.is_empty());
        let persisted = manager.store.get_browser_session_by_remote_id(&row.remote_session_id).await.unwrap();
        assert!(!persisted.cdp_connected);
    }
}
