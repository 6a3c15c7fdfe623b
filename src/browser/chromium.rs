//! `chromiumoxide`-backed `RemoteBrowserPort`.
//!
//! Grounded on the teacher's `browser_setup::launch_browser` (executable
//! discovery, managed-fetcher fallback, stealth args, sandbox detection) and
//! `browser::wrapper::BrowserWrapper` (handler-task lifecycle, Drop-based
//! profile cleanup). Each remote session owns its own `Browser` + handler
//! task, keyed by a synthesized `remote_session_id`, since this port stands
//! in for an actually-remote debugging endpoint the core only ever reaches
//! over its `debugger_ws_url` (spec.md §1 "the remote browser provider" is
//! out of scope; the wire contract — a CDP websocket — is what's implemented).

use super::{
    BrowserError, BrowserEvent, BrowserResult, CreateOptions, CreatedSession, DownloadStatus, MouseButton,
    canonicalize_key_combo,
};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide_cdp::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
    MouseButton as CdpMouseButton,
};
use chromiumoxide_cdp::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, DownloadProgressState, EventDownloadProgress, EventDownloadWillBegin,
};
use chromiumoxide_cdp::cdp::browser_protocol::target::{EventTargetCreated, EventTargetDestroyed};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use chromiumoxide::page::{Page, ScreenshotParams};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

const STEALTH_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

struct ManagedSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
    pages: DashMap<String, Page>,
    events: Arc<AsyncMutex<VecDeque<BrowserEvent>>>,
    event_tasks: Vec<JoinHandle<()>>,
    user_data_dir: Option<PathBuf>,
    download_dir: PathBuf,
}

impl Drop for ManagedSession {
    fn drop(&mut self) {
        self.handler_task.abort();
        for task in &self.event_tasks {
            task.abort();
        }
        if let Some(dir) = self.user_data_dir.take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!("failed to clean up profile dir {}: {e}", dir.display());
            }
        }
    }
}

pub struct ChromiumBrowserPort {
    sessions: DashMap<String, ManagedSession>,
}

impl Default for ChromiumBrowserPort {
    fn default() -> Self {
        Self::new()
    }
}

impl ChromiumBrowserPort {
    pub fn new() -> Self {
        Self { sessions: DashMap::new() }
    }

    async fn find_browser_executable() -> BrowserResult<PathBuf> {
        if let Ok(path) = std::env::var("CHROMIUM_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }
        let candidates: &[&str] = if cfg!(target_os = "macos") {
            &["/Applications/Google Chrome.app/Contents/MacOS/Google Chrome", "/Applications/Chromium.app/Contents/MacOS/Chromium"]
        } else if cfg!(target_os = "windows") {
            &[r"C:\Program Files\Google\Chrome\Application\chrome.exe"]
        } else {
            &["/usr/bin/google-chrome", "/usr/bin/google-chrome-stable", "/usr/bin/chromium", "/usr/bin/chromium-browser"]
        };
        for candidate in candidates {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Ok(path);
            }
        }
        for cmd in ["chromium", "chromium-browser", "google-chrome"] {
            if let Ok(output) = Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path_str.is_empty() {
                        return Ok(PathBuf::from(path_str));
                    }
                }
            }
        }
        Err(BrowserError::Launch("no local Chrome/Chromium executable found".into()))
    }

    async fn download_managed_browser() -> BrowserResult<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("browser_agent_core/chromium");
        std::fs::create_dir_all(&cache_dir).map_err(|e| BrowserError::Launch(e.to_string()))?;
        let fetcher = BrowserFetcher::new(
            BrowserFetcherOptions::builder()
                .with_path(&cache_dir)
                .build()
                .map_err(|e| BrowserError::Launch(e.to_string()))?,
        );
        let revision = fetcher.fetch().await.map_err(|e| BrowserError::Launch(e.to_string()))?;
        Ok(revision.executable_path)
    }

    fn should_disable_sandbox() -> bool {
        std::path::Path::new("/.dockerenv").exists()
            || std::env::var("container").is_ok()
            || std::env::var("KUBERNETES_SERVICE_HOST").is_ok()
    }

    async fn launch(
        options: &CreateOptions,
        events: Arc<AsyncMutex<VecDeque<BrowserEvent>>>,
    ) -> BrowserResult<(Browser, JoinHandle<()>, PathBuf)> {
        let chrome_path = match Self::find_browser_executable().await {
            Ok(path) => path,
            Err(_) => Self::download_managed_browser().await?,
        };

        let user_data_dir = options
            .persistent_profile
            .as_ref()
            .map(|name| std::env::temp_dir().join(format!("browser_agent_profile_{name}")))
            .unwrap_or_else(|| std::env::temp_dir().join(format!("browser_agent_{}", uuid::Uuid::new_v4())));
        std::fs::create_dir_all(&user_data_dir).map_err(|e| BrowserError::Launch(e.to_string()))?;

        let mut builder = BrowserConfigBuilder::default()
            .request_timeout(options.timeout)
            .window_size(options.viewport_width, options.viewport_height)
            .user_data_dir(user_data_dir.clone())
            .chrome_executable(chrome_path)
            .headless_mode(HeadlessMode::default());

        if options.stealth {
            builder = builder
                .arg(format!("--user-agent={STEALTH_USER_AGENT}"))
                .arg("--disable-blink-features=AutomationControlled")
                .arg("--disable-infobars")
                .arg("--no-first-run")
                .arg("--no-default-browser-check");
        }
        if Self::should_disable_sandbox() {
            builder = builder.arg("--no-sandbox").arg("--disable-setuid-sandbox");
        }

        let config = builder.build().map_err(BrowserError::Launch)?;
        let (browser, mut handler) = Browser::launch(config).await.map_err(|e| BrowserError::Launch(e.to_string()))?;

        let handler_task = tokio::task::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(e) = h {
                    let msg = e.to_string();
                    // Chrome emits CDP events chromiumoxide's enum doesn't model; benign.
                    if msg.contains("did not match any variant") || msg.contains("Failed to deserialize") {
                        trace!("suppressed benign CDP deserialization error: {msg}");
                    } else {
                        error!("browser handler error: {msg}");
                    }
                }
            }
            info!("browser handler task completed");
            // The handler loop only ends when the underlying CDP connection
            // closes — report it as a `Disconnected` event so `SessionManager`
            // can distinguish an unsolicited drop from `disconnect_cdp`
            // (spec.md §4.B "Disconnection handling").
            events.lock().await.push_back(BrowserEvent::Disconnected);
        });

        Ok((browser, handler_task, user_data_dir))
    }

    fn get_session(&self, remote_session_id: &str) -> BrowserResult<dashmap::mapref::one::Ref<'_, String, ManagedSession>> {
        self.sessions
            .get(remote_session_id)
            .ok_or_else(|| BrowserError::NotFound(remote_session_id.to_string()))
    }

    fn get_page(&self, remote_session_id: &str, page_id: &str) -> BrowserResult<Page> {
        let session = self.get_session(remote_session_id)?;
        session
            .pages
            .get(page_id)
            .map(|p| p.value().clone())
            .ok_or(BrowserError::NoTab)
    }

    fn cdp_button(button: MouseButton) -> CdpMouseButton {
        match button {
            MouseButton::Left => CdpMouseButton::Left,
            MouseButton::Right => CdpMouseButton::Right,
            MouseButton::Middle => CdpMouseButton::Middle,
        }
    }

    /// Subscribe to download events on `page`. A subscription failure (some
    /// CDP targets refuse it) just means downloads on that tab go unlisted;
    /// it never aborts session creation.
    async fn spawn_download_listeners(page: &Page, events: Arc<AsyncMutex<VecDeque<BrowserEvent>>>, download_dir: PathBuf) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        if let Ok(mut stream) = page.event_listener::<EventDownloadWillBegin>().await {
            let events = events.clone();
            let download_dir = download_dir.clone();
            tasks.push(tokio::task::spawn(async move {
                while let Some(ev) = stream.next().await {
                    let filename = download_dir.join(&ev.suggested_filename).to_string_lossy().to_string();
                    events.lock().await.push_back(BrowserEvent::DownloadWillBegin {
                        filename: ev.suggested_filename.clone(),
                        path: filename,
                    });
                }
            }));
        }

        if let Ok(mut stream) = page.event_listener::<EventDownloadProgress>().await {
            tasks.push(tokio::task::spawn(async move {
                while let Some(ev) = stream.next().await {
                    let status = match ev.state {
                        DownloadProgressState::InProgress => DownloadStatus::InProgress,
                        DownloadProgressState::Completed => DownloadStatus::Completed,
                        DownloadProgressState::Canceled => DownloadStatus::Failed,
                    };
                    let progress_pct = if ev.total_bytes > 0 {
                        (ev.received_bytes as f32 / ev.total_bytes as f32) * 100.0
                    } else {
                        0.0
                    };
                    events.lock().await.push_back(BrowserEvent::DownloadProgress {
                        filename: ev.guid.clone(),
                        progress_pct,
                        status,
                    });
                }
            }));
        }

        tasks
    }

    /// Subscribe at the browser level for tabs opening/closing outside our
    /// own `new_page` calls (window.open, target="_blank" links, the user
    /// closing a tab) so `SessionManager`'s tab stack stays accurate
    /// (spec.md §4.B "multi-tab tracking").
    fn spawn_target_listeners(browser: &Browser, events: Arc<AsyncMutex<VecDeque<BrowserEvent>>>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        let browser = browser.clone();

        {
            let events = events.clone();
            let browser = browser.clone();
            tasks.push(tokio::task::spawn(async move {
                if let Ok(mut stream) = browser.event_listener::<EventTargetCreated>().await {
                    while let Some(ev) = stream.next().await {
                        if ev.target_info.r#type == "page" {
                            events.lock().await.push_back(BrowserEvent::PageOpened {
                                page_id: ev.target_info.target_id.to_string(),
                                url: ev.target_info.url.clone(),
                            });
                        }
                    }
                }
            }));
        }

        tasks.push(tokio::task::spawn(async move {
            if let Ok(mut stream) = browser.event_listener::<EventTargetDestroyed>().await {
                while let Some(ev) = stream.next().await {
                    events.lock().await.push_back(BrowserEvent::PageClosed { page_id: ev.target_id.to_string() });
                }
            }
        }));

        tasks
    }
}

#[async_trait]
impl super::RemoteBrowserPort for ChromiumBrowserPort {
    async fn create(&self, options: CreateOptions) -> BrowserResult<CreatedSession> {
        let events: Arc<AsyncMutex<VecDeque<BrowserEvent>>> = Arc::new(AsyncMutex::new(VecDeque::new()));
        let (browser, handler_task, user_data_dir) = Self::launch(&options, events.clone()).await?;
        let remote_session_id = options
            .persistence_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let pages = browser.pages().await.map_err(|e| BrowserError::Launch(e.to_string()))?;
        let first_page = match pages.into_iter().next() {
            Some(p) => p,
            None => browser.new_page("about:blank").await.map_err(|e| BrowserError::Launch(e.to_string()))?,
        };
        let page_id = first_page.target_id().to_string();

        let download_dir = std::env::temp_dir().join(format!("browser_agent_downloads_{remote_session_id}"));
        std::fs::create_dir_all(&download_dir).map_err(|e| BrowserError::Launch(e.to_string()))?;

        let debugger_ws_url = browser.websocket_address().to_string();
        let live_view_url = format!("about:blank#live-view/{remote_session_id}");

        let session_pages = DashMap::new();
        session_pages.insert(page_id, first_page.clone());

        let mut event_tasks = Self::spawn_download_listeners(&first_page, events.clone(), download_dir.clone()).await;
        event_tasks.extend(Self::spawn_target_listeners(&browser, events.clone()));

        self.sessions.insert(
            remote_session_id.clone(),
            ManagedSession {
                browser,
                handler_task,
                pages: session_pages,
                events,
                event_tasks,
                user_data_dir: Some(user_data_dir),
                download_dir,
            },
        );

        Ok(CreatedSession { remote_session_id, debugger_ws_url, live_view_url })
    }

    async fn connect(&self, debugger_ws_url: &str) -> BrowserResult<Vec<String>> {
        // Sessions launched by `create` are already connected in-process;
        // reconnecting after a standby disconnect re-attaches to the same
        // `Browser` handle via `SessionManager::reconnect_cdp`, which looks
        // the live session up by id rather than re-dialing this method —
        // this path exists for completeness of the port contract (spec.md
        // §4.A `connect`) when a debugger URL is the only handle available.
        for entry in self.sessions.iter() {
            if entry.browser.websocket_address() == debugger_ws_url {
                return Ok(entry.pages.iter().map(|p| p.key().clone()).collect());
            }
        }
        Err(BrowserError::Connect(format!("no managed session for {debugger_ws_url}")))
    }

    async fn poll_events(&self, remote_session_id: &str) -> BrowserResult<Vec<BrowserEvent>> {
        let session = self.get_session(remote_session_id)?;
        let mut queue = session.events.lock().await;
        Ok(queue.drain(..).collect())
    }

    async fn click(&self, remote_session_id: &str, page_id: &str, x: f64, y: f64, button: MouseButton, clicks: u32) -> BrowserResult<()> {
        let page = self.get_page(remote_session_id, page_id)?;
        let cdp_button = Self::cdp_button(button);
        for _ in 0..clicks.max(1) {
            page.execute(
                DispatchMouseEventParams::builder()
                    .r#type(DispatchMouseEventType::MousePressed)
                    .x(x)
                    .y(y)
                    .button(cdp_button)
                    .click_count(1)
                    .build()
                    .map_err(BrowserError::Action)?,
            )
            .await
            .map_err(|e| BrowserError::Action(e.to_string()))?;
            page.execute(
                DispatchMouseEventParams::builder()
                    .r#type(DispatchMouseEventType::MouseReleased)
                    .x(x)
                    .y(y)
                    .button(cdp_button)
                    .click_count(1)
                    .build()
                    .map_err(BrowserError::Action)?,
            )
            .await
            .map_err(|e| BrowserError::Action(e.to_string()))?;
        }
        Ok(())
    }

    async fn move_mouse(&self, remote_session_id: &str, page_id: &str, x: f64, y: f64) -> BrowserResult<()> {
        let page = self.get_page(remote_session_id, page_id)?;
        page.execute(
            DispatchMouseEventParams::builder()
                .r#type(DispatchMouseEventType::MouseMoved)
                .x(x)
                .y(y)
                .build()
                .map_err(BrowserError::Action)?,
        )
        .await
        .map_err(|e| BrowserError::Action(e.to_string()))?;
        Ok(())
    }

    async fn scroll(&self, remote_session_id: &str, page_id: &str, x: f64, y: f64, dx: f64, dy: f64) -> BrowserResult<()> {
        let page = self.get_page(remote_session_id, page_id)?;
        page.execute(
            DispatchMouseEventParams::builder()
                .r#type(DispatchMouseEventType::MouseWheel)
                .x(x)
                .y(y)
                .delta_x(dx)
                .delta_y(dy)
                .build()
                .map_err(BrowserError::Action)?,
        )
        .await
        .map_err(|e| BrowserError::Action(e.to_string()))?;
        Ok(())
    }

    async fn type_text(&self, remote_session_id: &str, page_id: &str, text: &str, per_char_delay: Duration) -> BrowserResult<()> {
        let page = self.get_page(remote_session_id, page_id)?;
        for ch in text.chars() {
            let ch_str = ch.to_string();
            page.execute(
                DispatchKeyEventParams::builder()
                    .r#type(DispatchKeyEventType::Char)
                    .text(ch_str.clone())
                    .key(ch_str)
                    .build()
                    .map_err(BrowserError::Action)?,
            )
            .await
            .map_err(|e| BrowserError::Action(e.to_string()))?;
            if !per_char_delay.is_zero() {
                tokio::time::sleep(per_char_delay).await;
            }
        }
        Ok(())
    }

    async fn press(&self, remote_session_id: &str, page_id: &str, key_combo: &str) -> BrowserResult<()> {
        let page = self.get_page(remote_session_id, page_id)?;
        let keys = canonicalize_key_combo(key_combo);

        for key in &keys {
            page.execute(
                DispatchKeyEventParams::builder()
                    .r#type(DispatchKeyEventType::KeyDown)
                    .key(key.key.clone())
                    .build()
                    .map_err(BrowserError::Action)?,
            )
            .await
            .map_err(|e| BrowserError::Action(e.to_string()))?;
        }
        for key in keys.iter().rev() {
            page.execute(
                DispatchKeyEventParams::builder()
                    .r#type(DispatchKeyEventType::KeyUp)
                    .key(key.key.clone())
                    .build()
                    .map_err(BrowserError::Action)?,
            )
            .await
            .map_err(|e| BrowserError::Action(e.to_string()))?;
        }
        Ok(())
    }

    async fn screenshot(&self, remote_session_id: &str, page_id: &str, deadline: Duration) -> BrowserResult<Vec<u8>> {
        let page = self.get_page(remote_session_id, page_id)?;
        let params = ScreenshotParams::builder().format(CaptureScreenshotFormat::Png).build();
        tokio::time::timeout(deadline, page.screenshot(params))
            .await
            .map_err(|_| BrowserError::PageUnresponsive(format!("screenshot timed out after {deadline:?}")))?
            .map_err(|e| BrowserError::PageUnresponsive(e.to_string()))
    }

    async fn list_files(&self, remote_session_id: &str, path: &str) -> BrowserResult<Vec<String>> {
        let session = self.get_session(remote_session_id)?;
        let dir = if path.is_empty() { session.download_dir.clone() } else { PathBuf::from(path) };
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| BrowserError::FileNotFound(e.to_string()))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| BrowserError::FileNotFound(e.to_string()))? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        Ok(names)
    }

    async fn read_file(&self, remote_session_id: &str, path: &str) -> BrowserResult<Vec<u8>> {
        let session = self.get_session(remote_session_id)?;
        let full_path = if PathBuf::from(path).is_absolute() { PathBuf::from(path) } else { session.download_dir.join(path) };
        tokio::fs::read(&full_path).await.map_err(|e| BrowserError::FileNotFound(e.to_string()))
    }

    async fn destroy(&self, remote_session_id: &str) -> BrowserResult<()> {
        if let Some((_, mut session)) = self.sessions.remove(remote_session_id) {
            let _ = session.browser.close().await;
            let _ = session.browser.wait().await;
            session.handler_task.abort();
            for task in &session.event_tasks {
                task.abort();
            }
            if let Some(dir) = session.user_data_dir.take() {
                let _ = std::fs::remove_dir_all(&dir);
            }
            let _ = std::fs::remove_dir_all(&session.download_dir);
        }
        Ok(())
    }
}
