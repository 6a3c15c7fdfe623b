//! `browser-agent-server` — the reference HTTP binary wiring the core
//! runtime's ports to a thin `axum` surface (spec.md §6). Routing and
//! auth are explicitly out of scope for the core; this binary exists
//! because the teacher always ships one alongside its library.

use anyhow::Context;
use browser_agent_core::batch_executor::BatchExecutor;
use browser_agent_core::browser::ChromiumBrowserPort;
use browser_agent_core::config::ExecutionConfig;
use browser_agent_core::memory_port::FsMemoryPort;
use browser_agent_core::model::AnthropicModelPort;
use browser_agent_core::object_store::InMemoryObjectStore;
use browser_agent_core::sampling_loop::SamplingLoop;
use browser_agent_core::server::{router, AppState};
use browser_agent_core::session_manager::SessionManager;
use browser_agent_core::store::InMemoryStateStore;
use browser_agent_core::task_coordinator::TaskCoordinator;
use browser_agent_core::webhook::WebhookSender;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let base_config = ExecutionConfig::default();

    let model = Arc::new(AnthropicModelPort::from_env().context("constructing AnthropicModelPort")?);
    let browser = Arc::new(ChromiumBrowserPort::new());
    let store = Arc::new(InMemoryStateStore::new());
    let sessions = Arc::new(SessionManager::new(browser, store.clone()));
    let objects = Arc::new(object_store_from_env());
    let memory = Arc::new(FsMemoryPort::new(memory_root_from_env()));
    let webhook = Arc::new(WebhookSender::new());

    spawn_session_event_poller(sessions.clone());

    let sampling_loop = Arc::new(SamplingLoop::new(model, sessions.clone(), store.clone(), objects, memory));
    let coordinator = Arc::new(TaskCoordinator::new(sampling_loop.clone(), store.clone(), base_config.clone()));
    let batch_executor = Arc::new(BatchExecutor::new(sampling_loop, sessions.clone(), store.clone(), webhook, base_config.clone()));

    let state = Arc::new(AppState { coordinator, batch_executor, sessions, store, base_config });

    let addr = listen_addr_from_env();
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "browser-agent-server listening");
    axum::serve(listener, router(state)).await.context("serving http")?;
    Ok(())
}

/// Drive every live session's `poll_events` on a fixed cadence so tab-stack
/// updates and unsolicited-disconnect detection actually run (spec.md §4.B);
/// `SessionManager` itself stays a passive table, polled rather than
/// self-scheduling.
fn spawn_session_event_poller(sessions: Arc<SessionManager>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EVENT_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            for remote_session_id in sessions.live_session_ids() {
                if let Err(e) = sessions.poll_events(&remote_session_id).await {
                    tracing::warn!(remote_session_id = %remote_session_id, error = %e, "session event poll failed");
                }
            }
        }
    });
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn listen_addr_from_env() -> String {
    std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8787".to_string())
}

fn object_store_from_env() -> InMemoryObjectStore {
    let signing_key = std::env::var("SCREENSHOT_SIGNING_KEY").unwrap_or_else(|_| "dev-signing-key".to_string());
    let base_url = std::env::var("OBJECT_STORE_BASE_URL").unwrap_or_else(|_| "http://localhost:8787/objects".to_string());
    InMemoryObjectStore::new(signing_key.into_bytes(), base_url)
}

fn memory_root_from_env() -> std::path::PathBuf {
    std::env::var("MEMORY_ROOT").map(std::path::PathBuf::from).unwrap_or_else(|_| std::env::temp_dir().join("browser-agent-memories"))
}
