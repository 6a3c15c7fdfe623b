//! `MemoryPort` (spec.md §6) — the agent-facing `memory` tool's storage
//! boundary, keyed by `/memories/{task_id}/{path}`.
//!
//! Resolved per SPEC_FULL.md Open Question #3: per-task durable storage,
//! not chat-session-scoped, so a resumed task sees exactly the files it
//! left behind. Implemented as a plain directory tree with `tokio::fs`,
//! matching the teacher's `RemoteBrowserPort::list_files`/`read_file`
//! (see `browser::chromium::ChromiumBrowserPort`).

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("memory file not found: {0}")]
    NotFound(String),
    #[error("memory file already exists: {0}")]
    AlreadyExists(String),
    #[error("text not found for replacement: {0:?}")]
    TextNotFound(String),
    #[error("text occurs more than once, replacement must be unique: {0:?}")]
    AmbiguousReplacement(String),
    #[error("line {0} out of range")]
    LineOutOfRange(usize),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("io error: {0}")]
    Io(String),
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// A listing entry returned by `MemoryPort::view` on a directory path.
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub path: String,
    pub is_dir: bool,
}

/// `view` either renders a whole file's text or lists a directory,
/// mirroring Anthropic's text-editor tool verbs.
#[derive(Debug, Clone)]
pub enum ViewResult {
    File(String),
    Directory(Vec<MemoryEntry>),
}

/// The boundary the `memory` tool dispatches to (spec.md §6).
#[async_trait]
pub trait MemoryPort: Send + Sync {
    async fn view(&self, task_id: Uuid, path: &str) -> MemoryResult<ViewResult>;
    async fn create(&self, task_id: Uuid, path: &str, text: &str) -> MemoryResult<()>;
    async fn str_replace(&self, task_id: Uuid, path: &str, old: &str, new: &str) -> MemoryResult<()>;
    /// Insert `new` as a new line after line `line` (0 inserts at the top).
    async fn insert(&self, task_id: Uuid, path: &str, line: usize, new: &str) -> MemoryResult<()>;
    async fn delete(&self, task_id: Uuid, path: &str) -> MemoryResult<()>;
    async fn rename(&self, task_id: Uuid, path: &str, new_path: &str) -> MemoryResult<()>;
}

pub struct FsMemoryPort {
    root: PathBuf,
}

impl FsMemoryPort {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn task_dir(&self, task_id: Uuid) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    /// Reject absolute paths and `..` components so a model-supplied path
    /// can never escape `/memories/{task_id}/`.
    fn resolve(&self, task_id: Uuid, path: &str) -> MemoryResult<PathBuf> {
        let relative = Path::new(path);
        if relative.is_absolute() || relative.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(MemoryError::InvalidPath(path.to_string()));
        }
        Ok(self.task_dir(task_id).join(relative))
    }
}

#[async_trait]
impl MemoryPort for FsMemoryPort {
    async fn view(&self, task_id: Uuid, path: &str) -> MemoryResult<ViewResult> {
        let full_path = self.resolve(task_id, path)?;
        let metadata = tokio::fs::metadata(&full_path).await.map_err(|_| MemoryError::NotFound(path.to_string()))?;

        if metadata.is_dir() {
            let mut entries = Vec::new();
            let mut reader = tokio::fs::read_dir(&full_path).await.map_err(|e| MemoryError::Io(e.to_string()))?;
            while let Some(entry) = reader.next_entry().await.map_err(|e| MemoryError::Io(e.to_string()))? {
                entries.push(MemoryEntry {
                    path: entry.file_name().to_string_lossy().into_owned(),
                    is_dir: entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false),
                });
            }
            Ok(ViewResult::Directory(entries))
        } else {
            let text = tokio::fs::read_to_string(&full_path).await.map_err(|e| MemoryError::Io(e.to_string()))?;
            Ok(ViewResult::File(text))
        }
    }

    async fn create(&self, task_id: Uuid, path: &str, text: &str) -> MemoryResult<()> {
        let full_path = self.resolve(task_id, path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| MemoryError::Io(e.to_string()))?;
        }
        if tokio::fs::metadata(&full_path).await.is_ok() {
            return Err(MemoryError::AlreadyExists(path.to_string()));
        }
        tokio::fs::write(&full_path, text).await.map_err(|e| MemoryError::Io(e.to_string()))
    }

    async fn str_replace(&self, task_id: Uuid, path: &str, old: &str, new: &str) -> MemoryResult<()> {
        let full_path = self.resolve(task_id, path)?;
        let text = tokio::fs::read_to_string(&full_path).await.map_err(|_| MemoryError::NotFound(path.to_string()))?;

        let occurrences = text.matches(old).count();
        if occurrences == 0 {
            return Err(MemoryError::TextNotFound(old.to_string()));
        }
        if occurrences > 1 {
            return Err(MemoryError::AmbiguousReplacement(old.to_string()));
        }

        tokio::fs::write(&full_path, text.replacen(old, new, 1)).await.map_err(|e| MemoryError::Io(e.to_string()))
    }

    async fn insert(&self, task_id: Uuid, path: &str, line: usize, new: &str) -> MemoryResult<()> {
        let full_path = self.resolve(task_id, path)?;
        let text = tokio::fs::read_to_string(&full_path).await.map_err(|_| MemoryError::NotFound(path.to_string()))?;

        let mut lines: Vec<&str> = text.lines().collect();
        if line > lines.len() {
            return Err(MemoryError::LineOutOfRange(line));
        }
        lines.insert(line, new);
        tokio::fs::write(&full_path, lines.join("\n") + "\n").await.map_err(|e| MemoryError::Io(e.to_string()))
    }

    async fn delete(&self, task_id: Uuid, path: &str) -> MemoryResult<()> {
        let full_path = self.resolve(task_id, path)?;
        tokio::fs::remove_file(&full_path).await.map_err(|_| MemoryError::NotFound(path.to_string()))
    }

    async fn rename(&self, task_id: Uuid, path: &str, new_path: &str) -> MemoryResult<()> {
        let full_path = self.resolve(task_id, path)?;
        let new_full_path = self.resolve(task_id, new_path)?;
        if let Some(parent) = new_full_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| MemoryError::Io(e.to_string()))?;
        }
        tokio::fs::rename(&full_path, &new_full_path).await.map_err(|_| MemoryError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port() -> (FsMemoryPort, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (FsMemoryPort::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn create_then_view_round_trips_text() {
        let (port, _dir) = port();
        let task_id = Uuid::new_v4();
        port.create(task_id, "notes.md", "hello").await.unwrap();
        match port.view(task_id, "notes.md").await.unwrap() {
            ViewResult::File(text) => assert_eq!(text, "hello"),
            ViewResult::Directory(_) => panic!("expected file"),
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_path() {
        let (port, _dir) = port();
        let task_id = Uuid::new_v4();
        port.create(task_id, "notes.md", "hello").await.unwrap();
        assert!(matches!(port.create(task_id, "notes.md", "again").await, Err(MemoryError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn str_replace_rejects_ambiguous_match() {
        let (port, _dir) = port();
        let task_id = Uuid::new_v4();
        port.create(task_id, "notes.md", "foo foo").await.unwrap();
        assert!(matches!(
            port.str_replace(task_id, "notes.md", "foo", "bar").await,
            Err(MemoryError::AmbiguousReplacement(_))
        ));
    }

    #[tokio::test]
    async fn insert_adds_a_new_line() {
        let (port, _dir) = port();
        let task_id = Uuid::new_v4();
        port.create(task_id, "notes.md", "a\nb").await.unwrap();
        port.insert(task_id, "notes.md", 1, "middle").await.unwrap();
        match port.view(task_id, "notes.md").await.unwrap() {
            ViewResult::File(text) => assert_eq!(text, "a\nmiddle\nb\n"),
            _ => panic!("expected file"),
        }
    }

    #[tokio::test]
    async fn resolve_rejects_path_traversal() {
        let (port, _dir) = port();
        let task_id = Uuid::new_v4();
        assert!(matches!(port.create(task_id, "../escape.md", "x").await, Err(MemoryError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn rename_moves_file() {
        let (port, _dir) = port();
        let task_id = Uuid::new_v4();
        port.create(task_id, "a.md", "x").await.unwrap();
        port.rename(task_id, "a.md", "b.md").await.unwrap();
        assert!(matches!(port.view(task_id, "a.md").await, Err(MemoryError::NotFound(_))));
        match port.view(task_id, "b.md").await.unwrap() {
            ViewResult::File(text) => assert_eq!(text, "x"),
            _ => panic!("expected file"),
        }
    }
}
