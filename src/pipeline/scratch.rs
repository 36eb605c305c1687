//! Scratch storage scoped to one conversion request.
//!
//! A [`ScratchScope`] owns a private temporary directory and a set of
//! [`ScratchHandle`]s (files and sub-directories) acquired inside it. Every
//! handle is released exactly once: explicitly through
//! [`ScratchScope::release`], or when the scope is dropped. Dropping happens
//! on every exit path of a request, including timeouts and panics.
//!
//! Deletion is best effort. A file that cannot be removed is logged and
//! counted in the [`ScratchLedger`], never surfaced as a request failure.
//!
//! When a converted file is streamed back to the caller, the scope travels
//! inside the output stream (see [`crate::stream::OutputStream`]) and is
//! dropped only after the last byte was handed over.

use crate::error::ConvertError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

/// Process-wide accounting of scratch handles.
///
/// `outstanding()` returning 0 after every request finished is the
/// no-leak property; `released()` never exceeding `acquired()` is the
/// no-double-free property.
#[derive(Debug, Default)]
pub struct ScratchLedger {
    acquired: AtomicUsize,
    released: AtomicUsize,
    failed: AtomicUsize,
}

impl ScratchLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Releases whose deletion failed (the handle still counts as released).
    pub fn failed_deletions(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

/// What a handle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Dir,
}

/// A scratch file or directory registered with a [`ScratchScope`].
///
/// The handle is only a token: the backing storage belongs to the scope.
#[derive(Debug, Clone)]
pub struct ScratchHandle {
    id: u64,
    path: PathBuf,
    kind: HandleKind,
}

impl ScratchHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }
}

/// Handle ids are unique across scopes, so a handle can never match an
/// entry of a scope that did not issue it.
static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(0);

/// Per-request set of scratch resources.
pub struct ScratchScope {
    dir: TempDir,
    entries: Mutex<HashMap<u64, ScratchHandle>>,
    ledger: Arc<ScratchLedger>,
}

impl ScratchScope {
    /// Create a new scope directory under `root` (system temp dir if `None`).
    pub fn new(root: Option<&Path>, ledger: Arc<ScratchLedger>) -> Result<Self, ConvertError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("fileconv-");
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| {
                    ConvertError::Internal(format!("failed to create scratch root {}: {e}", root.display()))
                })?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| ConvertError::Internal(format!("failed to create scratch dir: {e}")))?;

        debug!(dir = %dir.path().display(), "Opened scratch scope");
        Ok(Self {
            dir,
            entries: Mutex::new(HashMap::new()),
            ledger,
        })
    }

    /// Directory holding every resource of this scope.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Reserve a uniquely named file path (`<uuid>.<suffix>`). Nothing is
    /// created on disk; the engine that writes it owns creation.
    pub fn acquire(&self, suffix: &str) -> Result<ScratchHandle, ConvertError> {
        let name = unique_name(suffix);
        Ok(self.register(self.path().join(name), HandleKind::File))
    }

    /// Write `bytes` to a new scratch file and register it.
    pub async fn acquire_from_bytes(&self, suffix: &str, bytes: &[u8]) -> Result<ScratchHandle, ConvertError> {
        let handle = self.acquire(suffix)?;
        if let Err(e) = tokio::fs::write(handle.path(), bytes).await {
            self.release(&handle);
            return Err(ConvertError::Internal(format!("failed to write scratch file: {e}")));
        }
        Ok(handle)
    }

    /// Create a scratch sub-directory (`<name>-<uuid>`).
    pub fn acquire_dir(&self, name: &str) -> Result<ScratchHandle, ConvertError> {
        let path = self.path().join(format!("{name}-{}", Uuid::new_v4().simple()));
        std::fs::create_dir(&path)
            .map_err(|e| ConvertError::Internal(format!("failed to create scratch dir: {e}")))?;
        Ok(self.register(path, HandleKind::Dir))
    }

    /// Register a file an engine will write inside a scratch directory of
    /// this scope. `file_name` must be a bare file name.
    pub fn acquire_in(&self, parent: &ScratchHandle, file_name: &str) -> Result<ScratchHandle, ConvertError> {
        if parent.kind != HandleKind::Dir || !self.lock().contains_key(&parent.id) {
            return Err(ConvertError::Internal(format!(
                "{} is not a live scratch directory of this scope",
                parent.path.display()
            )));
        }
        let bare = Path::new(file_name).file_name().map(|n| n == file_name).unwrap_or(false);
        if !bare {
            return Err(ConvertError::Internal(format!(
                "scratch file name must not contain a path: {file_name:?}"
            )));
        }
        Ok(self.register(parent.path.join(file_name), HandleKind::File))
    }

    /// Release one handle, deleting its backing storage.
    ///
    /// Returns `false` (and touches nothing) if the handle was already
    /// released or does not belong to this scope.
    pub fn release(&self, handle: &ScratchHandle) -> bool {
        let entry = self.lock().remove(&handle.id);
        match entry {
            Some(entry) => {
                self.delete(&entry);
                true
            }
            None => false,
        }
    }

    /// Number of handles not yet released.
    pub fn outstanding(&self) -> usize {
        self.lock().len()
    }

    /// Release every remaining handle, newest first so files inside scratch
    /// directories go before the directories themselves.
    pub fn drain(&self) {
        let mut entries: Vec<ScratchHandle> = self.lock().drain().map(|(_, h)| h).collect();
        if entries.is_empty() {
            return;
        }
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        debug!(count = entries.len(), dir = %self.path().display(), "Draining scratch scope");
        for entry in &entries {
            self.delete(entry);
        }
    }

    fn register(&self, path: PathBuf, kind: HandleKind) -> ScratchHandle {
        let handle = ScratchHandle {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::SeqCst),
            path,
            kind,
        };
        self.lock().insert(handle.id, handle.clone());
        self.ledger.acquired.fetch_add(1, Ordering::SeqCst);
        handle
    }

    fn delete(&self, handle: &ScratchHandle) {
        let result = match handle.kind {
            HandleKind::File => std::fs::remove_file(&handle.path),
            HandleKind::Dir => std::fs::remove_dir_all(&handle.path),
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %handle.path.display(), error = %e, "Failed to delete scratch resource");
                self.ledger.failed.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.ledger.released.fetch_add(1, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, ScratchHandle>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ScratchScope {
    fn drop(&mut self) {
        self.drain();
    }
}

impl std::fmt::Debug for ScratchScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchScope")
            .field("dir", &self.dir.path())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

fn unique_name(suffix: &str) -> String {
    let suffix = suffix.trim_start_matches('.');
    if suffix.is_empty() {
        Uuid::new_v4().simple().to_string()
    } else {
        format!("{}.{suffix}", Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> (tempfile::TempDir, Arc<ScratchLedger>, ScratchScope) {
        let root = tempfile::tempdir().unwrap();
        let ledger = ScratchLedger::new();
        let scope = ScratchScope::new(Some(root.path()), Arc::clone(&ledger)).unwrap();
        (root, ledger, scope)
    }

    #[tokio::test]
    async fn acquire_from_bytes_writes_inside_scope() {
        let (_root, ledger, scope) = scope();
        let h = scope.acquire_from_bytes("docx", b"hello").await.unwrap();
        assert!(h.path().starts_with(scope.path()));
        assert_eq!(h.path().extension().unwrap(), "docx");
        assert_eq!(std::fs::read(h.path()).unwrap(), b"hello");
        assert_eq!(ledger.outstanding(), 1);
    }

    #[test]
    fn acquire_generates_unique_paths() {
        let (_root, _ledger, scope) = scope();
        let a = scope.acquire(".mp3").unwrap();
        let b = scope.acquire("mp3").unwrap();
        assert_ne!(a.path(), b.path());
        assert_eq!(a.path().extension().unwrap(), "mp3");
        assert!(!a.path().exists(), "acquire must not create the file");
    }

    #[tokio::test]
    async fn release_is_exactly_once() {
        let (_root, ledger, scope) = scope();
        let h = scope.acquire_from_bytes("png", b"x").await.unwrap();
        assert!(scope.release(&h));
        assert!(!h.path().exists());
        assert!(!scope.release(&h), "second release must be a no-op");
        assert_eq!(ledger.acquired(), 1);
        assert_eq!(ledger.released(), 1);
    }

    #[tokio::test]
    async fn drop_drains_everything() {
        let (_root, ledger, scope) = scope();
        let dir_path;
        {
            let f = scope.acquire_from_bytes("bin", b"1").await.unwrap();
            let d = scope.acquire_dir("out").unwrap();
            let inner = scope.acquire_in(&d, "result.pdf").unwrap();
            std::fs::write(inner.path(), b"%PDF").unwrap();
            let _never_written = scope.acquire("mp4").unwrap();
            assert!(f.path().exists());
            dir_path = scope.path().to_path_buf();
        }
        assert_eq!(ledger.outstanding(), 4);
        drop(scope);
        assert_eq!(ledger.outstanding(), 0);
        assert_eq!(ledger.released(), 4);
        assert_eq!(ledger.failed_deletions(), 0);
        assert!(!dir_path.exists(), "scope directory must be removed");
    }

    #[test]
    fn acquire_in_rejects_paths_and_foreign_dirs() {
        let (_root, _ledger, scope) = scope();
        let d = scope.acquire_dir("out").unwrap();
        assert!(scope.acquire_in(&d, "../escape.pdf").is_err());
        assert!(scope.acquire_in(&d, "a/b.pdf").is_err());

        let file = scope.acquire("txt").unwrap();
        assert!(scope.acquire_in(&file, "x.pdf").is_err());

        scope.release(&d);
        assert!(scope.acquire_in(&d, "late.pdf").is_err());
    }

    #[test]
    fn foreign_handle_is_not_released() {
        let (_root, ledger, a) = scope();
        let b = ScratchScope::new(None, Arc::clone(&ledger)).unwrap();
        let _ha = a.acquire("txt").unwrap();
        let hb = b.acquire("txt").unwrap();
        assert!(!a.release(&hb));
        assert_eq!(a.outstanding(), 1);
        assert_eq!(b.outstanding(), 1);
    }
}
