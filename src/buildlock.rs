//! Inter-process reader/writer file lock protecting the shared build
//! directory (spec.md §4.1).
//!
//! The file-lock-with-retry shape is grounded in the teacher's build-kill
//! path (`reload/rebuild.rs::kill_build_process`) generalized from
//! process-wait to flock-wait: try non-blocking, sleep, retry until the
//! caller's cancellation token fires.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs4::TryLockError;
use fs4::tokio::AsyncFileExt;
use tokio::fs::{File, OpenOptions};
use tokio::sync::Notify;
use tokio::time::{Duration, sleep};

use crate::error::LockError;

const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// A cancellation token distinct from a full async runtime dependency —
/// callers flip it to unwind any in-progress lock wait.
#[derive(Clone, Default)]
pub struct CancelToken {
    notify: Arc<Notify>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called (or immediately if it
    /// already has).
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Shared,
    Exclusive,
}

/// Shared/exclusive advisory lock over `<buildDir>/.axe-build.lock`.
///
/// Holds either zero writers (any number of readers) or exactly one writer
/// (no readers) — enforced by the OS advisory lock, not by this struct.
/// `BuildLock` itself holds no per-caller state: every acquisition opens its
/// own fd and hands back its own [`BuildLockGuard`], so concurrent streams
/// acquiring the same shared `Arc<BuildLock>` (spec.md §4.8 step 5/7) never
/// step on each other's lock state.
pub struct BuildLock {
    path: PathBuf,
}

/// Releases its fd's advisory lock on drop. Hold this for as long as the
/// lock should stay held; drop it (or call [`BuildLockGuard::release`])
/// to let go early.
pub struct BuildLockGuard {
    file: File,
}

impl BuildLockGuard {
    /// Equivalent to `drop(guard)`, named for call sites where an explicit
    /// release reads clearer than an implicit one.
    pub fn release(self) {}
}

impl Drop for BuildLockGuard {
    fn drop(&mut self) {
        let _ = AsyncFileExt::unlock(&self.file);
    }
}

impl BuildLock {
    pub async fn open(build_dir: &Path) -> Result<Self, LockError> {
        tokio::fs::create_dir_all(build_dir)
            .await
            .map_err(LockError::CreatingDirectory)?;
        let path = build_dir.join(".axe-build.lock");
        Ok(Self { path })
    }

    pub async fn lock(&self, cancel: &CancelToken) -> Result<BuildLockGuard, LockError> {
        self.acquire(Mode::Exclusive, cancel).await
    }

    pub async fn rlock(&self, cancel: &CancelToken) -> Result<BuildLockGuard, LockError> {
        self.acquire(Mode::Shared, cancel).await
    }

    async fn acquire(&self, mode: Mode, cancel: &CancelToken) -> Result<BuildLockGuard, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await
            .map_err(LockError::OpeningFile)?;

        loop {
            let result = match mode {
                Mode::Exclusive => file.try_lock(),
                Mode::Shared => file.try_lock_shared(),
            };
            match result {
                Ok(()) => return Ok(BuildLockGuard { file }),
                Err(TryLockError::WouldBlock) => {
                    tokio::select! {
                        _ = sleep(RETRY_INTERVAL) => continue,
                        _ = cancel.cancelled() => return Err(LockError::Cancelled),
                    }
                }
                Err(TryLockError::Error(e)) => return Err(LockError::Other(e)),
            }
        }
    }

    /// Non-blocking attempt, used by tests to assert exclusion without a
    /// timing race.
    pub async fn try_lock(&self) -> Result<Option<BuildLockGuard>, LockError> {
        self.try_acquire(Mode::Exclusive).await
    }

    pub async fn try_rlock(&self) -> Result<Option<BuildLockGuard>, LockError> {
        self.try_acquire(Mode::Shared).await
    }

    async fn try_acquire(&self, mode: Mode) -> Result<Option<BuildLockGuard>, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await
            .map_err(LockError::OpeningFile)?;
        let result = match mode {
            Mode::Exclusive => file.try_lock(),
            Mode::Shared => file.try_lock_shared(),
        };
        match result {
            Ok(()) => Ok(Some(BuildLockGuard { file })),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Error(e)) => Err(LockError::Other(e)),
        }
    }
}
