//! Shared filesystem watcher fanning a single `notify` instance out to many
//! stream listeners (spec.md §4.5).
//!
//! Grounded in the teacher's `reload/watcher.rs` shape (one `notify`
//! instance feeding an async task over an mpsc channel) and
//! `canmi21-live`'s `signal/watcher.rs` (raw `notify` callback →
//! `blocking_send` into a channel, processed on a spawned task) — adapted
//! from "one listener" to "fan out to many listeners keyed by stream id".

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

const SOURCE_SUFFIX: &str = ".swift";

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
}

type Listener = mpsc::Sender<ChangeEvent>;

struct Registry {
    listeners: HashMap<String, Listener>,
}

/// Watches every directory containing source files and fans each Create/Write
/// event on a `.swift` file out to all registered stream listeners.
///
/// Listener channels have capacity 1; a send that would block is dropped —
/// the stream's debouncer will pick up the next event (spec.md §4.5, §3
/// invariant: the watcher never blocks on a stream).
pub struct SharedWatcher {
    _inner: RecommendedWatcher,
    registry: Arc<Mutex<Registry>>,
}

impl SharedWatcher {
    pub fn new(directories: &[PathBuf]) -> anyhow::Result<Self> {
        let registry = Arc::new(Mutex::new(Registry {
            listeners: HashMap::new(),
        }));
        let (raw_tx, mut raw_rx) = mpsc::channel::<notify::Result<NotifyEvent>>(256);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| {
            let _ = raw_tx.blocking_send(res);
        })?;

        for dir in directories {
            watcher.watch(dir, RecursiveMode::Recursive)?;
        }

        let fanout_registry = Arc::clone(&registry);
        tokio::spawn(async move {
            while let Some(res) = raw_rx.recv().await {
                match res {
                    Ok(event) => Self::fanout(&fanout_registry, event).await,
                    Err(e) => warn!(error = %e, "watcher error"),
                }
            }
        });

        Ok(Self {
            _inner: watcher,
            registry,
        })
    }

    async fn fanout(registry: &Arc<Mutex<Registry>>, event: NotifyEvent) {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        let reg = registry.lock().await;
        for path in &event.paths {
            if !is_source_file(path) {
                continue;
            }
            let change = ChangeEvent { path: path.clone() };
            for (stream_id, tx) in reg.listeners.iter() {
                if tx.try_send(change.clone()).is_err() {
                    debug!(stream_id, path = %path.display(), "dropped watch event (listener full)");
                }
            }
        }
    }

    /// Register under a stream id with a buffered (capacity 1) channel.
    pub async fn register(&self, stream_id: impl Into<String>) -> mpsc::Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel(1);
        self.registry.lock().await.listeners.insert(stream_id.into(), tx);
        rx
    }

    pub async fn unregister(&self, stream_id: &str) {
        self.registry.lock().await.listeners.remove(stream_id);
    }
}

pub fn is_source_file(path: &Path) -> bool {
    path.to_string_lossy().ends_with(SOURCE_SUFFIX)
}

/// Discover directories containing source files: ask the VCS for a
/// tracked/untracked-but-not-ignored file list first, falling back to a
/// tree walk skipping dotfiles and `build`/`DerivedData` directories.
pub async fn discover_watch_dirs(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if let Some(dirs) = vcs_tracked_dirs(root).await {
        return Ok(dirs);
    }
    walk_for_source_dirs(root).await
}

async fn vcs_tracked_dirs(root: &Path) -> Option<Vec<PathBuf>> {
    let output = tokio::process::Command::new("git")
        .args(["ls-files", "--cached", "--others", "--exclude-standard"])
        .current_dir(root)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let mut dirs = std::collections::BTreeSet::new();
    for line in text.lines() {
        let path = root.join(line);
        if is_source_file(&path)
            && let Some(parent) = path.parent()
        {
            dirs.insert(parent.to_path_buf());
        }
    }
    Some(dirs.into_iter().collect())
}

async fn walk_for_source_dirs(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut dirs = std::collections::BTreeSet::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if path.is_dir() {
                if name == "build" || name == "DerivedData" {
                    continue;
                }
                stack.push(path);
            } else if is_source_file(&path) {
                dirs.insert(dir.clone());
            }
        }
    }
    Ok(dirs.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_swift_suffix() {
        assert!(is_source_file(Path::new("/p/View.swift")));
        assert!(!is_source_file(Path::new("/p/View.swift.bak")));
        assert!(!is_source_file(Path::new("/p/README.md")));
    }

    #[tokio::test]
    async fn walk_skips_dotfiles_and_build_dirs() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join(".git")).await.unwrap();
        tokio::fs::write(dir.path().join(".git/ignored.swift"), "").await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("build")).await.unwrap();
        tokio::fs::write(dir.path().join("build/ignored.swift"), "").await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("Sources")).await.unwrap();
        tokio::fs::write(dir.path().join("Sources/V.swift"), "").await.unwrap();

        let dirs = walk_for_source_dirs(dir.path()).await.unwrap();
        assert_eq!(dirs, vec![dir.path().join("Sources")]);
    }
}
