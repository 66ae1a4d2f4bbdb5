//! Per-stream mutable hot-reload state (spec.md §3 WatchState, §4.8.1).
//!
//! All mutation happens under `inner`'s mutex, never held across a compile
//! or deploy step — the same discipline the teacher applies to
//! `BuildGuard`/`RebuildPipeline` coordination, generalized from one
//! process-wide guard to one instance per stream.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::classify::SkeletonHash;
use crate::reload::BuildGuard;

const TRACKED_DEBOUNCE: Duration = Duration::from_millis(200);
const UNTRACKED_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub enum DebounceFired {
    Tracked(PathBuf),
    Untracked(PathBuf),
}

struct Inner {
    reload_counter: u64,
    preview_selector: String,
    preview_index: u32,
    preview_count: u32,
    skeleton_map: HashMap<PathBuf, SkeletonHash>,
    tracked_files: HashSet<PathBuf>,
    tracked_timer: Option<JoinHandle<()>>,
    untracked_timer: Option<JoinHandle<()>>,
}

pub struct WatchState {
    inner: Mutex<Inner>,
    building: BuildGuard,
}

impl WatchState {
    pub fn new(preview_count: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                reload_counter: 0,
                preview_selector: "0".to_string(),
                preview_index: 0,
                preview_count,
                skeleton_map: HashMap::new(),
                tracked_files: HashSet::new(),
                tracked_timer: None,
                untracked_timer: None,
            }),
            building: BuildGuard::new(),
        }
    }

    /// The single-build-in-flight-with-one-pending coordination shared with
    /// the teacher's rebuild pipeline.
    pub fn building(&self) -> &BuildGuard {
        &self.building
    }

    pub async fn set_tracked_files(&self, files: HashSet<PathBuf>) {
        self.inner.lock().await.tracked_files = files;
    }

    pub async fn tracked_files(&self) -> HashSet<PathBuf> {
        self.inner.lock().await.tracked_files.clone()
    }

    pub async fn is_tracked(&self, path: &Path) -> bool {
        self.inner.lock().await.tracked_files.contains(path)
    }

    pub async fn skeleton(&self, path: &Path) -> Option<SkeletonHash> {
        self.inner.lock().await.skeleton_map.get(path).cloned()
    }

    pub async fn set_skeleton(&self, path: PathBuf, hash: SkeletonHash) {
        self.inner.lock().await.skeleton_map.insert(path, hash);
    }

    /// Drop skeletons for files no longer tracked, e.g. after a SwitchFile
    /// or a full project rebuild (spec.md §4.8.1/§4.8.2).
    pub async fn retain_skeletons(&self, keep: &HashSet<PathBuf>) {
        self.inner.lock().await.skeleton_map.retain(|path, _| keep.contains(path));
    }

    pub async fn preview_selector(&self) -> String {
        self.inner.lock().await.preview_selector.clone()
    }

    /// `previewIndex = (previewIndex + 1) mod previewCount`; a no-op when
    /// `previewCount <= 1` (spec.md §4.8.2 NextPreview).
    pub async fn advance_preview(&self) -> String {
        let mut inner = self.inner.lock().await;
        if inner.preview_count <= 1 {
            return inner.preview_selector.clone();
        }
        inner.preview_index = (inner.preview_index + 1) % inner.preview_count;
        inner.preview_selector = inner.preview_index.to_string();
        inner.preview_selector.clone()
    }

    /// `previewIndex=0, previewSelector="0"` on a successful SwitchFile
    /// (spec.md §4.8.2).
    pub async fn reset_preview_cycle(&self, preview_count: u32) {
        let mut inner = self.inner.lock().await;
        inner.preview_index = 0;
        inner.preview_selector = "0".to_string();
        inner.preview_count = preview_count;
    }

    pub async fn increment_reload(&self) -> u64 {
        let mut inner = self.inner.lock().await;
        inner.reload_counter += 1;
        inner.reload_counter
    }

    /// Partition a file-change event by tracked membership and (re)schedule
    /// the corresponding debounce timer (spec.md §4.8.1):
    ///
    /// - a slow-path rebuild already pending drops a newly-arrived tracked
    ///   event (the rebuild will cover it);
    /// - scheduling a slow-path rebuild cancels any pending tracked timer.
    pub async fn on_file_change(&self, path: PathBuf, fire_tx: mpsc::Sender<DebounceFired>) {
        let tracked = self.is_tracked(&path).await;
        let mut inner = self.inner.lock().await;

        if tracked {
            if inner.untracked_timer.is_some() {
                return;
            }
            if let Some(handle) = inner.tracked_timer.take() {
                handle.abort();
            }
            let tx = fire_tx;
            let fire_path = path.clone();
            inner.tracked_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(TRACKED_DEBOUNCE).await;
                let _ = tx.send(DebounceFired::Tracked(fire_path)).await;
            }));
        } else {
            if let Some(handle) = inner.tracked_timer.take() {
                handle.abort();
            }
            if let Some(handle) = inner.untracked_timer.take() {
                handle.abort();
            }
            let tx = fire_tx;
            let fire_path = path.clone();
            inner.untracked_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(UNTRACKED_DEBOUNCE).await;
                let _ = tx.send(DebounceFired::Untracked(fire_path)).await;
            }));
        }
    }

    pub async fn clear_tracked_timer(&self) {
        self.inner.lock().await.tracked_timer = None;
    }

    pub async fn clear_untracked_timer(&self) {
        self.inner.lock().await.untracked_timer = None;
    }
}

/// Given the target file and its candidate dependency files, exclude every
/// non-target file declaring a `private`/`fileprivate` type name that also
/// appears in another file (spec.md §4.8.3). The target is never excluded.
pub fn filter_private_collisions(
    target: &Path,
    candidates: &[(PathBuf, Vec<(String, bool)>)],
) -> Vec<PathBuf> {
    let mut counts: HashMap<&str, u32> = HashMap::new();
    for (_, types) in candidates {
        for (name, is_private) in types {
            if *is_private {
                *counts.entry(name.as_str()).or_insert(0) += 1;
            }
        }
    }

    candidates
        .iter()
        .filter(|(path, types)| {
            path == target
                || !types
                    .iter()
                    .any(|(name, is_private)| *is_private && counts.get(name.as_str()).copied().unwrap_or(0) > 1)
        })
        .map(|(path, _)| path.clone())
        .collect()
}

pub type SharedWatchState = Arc<WatchState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn advance_preview_wraps_and_noops_below_two() {
        let state = WatchState::new(1);
        assert_eq!(state.advance_preview().await, "0");

        let state = WatchState::new(3);
        assert_eq!(state.advance_preview().await, "1");
        assert_eq!(state.advance_preview().await, "2");
        assert_eq!(state.advance_preview().await, "0");
    }

    #[tokio::test]
    async fn tracked_debounce_drops_when_rebuild_pending() {
        let state = WatchState::new(1);
        state
            .set_tracked_files(HashSet::from([PathBuf::from("/p/V.swift")]))
            .await;
        let (tx, mut rx) = mpsc::channel(4);

        state.on_file_change(PathBuf::from("/p/Other.swift"), tx.clone()).await;
        state.on_file_change(PathBuf::from("/p/V.swift"), tx.clone()).await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, DebounceFired::Untracked(p) if p == Path::new("/p/Other.swift")));

        let second = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(second.is_err(), "tracked event should have been dropped, not fired separately");
    }

    #[test]
    fn private_collision_filter_excludes_non_target_duplicates() {
        let target = PathBuf::from("/p/Target.swift");
        let other = PathBuf::from("/p/Other.swift");
        let candidates = vec![
            (target.clone(), vec![("Helper".to_string(), true)]),
            (other.clone(), vec![("Helper".to_string(), true)]),
        ];
        let tracked = filter_private_collisions(&target, &candidates);
        assert_eq!(tracked, vec![target]);
    }

    #[test]
    fn private_collision_filter_keeps_unique_private_types() {
        let target = PathBuf::from("/p/Target.swift");
        let other = PathBuf::from("/p/Other.swift");
        let candidates = vec![
            (target.clone(), vec![("A".to_string(), true)]),
            (other.clone(), vec![("B".to_string(), true)]),
        ];
        let mut tracked = filter_private_collisions(&target, &candidates);
        tracked.sort();
        let mut expected = vec![target, other];
        expected.sort();
        assert_eq!(tracked, expected);
    }
}
