//! Pooled simulator acquisition across concurrent streams and cooperating
//! OS processes (spec.md §4.2).
//!
//! The pool mutex guards only the in-memory maps; every `Toolchain` call and
//! filesystem touch happens with the lock released, the same discipline the
//! teacher applies to `BuildGuard`/`RebuildPipeline` state.

pub mod entry;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::device_pool::entry::{DeviceEntry, DeviceKey, DeviceMeta, LockFile, SimState};
use crate::toolchain::Toolchain;

/// Idle devices older than this are reclaimed by `GarbageCollect` (spec.md
/// §3 DeviceEntry lifecycle).
pub const GC_MAX_AGE_DAYS: f64 = 14.0;

struct PoolState {
    available: HashMap<DeviceKey, Vec<DeviceEntry>>,
    in_use: HashMap<String, DeviceEntry>,
    lock_files: HashMap<String, LockFile>,
}

pub struct DevicePool {
    toolchain: Arc<dyn Toolchain>,
    device_set: std::path::PathBuf,
    state: Mutex<PoolState>,
}

impl DevicePool {
    pub fn new(toolchain: Arc<dyn Toolchain>, device_set: std::path::PathBuf) -> Self {
        Self {
            toolchain,
            device_set,
            state: Mutex::new(PoolState {
                available: HashMap::new(),
                in_use: HashMap::new(),
                lock_files: HashMap::new(),
            }),
        }
    }

    /// Acquisition priority (spec.md §4.2): reuse an available device, else
    /// clone an unlocked Shutdown device with this key, else create fresh.
    pub async fn acquire(&self, device_type: &str, runtime: &str) -> anyhow::Result<String> {
        let key = DeviceKey {
            device_type: device_type.to_string(),
            runtime: runtime.to_string(),
        };

        if let Some(entry) = self.take_available(&key).await {
            return self.finish_acquire(entry).await;
        }

        if let Some(source_udid) = self.find_clone_source(&key).await? {
            let name = self.generate_name(&key).await?;
            let udid = self.toolchain.clone_device(&source_udid, &name).await?;
            let entry = DeviceEntry {
                udid,
                key: key.clone(),
            };
            return self.finish_acquire(entry).await;
        }

        let name = self.generate_name(&key).await?;
        let udid = self
            .toolchain
            .create_device(device_type, runtime, &name)
            .await?;
        let entry = DeviceEntry {
            udid,
            key: key.clone(),
        };
        self.finish_acquire(entry).await
    }

    async fn take_available(&self, key: &DeviceKey) -> Option<DeviceEntry> {
        let mut state = self.state.lock().await;
        let bucket = state.available.get_mut(key)?;
        bucket.pop()
    }

    /// A clone source is any device of this key known to the toolchain's
    /// device set that is currently Shutdown and not locked by another
    /// process. Booted or locked devices fall through to device creation.
    async fn find_clone_source(&self, key: &DeviceKey) -> anyhow::Result<Option<String>> {
        let candidates = self
            .toolchain
            .list_devices(Some(&key.device_type), Some(&key.runtime))
            .await?;
        for udid in candidates {
            let state = self.toolchain.device_state(&udid).await?;
            if state != Some(SimState::Shutdown) {
                continue;
            }
            if LockFile::is_acquirable(&self.device_set, &udid).await? {
                return Ok(Some(udid));
            }
        }
        Ok(None)
    }

    /// Common tail of every acquisition path: best-effort lock, fresh meta,
    /// record in `inUse` (spec.md §4.2 "On any success path").
    async fn finish_acquire(&self, entry: DeviceEntry) -> anyhow::Result<String> {
        let lock_file = LockFile::try_acquire(&self.device_set, &entry.udid)
            .await
            .unwrap_or(None);
        if lock_file.is_none() {
            warn!(udid = %entry.udid, "could not acquire device lock file; orphan detection degraded for this device");
        }

        DeviceMeta::now().write(&self.device_set, &entry.udid).await?;

        let mut state = self.state.lock().await;
        if let Some(lock_file) = lock_file {
            state.lock_files.insert(entry.udid.clone(), lock_file);
        }
        let udid = entry.udid.clone();
        state.in_use.insert(udid.clone(), entry);
        Ok(udid)
    }

    /// Shut the device down and return it to the pool. Errors if the id is
    /// not currently in use. If shutdown fails the device's state is
    /// unknown and it is NOT returned to `available`, but its LockFile is
    /// still released so it is not leaked (spec.md §4.2 Release).
    pub async fn release(&self, udid: &str) -> anyhow::Result<()> {
        let entry = {
            let mut state = self.state.lock().await;
            state
                .in_use
                .remove(udid)
                .ok_or_else(|| anyhow::anyhow!("device {udid} is not in use"))?
        };

        let shutdown_result = self.toolchain.shutdown_device(udid).await;

        let lock_file = self.state.lock().await.lock_files.remove(udid);
        if let Some(lock_file) = lock_file {
            lock_file.release(&self.device_set, udid).await?;
        }

        shutdown_result?;

        let mut state = self.state.lock().await;
        state
            .available
            .entry(entry.key.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    /// Shut down any device whose OS-visible state is Booted but whose
    /// LockFile is acquirable — its owning process died without releasing
    /// it. Sweeps the whole device set, not one (deviceType, runtime) key,
    /// since this runs once at start-up before any stream has named either
    /// (spec.md §4.2 CleanupOrphans).
    pub async fn cleanup_orphans(&self) -> anyhow::Result<()> {
        let candidates = self.toolchain.list_devices(None, None).await?;
        for udid in candidates {
            if self.state.lock().await.in_use.contains_key(&udid) {
                continue;
            }
            let Some(SimState::Booted) = self.toolchain.device_state(&udid).await? else {
                continue;
            };
            if LockFile::is_acquirable(&self.device_set, &udid).await? {
                info!(udid, "reclaiming orphaned booted device");
                self.toolchain.shutdown_device(&udid).await?;
            }
        }
        Ok(())
    }

    /// Delete idle devices whose meta last-used is older than
    /// `GC_MAX_AGE_DAYS`. In-use devices and devices with no meta file are
    /// skipped. Sweeps the whole device set for the same reason
    /// `cleanup_orphans` does (spec.md §4.2 GarbageCollect).
    pub async fn garbage_collect(&self) -> anyhow::Result<()> {
        let candidates = self.toolchain.list_devices(None, None).await?;
        let now = chrono::Utc::now();
        for udid in candidates {
            if self.state.lock().await.in_use.contains_key(&udid) {
                continue;
            }
            let Some(meta) = DeviceMeta::read(&self.device_set, &udid).await else {
                continue;
            };
            let Some(age_days) = meta.age_days(now) else {
                continue;
            };
            if age_days >= GC_MAX_AGE_DAYS {
                info!(udid, age_days, "garbage collecting idle device");
                let _ = self.toolchain.shutdown_device(&udid).await;
                self.toolchain.delete_device(&udid).await?;
                self.forget(&udid).await;
            }
        }
        Ok(())
    }

    /// Shut down every device (in-use and available) and clear the pool.
    pub async fn shutdown_all(&self) -> anyhow::Result<()> {
        let (in_use, available, lock_files) = {
            let mut state = self.state.lock().await;
            (
                std::mem::take(&mut state.in_use),
                std::mem::take(&mut state.available),
                std::mem::take(&mut state.lock_files),
            )
        };

        for udid in in_use.keys() {
            let _ = self.toolchain.shutdown_device(udid).await;
        }
        for entries in available.values() {
            for entry in entries {
                let _ = self.toolchain.shutdown_device(&entry.udid).await;
            }
        }
        for (udid, lock_file) in lock_files {
            let _ = lock_file.release(&self.device_set, &udid).await;
        }
        Ok(())
    }

    async fn forget(&self, udid: &str) {
        let mut state = self.state.lock().await;
        for bucket in state.available.values_mut() {
            bucket.retain(|e| e.udid != udid);
        }
        state.lock_files.remove(udid);
    }

    /// `axe <HumanName> (N)` where N is one greater than the highest
    /// existing suffix among devices of the same base name (spec.md §4.2
    /// "Name generation").
    async fn generate_name(&self, key: &DeviceKey) -> anyhow::Result<String> {
        let base = format!("axe {}", key.device_type);
        let existing = self.toolchain.list_devices(Some(&key.device_type), Some(&key.runtime)).await?;
        let mut max_n = 0u32;
        for udid in &existing {
            if let Some(n) = name_suffix(udid) {
                max_n = max_n.max(n);
            }
        }
        Ok(format!("{base} ({})", max_n + 1))
    }
}

/// Extract the `(N)` suffix from a device name, if present.
fn name_suffix(label: &str) -> Option<u32> {
    let open = label.rfind('(')?;
    let close = label.rfind(')')?;
    if close <= open {
        return None;
    }
    label[open + 1..close].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    struct FakeToolchain {
        devices: TokioMutex<HashMap<String, (DeviceKey, SimState)>>,
        next_id: AtomicU32,
    }

    impl FakeToolchain {
        fn new() -> Self {
            Self {
                devices: TokioMutex::new(HashMap::new()),
                next_id: AtomicU32::new(0),
            }
        }

        fn fresh_udid(&self) -> String {
            format!("udid-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        async fn set_state(&self, udid: &str, state: SimState) {
            if let Some(entry) = self.devices.lock().await.get_mut(udid) {
                entry.1 = state;
            }
        }
    }

    #[async_trait]
    impl Toolchain for FakeToolchain {
        async fn create_device(&self, device_type: &str, runtime: &str, _name: &str) -> anyhow::Result<String> {
            let udid = self.fresh_udid();
            self.devices.lock().await.insert(
                udid.clone(),
                (
                    DeviceKey {
                        device_type: device_type.to_string(),
                        runtime: runtime.to_string(),
                    },
                    SimState::Shutdown,
                ),
            );
            Ok(udid)
        }

        async fn clone_device(&self, source_udid: &str, _name: &str) -> anyhow::Result<String> {
            let key = self.devices.lock().await.get(source_udid).unwrap().0.clone();
            let udid = self.fresh_udid();
            self.devices.lock().await.insert(udid.clone(), (key, SimState::Shutdown));
            Ok(udid)
        }

        async fn delete_device(&self, udid: &str) -> anyhow::Result<()> {
            self.devices.lock().await.remove(udid);
            Ok(())
        }

        async fn shutdown_device(&self, udid: &str) -> anyhow::Result<()> {
            if let Some(entry) = self.devices.lock().await.get_mut(udid) {
                entry.1 = SimState::Shutdown;
            }
            Ok(())
        }

        async fn device_state(&self, udid: &str) -> anyhow::Result<Option<SimState>> {
            Ok(self.devices.lock().await.get(udid).map(|(_, s)| *s))
        }

        async fn list_devices(&self, device_type: Option<&str>, runtime: Option<&str>) -> anyhow::Result<Vec<String>> {
            let devices = self.devices.lock().await;
            Ok(devices
                .iter()
                .filter(|(_, (k, _))| device_type.is_none_or(|t| k.device_type == t) && runtime.is_none_or(|r| k.runtime == r))
                .map(|(udid, _)| udid.clone())
                .collect())
        }

        async fn fetch_build_settings(&self) -> anyhow::Result<crate::toolchain::BuildSettings> {
            unimplemented!()
        }
        async fn build_project(&self) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn install_app(&self, _udid: &str, _bundle_path: &Path) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn terminate_app(&self, _udid: &str, _bundle_id: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn launch_app(
            &self,
            _udid: &str,
            _bundle_id: &str,
            _env: &[(String, String)],
            _injected_libs: &[PathBuf],
        ) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn compile_dylib(&self, _source: &str, _extra_flags: &[String], _out_dir: &Path) -> anyhow::Result<PathBuf> {
            unimplemented!()
        }
        async fn codesign(&self, _path: &Path) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn screen_size(&self, _udid: &str) -> anyhow::Result<(u32, u32)> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn acquire_creates_then_reuses_released_device() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DevicePool::new(Arc::new(FakeToolchain::new()), dir.path().to_path_buf());

        let udid1 = pool.acquire("iPhone 15", "iOS-17-0").await.unwrap();
        pool.release(&udid1).await.unwrap();
        let udid2 = pool.acquire("iPhone 15", "iOS-17-0").await.unwrap();

        assert_eq!(udid1, udid2, "released device should be reused before creating a new one");
    }

    #[tokio::test]
    async fn acquire_does_not_reuse_a_released_device_of_a_different_key() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DevicePool::new(Arc::new(FakeToolchain::new()), dir.path().to_path_buf());

        let udid1 = pool.acquire("iPhone 15", "iOS-17-0").await.unwrap();
        pool.release(&udid1).await.unwrap();
        let udid2 = pool.acquire("iPhone 14", "iOS-17-0").await.unwrap();

        assert_ne!(udid1, udid2, "a different deviceType/runtime key must not reuse another key's released device");
    }

    #[tokio::test]
    async fn acquire_clones_unlocked_shutdown_device_over_creating() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Arc::new(FakeToolchain::new());
        let pool = DevicePool::new(toolchain.clone(), dir.path().to_path_buf());

        let source = toolchain.create_device("iPhone 15", "iOS-17-0", "seed").await.unwrap();

        let udid = pool.acquire("iPhone 15", "iOS-17-0").await.unwrap();
        assert_ne!(udid, source, "clone should produce a new udid, not reuse the source directly");

        let devices = toolchain.devices.lock().await;
        assert_eq!(devices.len(), 2);
    }

    #[tokio::test]
    async fn release_of_unknown_device_errors() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DevicePool::new(Arc::new(FakeToolchain::new()), dir.path().to_path_buf());
        let result = pool.release("ghost").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn garbage_collect_skips_devices_without_meta() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Arc::new(FakeToolchain::new());
        let udid = toolchain.create_device("iPhone 15", "iOS-17-0", "seed").await.unwrap();
        let pool = DevicePool::new(toolchain.clone(), dir.path().to_path_buf());

        pool.garbage_collect().await.unwrap();

        assert!(toolchain.devices.lock().await.contains_key(&udid), "no-meta device must survive GC");
    }

    #[tokio::test]
    async fn garbage_collect_skips_devices_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Arc::new(FakeToolchain::new());
        let pool = DevicePool::new(toolchain.clone(), dir.path().to_path_buf());

        let udid = pool.acquire("iPhone 15", "iOS-17-0").await.unwrap();
        pool.garbage_collect().await.unwrap();

        assert!(toolchain.devices.lock().await.contains_key(&udid), "in-use device must survive GC");
    }

    async fn write_meta_with_age(device_set: &Path, udid: &str, age_days: f64) {
        let last_used = (chrono::Utc::now() - chrono::Duration::seconds((age_days * 86400.0) as i64)).to_rfc3339();
        DeviceMeta { last_used }.write(device_set, udid).await.unwrap();
    }

    /// Scenario H: of an in-use device, a fresh-meta device, a no-meta
    /// device, and a stale-meta device, GC deletes only the one older than
    /// `GC_MAX_AGE_DAYS`.
    #[tokio::test]
    async fn garbage_collect_deletes_only_the_device_older_than_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Arc::new(FakeToolchain::new());
        let pool = DevicePool::new(toolchain.clone(), dir.path().to_path_buf());

        let in_use = pool.acquire("iPhone 15", "iOS-17-0").await.unwrap();
        let no_meta = toolchain.create_device("iPhone 15", "iOS-17-0", "no-meta").await.unwrap();
        let fresh = toolchain.create_device("iPhone 15", "iOS-17-0", "fresh").await.unwrap();
        let stale = toolchain.create_device("iPhone 15", "iOS-17-0", "stale").await.unwrap();
        write_meta_with_age(dir.path(), &fresh, 1.0).await;
        write_meta_with_age(dir.path(), &stale, GC_MAX_AGE_DAYS + 1.0).await;

        pool.garbage_collect().await.unwrap();

        let devices = toolchain.devices.lock().await;
        assert!(devices.contains_key(&in_use), "in-use device must survive GC");
        assert!(devices.contains_key(&no_meta), "no-meta device must survive GC");
        assert!(devices.contains_key(&fresh), "recently-used device must survive GC");
        assert!(!devices.contains_key(&stale), "device older than the max age must be deleted");
    }

    /// Scenario G: of two Booted devices, one with a live owner holding its
    /// lock and one whose lock is acquirable, CleanupOrphans shuts down
    /// only the acquirable (orphaned) one.
    #[tokio::test]
    async fn cleanup_orphans_shuts_down_only_the_unlocked_booted_device() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Arc::new(FakeToolchain::new());
        let pool = DevicePool::new(toolchain.clone(), dir.path().to_path_buf());

        let locked = toolchain.create_device("iPhone 15", "iOS-17-0", "locked").await.unwrap();
        let orphan = toolchain.create_device("iPhone 15", "iOS-17-0", "orphan").await.unwrap();
        toolchain.set_state(&locked, SimState::Booted).await;
        toolchain.set_state(&orphan, SimState::Booted).await;

        // A live owning process holds this device's lock.
        let held_lock = LockFile::try_acquire(dir.path(), &locked).await.unwrap().unwrap();

        pool.cleanup_orphans().await.unwrap();

        assert_eq!(toolchain.device_state(&locked).await.unwrap(), Some(SimState::Booted), "locked device must survive cleanup");
        assert_eq!(toolchain.device_state(&orphan).await.unwrap(), Some(SimState::Shutdown), "unlocked orphan must be shut down");

        held_lock.release(dir.path(), &locked).await.unwrap();
    }
}
