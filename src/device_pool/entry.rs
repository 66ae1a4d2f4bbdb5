//! Device catalog entries, on-disk metadata, and per-device advisory locks
//! (spec.md §3 DeviceEntry / DeviceMeta / LockFile).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs4::TryLockError;
use fs4::tokio::AsyncFileExt;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub device_type: String,
    pub runtime: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimState {
    Shutdown,
    Booted,
}

#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub udid: String,
    pub key: DeviceKey,
}

/// `<deviceSet>/<udid>.meta.json` — last-used timestamp for GC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMeta {
    #[serde(rename = "lastUsed")]
    pub last_used: String,
}

impl DeviceMeta {
    pub fn now() -> Self {
        Self {
            last_used: Utc::now().to_rfc3339(),
        }
    }

    pub async fn write(&self, device_set: &Path, udid: &str) -> anyhow::Result<()> {
        let path = meta_path(device_set, udid);
        let body = serde_json::to_vec(self)?;
        tokio::fs::write(path, body).await?;
        Ok(())
    }

    pub async fn read(device_set: &Path, udid: &str) -> Option<Self> {
        let body = tokio::fs::read(meta_path(device_set, udid)).await.ok()?;
        serde_json::from_slice(&body).ok()
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> Option<f64> {
        let parsed = DateTime::parse_from_rfc3339(&self.last_used).ok()?.with_timezone(&Utc);
        Some((now - parsed).num_seconds() as f64 / 86400.0)
    }
}

fn meta_path(device_set: &Path, udid: &str) -> PathBuf {
    device_set.join(format!("{udid}.meta.json"))
}

fn lock_path(device_set: &Path, udid: &str) -> PathBuf {
    device_set.join(format!("{udid}.lock"))
}

/// An OS advisory lock proving a device's owning process is alive. Released
/// automatically by the OS on process exit (the guarantee that makes orphan
/// recovery possible — spec.md §5).
pub struct LockFile {
    file: File,
}

impl LockFile {
    /// Try to acquire the per-device lock, non-blocking exclusive. Silent
    /// acquisition failure is tolerated by callers (spec.md §4.2) — this
    /// just reports whether it succeeded.
    pub async fn try_acquire(device_set: &Path, udid: &str) -> anyhow::Result<Option<Self>> {
        let path = lock_path(device_set, udid);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        match file.try_lock() {
            Ok(()) => Ok(Some(Self { file })),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Error(e)) => Err(e.into()),
        }
    }

    /// True iff the lock is currently acquirable — i.e. no live owner holds
    /// it. Used for orphan detection (spec.md §4.2): a held lock implies an
    /// active owner, the file's mere presence is not evidence.
    pub async fn is_acquirable(device_set: &Path, udid: &str) -> anyhow::Result<bool> {
        let path = lock_path(device_set, udid);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        match file.try_lock() {
            Ok(()) => {
                AsyncFileExt::unlock(&file)?;
                Ok(true)
            }
            Err(TryLockError::WouldBlock) => Ok(false),
            Err(TryLockError::Error(e)) => Err(e.into()),
        }
    }

    /// Release and delete the lock file (orderly release, spec.md §3).
    pub async fn release(self, device_set: &Path, udid: &str) -> anyhow::Result<()> {
        let _ = AsyncFileExt::unlock(&self.file);
        drop(self.file);
        let _ = tokio::fs::remove_file(lock_path(device_set, udid)).await;
        Ok(())
    }
}
