//! Stream-termination taxonomy and phase-tagged lock errors.
//!
//! `anyhow::Result` covers most internal plumbing (matching the teacher's
//! `reload/rebuild.rs`); this module exists only for the handful of error
//! shapes that cross the wire or are matched on programmatically.

use serde::{Deserialize, Serialize};

/// Why a [`crate::stream::Stream`] terminated. Serializes to the exact
/// snake_case values named in the wire protocol (`StreamStopped.reason`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStopReason {
    BootError,
    BuildError,
    InstallError,
    RuntimeError,
    ResourceError,
    InternalError,
    Removed,
}

impl StreamStopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStopReason::BootError => "boot_error",
            StreamStopReason::BuildError => "build_error",
            StreamStopReason::InstallError => "install_error",
            StreamStopReason::RuntimeError => "runtime_error",
            StreamStopReason::ResourceError => "resource_error",
            StreamStopReason::InternalError => "internal_error",
            StreamStopReason::Removed => "removed",
        }
    }
}

/// Failures from [`crate::buildlock::BuildLock`], tagged with the phase in
/// which they occurred so callers can report a precise diagnostic.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("creating lock directory: {0}")]
    CreatingDirectory(#[source] std::io::Error),
    #[error("opening lock file: {0}")]
    OpeningFile(#[source] std::io::Error),
    #[error("lock wait cancelled")]
    Cancelled,
    #[error("lock error: {0}")]
    Other(#[source] std::io::Error),
}

/// Failures from the reload deployer's loader-socket RPC (§4.7).
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("loader reported error: {0}")]
    Loader(String),
    #[error("unexpected loader response: {0}")]
    UnexpectedResponse(String),
    #[error("socket connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("socket io failed: {0}")]
    Io(#[source] std::io::Error),
}
