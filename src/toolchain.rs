//! Trait boundary for the out-of-scope Xcode/simctl toolchain (spec.md §1,
//! item 2). Production code shells out to `xcodebuild`/`simctl`; tests swap
//! in a fake, the same injection style the teacher uses for
//! `RebuildCallbacks` (CLI-specific behavior kept out of the pipeline that
//! drives it).

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::device_pool::entry::SimState;

/// Resolved build inputs, fetched once per project (spec.md §3
/// BuildSettings).
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub module_name: String,
    pub bundle_id: String,
    pub axe_bundle_id: String,
    pub built_products_dir: PathBuf,
    pub deployment_target: String,
    pub swift_version: String,
    pub extra_compiler_flags: Vec<String>,
}

/// Every external process invocation gets a 30s deadline by default
/// (spec.md §5).
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Toolchain: Send + Sync {
    /// `simctl create` — returns the new device's udid.
    async fn create_device(&self, device_type: &str, runtime: &str, name: &str) -> anyhow::Result<String>;

    /// `simctl clone` — returns the clone's udid.
    async fn clone_device(&self, source_udid: &str, name: &str) -> anyhow::Result<String>;

    /// `simctl delete`.
    async fn delete_device(&self, udid: &str) -> anyhow::Result<()>;

    /// `simctl shutdown`.
    async fn shutdown_device(&self, udid: &str) -> anyhow::Result<()>;

    /// `simctl list` state for one device.
    async fn device_state(&self, udid: &str) -> anyhow::Result<Option<SimState>>;

    /// Known devices in the device set, optionally filtered by
    /// (deviceType, runtime). `None`/`None` lists every device, used by
    /// `CleanupOrphans`/`GarbageCollect`, which sweep the whole catalog
    /// rather than one key at a time (spec.md §4.2).
    async fn list_devices(&self, device_type: Option<&str>, runtime: Option<&str>) -> anyhow::Result<Vec<String>>;

    /// `xcodebuild` for the project, returning the fetched build settings.
    async fn fetch_build_settings(&self) -> anyhow::Result<BuildSettings>;

    /// Run the full project build under the exclusive build lock.
    async fn build_project(&self) -> anyhow::Result<()>;

    /// `simctl install`.
    async fn install_app(&self, udid: &str, bundle_path: &Path) -> anyhow::Result<()>;

    /// `simctl terminate`, tolerating "not running".
    async fn terminate_app(&self, udid: &str, bundle_id: &str) -> anyhow::Result<()>;

    /// `simctl launch` with environment (loader socket path) and extra
    /// injected libraries (`DYLD_INSERT_LIBRARIES`).
    async fn launch_app(
        &self,
        udid: &str,
        bundle_id: &str,
        env: &[(String, String)],
        injected_libs: &[PathBuf],
    ) -> anyhow::Result<()>;

    /// Compile combined thunk source (or the injected loader) to a dylib
    /// with `swiftc`/`clang`, using the project's cached compiler flags.
    async fn compile_dylib(
        &self,
        source: &str,
        extra_flags: &[String],
        out_dir: &Path,
    ) -> anyhow::Result<PathBuf>;

    /// `codesign`.
    async fn codesign(&self, path: &Path) -> anyhow::Result<()>;

    /// Screen size in points, used for HID coordinate conversion.
    async fn screen_size(&self, udid: &str) -> anyhow::Result<(u32, u32)>;
}
