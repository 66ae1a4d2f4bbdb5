//! Project and daemon configuration.
//!
//! CLI flag parsing is intentionally thin (spec.md §1 lists it as an external
//! concern); `ProjectConfig` is the single place absolute-path normalization
//! and the workspace-vs-project derivation happen, per spec.md §9.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

/// CLI entry point flags for the `axe-previewd` binary.
#[derive(Debug, Parser)]
#[command(name = "axe-previewd", about = "Concurrent SwiftUI preview orchestrator")]
pub struct Cli {
    /// Path to the .xcodeproj, if not using a workspace.
    #[arg(long)]
    pub project: Option<PathBuf>,

    /// Path to the .xcworkspace. Takes precedence over --project.
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Xcode scheme to build.
    #[arg(long)]
    pub scheme: String,

    /// Build configuration (Debug/Release).
    #[arg(long, default_value = "Debug")]
    pub configuration: String,

    /// Directory simctl treats as a private device catalog.
    #[arg(long)]
    pub device_set: PathBuf,

    /// Root cache directory under which per-project state is kept.
    #[arg(long)]
    pub cache_root: PathBuf,
}

/// Resolved, immutable project configuration shared by every stream.
///
/// Paths are normalized to absolute form once, at construction, so no
/// downstream component re-derives or re-validates them.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    project: Option<PathBuf>,
    workspace: Option<PathBuf>,
    pub scheme: String,
    pub configuration: String,
    pub device_set: PathBuf,
    pub cache_root: PathBuf,
}

impl ProjectConfig {
    pub fn new(
        project: Option<PathBuf>,
        workspace: Option<PathBuf>,
        scheme: String,
        configuration: String,
        device_set: PathBuf,
        cache_root: PathBuf,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            project.is_some() || workspace.is_some(),
            "one of --project or --workspace is required"
        );
        Ok(Self {
            project: project.map(|p| normalize(&p)).transpose()?,
            workspace: workspace.map(|p| normalize(&p)).transpose()?,
            scheme,
            configuration,
            device_set: normalize(&device_set)?,
            cache_root: normalize(&cache_root)?,
        })
    }

    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        Self::new(
            cli.project,
            cli.workspace,
            cli.scheme,
            cli.configuration,
            cli.device_set,
            cli.cache_root,
        )
    }

    /// The workspace if set, else the project. Derived, never stored
    /// separately (spec.md §9).
    pub fn primary_path(&self) -> &Path {
        self.workspace
            .as_deref()
            .or(self.project.as_deref())
            .expect("constructor guarantees at least one of project/workspace")
    }

    pub fn project(&self) -> Option<&Path> {
        self.project.as_deref()
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    /// `<root>/preview-<projhash>/` — the per-project cache root (§6).
    pub fn project_cache_dir(&self) -> PathBuf {
        self.cache_root.join(format!("preview-{}", self.project_hash()))
    }

    pub fn build_dir(&self) -> PathBuf {
        self.project_cache_dir().join("build")
    }

    pub fn project_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.primary_path().to_string_lossy().as_bytes());
        hasher.update(self.scheme.as_bytes());
        let digest = hasher.finalize();
        hex_prefix(&digest, 16)
    }
}

fn normalize(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in bytes {
        if out.len() >= chars {
            break;
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out.truncate(chars);
    out
}

/// `<configRoot>/config.json` — persisted default simulator selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedConfig {
    #[serde(rename = "defaultSimulator")]
    pub default_simulator: Option<String>,
}

impl PersistedConfig {
    /// Atomically write via temp-file + rename, per spec.md §6.
    pub async fn write_atomic(&self, path: &Path) -> anyhow::Result<()> {
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn read(path: &Path) -> anyhow::Result<Self> {
        let body = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
