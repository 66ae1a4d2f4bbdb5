//! Reload deployer: hot-reload via the in-process loader socket, falling
//! back to terminate/relaunch (spec.md §4.7).

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::ReloadError;
use crate::toolchain::Toolchain;

const BACKOFF_MS: [u64; 4] = [50, 100, 200, 400];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    HotReloaded,
    Relaunched,
}

/// Send a dylib path to the loader over its Unix socket with exponential
/// backoff, falling back to terminate/relaunch on any failure.
pub async fn deploy(
    toolchain: &dyn Toolchain,
    socket_path: &Path,
    dylib_path: &Path,
    udid: &str,
    bundle_id: &str,
    env: &[(String, String)],
    injected_libs: &[PathBuf],
) -> anyhow::Result<DeployOutcome> {
    match try_hot_reload(socket_path, dylib_path).await {
        Ok(()) => Ok(DeployOutcome::HotReloaded),
        Err(_reason) => {
            toolchain.terminate_app(udid, bundle_id).await?;
            toolchain
                .launch_app(udid, bundle_id, env, injected_libs)
                .await?;
            Ok(DeployOutcome::Relaunched)
        }
    }
}

async fn try_hot_reload(socket_path: &Path, dylib_path: &Path) -> Result<(), ReloadError> {
    let mut last_err = None;
    for delay_ms in BACKOFF_MS {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return send_reload(stream, dylib_path).await,
            Err(e) => {
                last_err = Some(ReloadError::Connect(e));
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
    Err(last_err.unwrap_or(ReloadError::Connect(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "loader socket unreachable",
    ))))
}

async fn send_reload(mut stream: UnixStream, dylib_path: &Path) -> Result<(), ReloadError> {
    let (read_half, mut write_half) = stream.split();
    let mut line = dylib_path.to_string_lossy().into_owned();
    line.push('\n');
    write_half
        .write_all(line.as_bytes())
        .await
        .map_err(ReloadError::Io)?;

    let mut reader = BufReader::new(read_half);
    let mut response = String::new();
    reader
        .read_line(&mut response)
        .await
        .map_err(ReloadError::Io)?;
    let response = response.trim_end();

    if response == "OK" {
        Ok(())
    } else if let Some(reason) = response.strip_prefix("ERR:") {
        Err(ReloadError::Loader(reason.to_string()))
    } else {
        Err(ReloadError::UnexpectedResponse(response.to_string()))
    }
}
