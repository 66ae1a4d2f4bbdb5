//! Companion process supervisor (spec.md §4.3).
//!
//! Launches an external helper, reads its first stdout line for a boot
//! confirmation or gRPC port, and exposes graceful SIGTERM→SIGKILL stop.
//! Process-group spawn/kill is grounded in the teacher's
//! `reload/rebuild.rs::kill_build_process` (process-group SIGTERM via `nix`,
//! hard `kill()` fallback) generalized to a long-lived supervised process
//! instead of a one-shot build.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use command_group::AsyncCommandGroup;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionMode {
    /// Wait for `{"grpc_port":N}` with N > 0.
    Serve,
    /// Wait for a JSON line containing `"state":"Booted"`.
    Boot,
}

impl CompanionMode {
    fn first_line_deadline(self) -> Duration {
        match self {
            CompanionMode::Serve => Duration::from_secs(10),
            CompanionMode::Boot => Duration::from_secs(120),
        }
    }
}

/// A handle to a running (or recently exited) companion process.
///
/// The monitor task owns the `Child`/process group and reaps it exactly
/// once; `stop()` only needs the pid to signal it, so multiple concurrent
/// `stop()` calls (and calls after the process has already exited) are all
/// safe.
pub struct CompanionHandle {
    pid: Option<i32>,
    done_rx: watch::Receiver<bool>,
    exit_error: Arc<Mutex<Option<String>>>,
    port: Option<u16>,
}

impl CompanionHandle {
    /// A watch that flips to `true` when the process exits.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Readable only after `done()` fires.
    pub async fn err(&self) -> Option<String> {
        self.exit_error.lock().await.clone()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn address(&self) -> Option<String> {
        self.port.map(|p| format!("127.0.0.1:{p}"))
    }

    /// Idempotent and crash-tolerant: SIGTERM, wait up to 5s, escalate to
    /// SIGKILL, always block on `done()` before returning.
    pub async fn stop(&self) {
        if *self.done_rx.borrow() {
            return;
        }

        if let Some(pid) = self.pid {
            signal_process_group(pid, false);
        }

        let mut rx = self.done_rx.clone();
        let timed_out = timeout(Duration::from_secs(5), rx.wait_for(|done| *done)).await.is_err();
        if timed_out {
            if let Some(pid) = self.pid {
                signal_process_group(pid, true);
            }
            let _ = rx.wait_for(|done| *done).await;
        }
    }
}

#[cfg(unix)]
fn signal_process_group(pid: i32, kill: bool) {
    use nix::sys::signal::{Signal, kill as nix_kill};
    use nix::unistd::Pid;
    let signal = if kill { Signal::SIGKILL } else { Signal::SIGTERM };
    let _ = nix_kill(Pid::from_raw(-pid), signal);
}

#[cfg(not(unix))]
fn signal_process_group(_pid: i32, _kill: bool) {}

/// Start an external companion process and wait for its confirmation line.
pub async fn start(
    program: &str,
    args: &[String],
    mode: CompanionMode,
) -> anyhow::Result<CompanionHandle> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::null());

    let mut group = cmd
        .group_spawn()
        .map_err(|e| anyhow::anyhow!("failed to start companion: {e}"))?;

    let pid = group.id().map(|id| id as i32);

    let stdout = group
        .inner()
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("failed to capture companion stdout"))?;

    let first_line = timeout(mode.first_line_deadline(), read_first_line(stdout)).await;

    let first_line = match first_line {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => {
            let _ = group.kill().await;
            let msg = match mode {
                CompanionMode::Serve => "companion did not output a port",
                CompanionMode::Boot => "companion did not report Booted state",
            };
            anyhow::bail!(msg);
        }
        Ok(Err(e)) => {
            let _ = group.kill().await;
            return Err(e);
        }
        Err(_) => {
            let _ = group.kill().await;
            anyhow::bail!("timed out waiting for companion's first output line");
        }
    };

    let port = parse_confirmation(&first_line, mode)?;

    let (done_tx, done_rx) = watch::channel(false);
    let exit_error = Arc::new(Mutex::new(None));
    let monitor_error = Arc::clone(&exit_error);

    tokio::spawn(async move {
        match group.wait().await {
            Ok(status) if !status.success() => {
                *monitor_error.lock().await = Some(format!("companion exited with {status}"));
            }
            Err(e) => {
                *monitor_error.lock().await = Some(e.to_string());
            }
            _ => {}
        }
        let _ = done_tx.send(true);
    });

    Ok(CompanionHandle {
        pid,
        done_rx,
        exit_error,
        port,
    })
}

async fn read_first_line(
    stdout: tokio::process::ChildStdout,
) -> anyhow::Result<Option<String>> {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        Ok(None)
    } else {
        Ok(Some(line.trim_end().to_string()))
    }
}

fn parse_confirmation(line: &str, mode: CompanionMode) -> anyhow::Result<Option<u16>> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| anyhow::anyhow!("companion produced non-JSON output: {e}"))?;
    match mode {
        CompanionMode::Serve => {
            let port = value
                .get("grpc_port")
                .and_then(serde_json::Value::as_u64)
                .filter(|p| *p > 0)
                .ok_or_else(|| anyhow::anyhow!("companion did not output a port"))?;
            Ok(Some(port as u16))
        }
        CompanionMode::Boot => {
            let state = value.get("state").and_then(serde_json::Value::as_str);
            if state == Some("Booted") {
                Ok(None)
            } else {
                anyhow::bail!("companion did not report Booted state")
            }
        }
    }
}

/// Starts the simulator-boot companion and the combined video/HID
/// companion, handing back the client-side traits a stream drives them
/// through (spec.md §3 item 14). One production implementation shells out
/// to the real companion binary; tests inject a fake.
#[async_trait::async_trait]
pub trait CompanionFactory: Send + Sync {
    async fn start_boot_companion(&self, udid: &str) -> anyhow::Result<CompanionHandle>;

    async fn start_video_hid_companion(
        &self,
        udid: &str,
    ) -> anyhow::Result<(
        CompanionHandle,
        std::sync::Arc<dyn crate::video::VideoSource>,
        std::sync::Arc<dyn crate::hid::HidClient>,
    )>;
}
