//! Per-stream lifecycle state machine (spec.md §4.8).
//!
//! One task per stream, driven by a single `tokio::select!` loop over file
//! changes, editor commands, and companion liveness — no shared event loop,
//! matching the teacher's "one worker per concern" shape generalized from a
//! single dev session to many concurrent ones.

pub mod watch_state;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::buildlock::CancelToken;
use crate::classify::{self, Classification};
use crate::companion::CompanionHandle;
use crate::error::StreamStopReason;
use crate::hid::HidHandler;
use crate::manager::StreamManagerHandle;
use crate::parser::AccessLevel;
use crate::reload_deploy;
use crate::video;
use crate::watcher::ChangeEvent;
use crate::wire::{Event, InputParams, Phase};

use watch_state::{DebounceFired, WatchState, filter_private_collisions};

pub struct StreamCommandChannels {
    pub switch_file_tx: mpsc::Sender<String>,
    pub next_preview_tx: mpsc::Sender<()>,
    pub input_tx: mpsc::Sender<InputParams>,
}

const LOADER_SOURCE: &str = "// injected loader entry point";

/// Resources acquired while this stream's process-tree lives, tracked so
/// cleanup knows what it actually needs to tear down (spec.md §4.8 Cleanup).
struct Session {
    device: Option<String>,
    bundle_id: String,
    axe_bundle_id: String,
    socket_path: PathBuf,
    thunk_dir: PathBuf,
    loader_dir: PathBuf,
    staging_dir: PathBuf,
    registered_with_watcher: bool,
    boot_companion: Option<CompanionHandle>,
    video_hid_companion: Option<CompanionHandle>,
    app_installed: bool,
}

impl Session {
    fn empty() -> Self {
        Self {
            device: None,
            bundle_id: String::new(),
            axe_bundle_id: String::new(),
            socket_path: PathBuf::new(),
            thunk_dir: PathBuf::new(),
            loader_dir: PathBuf::new(),
            staging_dir: PathBuf::new(),
            registered_with_watcher: false,
            boot_companion: None,
            video_hid_companion: None,
            app_installed: false,
        }
    }
}

/// Everything the running event loop needs once init has completed.
struct Running {
    watch_state: Arc<WatchState>,
    hid_handler: Arc<HidHandler>,
    file_change_rx: mpsc::Receiver<ChangeEvent>,
    target_file: PathBuf,
    relay_failed_rx: watch::Receiver<bool>,
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    handle: StreamManagerHandle,
    stream_id: String,
    target_file: PathBuf,
    device_type: String,
    runtime: String,
    cancel: CancelToken,
    mut switch_file_rx: mpsc::Receiver<String>,
    mut next_preview_rx: mpsc::Receiver<()>,
    mut input_rx: mpsc::Receiver<InputParams>,
) {
    let mut session = Session::empty();

    let (stop_reason, message) = match init_pipeline(&handle, &stream_id, target_file, &device_type, &runtime, &cancel, &mut session).await {
        Ok(running) => {
            run_event_loop(&handle, &stream_id, &cancel, &mut session, running, &mut switch_file_rx, &mut next_preview_rx, &mut input_rx).await
        }
        Err(failure) => failure,
    };

    cleanup(&handle, &stream_id, &mut session).await;

    let _ = handle.events.send(Event::stopped(stream_id, stop_reason, message, None)).await;
}

/// Steps 1-13 of spec.md §4.8: acquire every resource up through "enter the
/// event loop". Any failure aborts with its reason; the caller always runs
/// the full cleanup chain regardless of how far this got.
async fn init_pipeline(
    handle: &StreamManagerHandle,
    stream_id: &str,
    target_file: PathBuf,
    device_type: &str,
    runtime: &str,
    cancel: &CancelToken,
    session: &mut Session,
) -> Result<Running, (StreamStopReason, String)> {
    // 1. Acquire device.
    let device = handle
        .device_pool
        .acquire(device_type, runtime)
        .await
        .map_err(|e| (StreamStopReason::ResourceError, e.to_string()))?;
    session.device = Some(device.clone());

    // 2. Allocate per-stream working directories.
    let device_dir = handle.config.project_cache_dir().join("devices").join(&device);
    session.thunk_dir = device_dir.join("thunk");
    session.loader_dir = device_dir.join("loader");
    session.staging_dir = device_dir.join("staging");
    for dir in [&session.thunk_dir, &session.loader_dir, &session.staging_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| (StreamStopReason::InternalError, e.to_string()))?;
    }
    session.socket_path = socket_path(&handle.config.project_cache_dir(), &device);

    // 3. Boot simulator via companion.
    let _ = handle.events.send(Event::status(stream_id, Phase::Booting)).await;
    let boot = handle
        .companion_factory
        .start_boot_companion(&device)
        .await
        .map_err(|e| (StreamStopReason::BootError, e.to_string()))?;
    if *boot.done().borrow() {
        let err = boot.err().await.unwrap_or_else(|| "boot companion exited immediately".to_string());
        session.boot_companion = Some(boot);
        return Err((StreamStopReason::BootError, err));
    }
    session.boot_companion = Some(boot);

    // 4. Fetch BuildSettings once per StreamManager.
    let settings = handle
        .build_settings()
        .await
        .map_err(|e| (StreamStopReason::BuildError, e.to_string()))?;
    session.bundle_id = settings.bundle_id.clone();
    session.axe_bundle_id = settings.axe_bundle_id.clone();

    // 5. Run project build under BuildLock exclusive.
    let _ = handle.events.send(Event::status(stream_id, Phase::Building)).await;
    run_full_build(handle, cancel).await.map_err(|e| (StreamStopReason::BuildError, e.to_string()))?;

    // 7-8. Parse, filter collisions, generate + compile + codesign thunk, deploy.
    let watch_state = Arc::new(WatchState::new(1));
    run_thunk_pipeline(handle, &target_file, &session.thunk_dir, &watch_state, "0", &device, &session.socket_path, &session.axe_bundle_id)
        .await
        .map_err(|e| (StreamStopReason::BuildError, e.to_string()))?;

    // 9. Terminate prior instance, install staged app, compile loader.
    let _ = handle.events.send(Event::status(stream_id, Phase::Installing)).await;
    let _ = handle.toolchain.terminate_app(&device, &session.axe_bundle_id).await;
    handle
        .toolchain
        .install_app(&device, &session.staging_dir)
        .await
        .map_err(|e| (StreamStopReason::InstallError, e.to_string()))?;
    session.app_installed = true;
    let loader_dylib = handle
        .loader_dylib(LOADER_SOURCE, &session.loader_dir)
        .await
        .map_err(|e| (StreamStopReason::InstallError, e.to_string()))?;

    // 10. Launch with loader + initial dylib injected, socket path in env.
    let env = vec![("AXE_LOADER_SOCKET".to_string(), session.socket_path.to_string_lossy().into_owned())];
    let injected_libs = vec![loader_dylib];
    handle
        .toolchain
        .launch_app(&device, &session.axe_bundle_id, &env, &injected_libs)
        .await
        .map_err(|e| (StreamStopReason::InstallError, e.to_string()))?;

    // 11. Count preview blocks, emit StreamStarted.
    let parse = handle
        .analyzer
        .parse(&target_file)
        .await
        .map_err(|e| (StreamStopReason::BuildError, e.to_string()))?;
    let _ = handle.events.send(Event::started(stream_id, parse.preview_count)).await;
    watch_state.reset_preview_cycle(parse.preview_count.max(1)).await;

    // 12. Start video/HID companion, video relay, query screen size.
    let (video_hid, video_source, hid_client) = handle
        .companion_factory
        .start_video_hid_companion(&device)
        .await
        .map_err(|e| (StreamStopReason::RuntimeError, e.to_string()))?;
    session.video_hid_companion = Some(video_hid);

    let screen_size = handle.toolchain.screen_size(&device).await.unwrap_or((0, 0));
    let aspect = if screen_size.1 == 0 { 1.0 } else { screen_size.0 as f64 / screen_size.1 as f64 };

    let hid_handler = Arc::new(HidHandler::new(Some(hid_client), screen_size));
    let device_name = device.clone();
    let relay_stream_id = stream_id.to_string();
    let relay_file = target_file.to_string_lossy().into_owned();
    let relay_events = handle.events.clone();
    let relay_cancel = cancel.clone();
    let (relay_failed_tx, relay_failed_rx) = watch::channel(false);
    tokio::spawn(async move {
        video::run_relay(
            video_source.as_ref(),
            &device_name,
            &device_name,
            &relay_file,
            &relay_stream_id,
            &relay_events,
            aspect,
            relay_cancel,
            relay_failed_tx,
        )
        .await;
    });

    // 13. Register with the shared watcher.
    let file_change_rx = handle.watcher.register(stream_id).await;
    session.registered_with_watcher = true;

    let _ = handle.events.send(Event::status(stream_id, Phase::Running)).await;

    Ok(Running {
        watch_state,
        hid_handler,
        file_change_rx,
        target_file,
        relay_failed_rx,
    })
}

fn socket_path(cache_root: &Path, udid: &str) -> PathBuf {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(udid.as_bytes());
    let digest = hasher.finalize();
    let hash: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    cache_root.join(format!("{hash}.sock"))
}

/// Parse the target and its one-level dependencies, apply the private-type
/// collision filter, generate the combined thunk source, compile it under
/// `BuildLock` shared, code-sign it, and deploy (spec.md §4.8 steps 7-8,
/// §4.7).
#[allow(clippy::too_many_arguments)]
async fn run_thunk_pipeline(
    handle: &StreamManagerHandle,
    target_file: &Path,
    thunk_dir: &Path,
    watch_state: &WatchState,
    preview_selector: &str,
    device: &str,
    socket_path: &Path,
    bundle_id: &str,
) -> anyhow::Result<()> {
    let target_parse = handle.analyzer.parse(target_file).await?;
    let dependency_paths = handle.analyzer.resolve_dependencies(target_file).await?;

    let mut candidates = vec![(target_file.to_path_buf(), private_types(&target_parse))];
    for dep in &dependency_paths {
        let parse = handle.analyzer.parse(dep).await?;
        candidates.push((dep.clone(), private_types(&parse)));
    }

    let tracked: HashSet<PathBuf> = filter_private_collisions(target_file, &candidates).into_iter().collect();
    watch_state.set_tracked_files(tracked.clone()).await;

    let tracked_vec: Vec<PathBuf> = tracked.into_iter().collect();
    let thunk_source = handle.thunk_generator.generate(target_file, &tracked_vec, preview_selector).await?;

    let flags = handle.build_settings().await?.extra_compiler_flags;
    let guard = handle.build_lock.rlock(&CancelToken::new()).await?;
    let compile_result = handle.toolchain.compile_dylib(&thunk_source, &flags, thunk_dir).await;
    drop(guard);
    let dylib = compile_result?;
    handle.toolchain.codesign(&dylib).await?;

    let env = vec![("AXE_LOADER_SOCKET".to_string(), socket_path.to_string_lossy().into_owned())];
    reload_deploy::deploy(handle.toolchain.as_ref(), socket_path, &dylib, device, bundle_id, &env, std::slice::from_ref(&dylib)).await?;
    Ok(())
}

fn private_types(parse: &crate::parser::ParseResult) -> Vec<(String, bool)> {
    parse
        .defined_types
        .iter()
        .map(|t| (t.name.clone(), matches!(t.access, AccessLevel::Private | AccessLevel::FilePrivate)))
        .collect()
}

/// `SwitchFile(newPath)` (spec.md §4.8.2): thunk-only compile, retry once
/// after a full project rebuild, then escalate to the full restart sequence
/// (terminate, reinstall the staged app, relaunch with the loader injected)
/// before giving up. Returns the new target's preview count on success.
async fn switch_file(
    handle: &StreamManagerHandle,
    candidate: &Path,
    session: &Session,
    watch_state: &WatchState,
    device: &str,
    cancel: &CancelToken,
) -> anyhow::Result<u32> {
    let preview_count = handle.analyzer.parse(candidate).await.map(|p| p.preview_count.max(1)).unwrap_or(1);

    if try_switch_thunk(handle, candidate, session, watch_state, device).await.is_ok() {
        return Ok(preview_count);
    }

    run_full_build(handle, cancel).await?;
    if try_switch_thunk(handle, candidate, session, watch_state, device).await.is_ok() {
        return Ok(preview_count);
    }

    warn!(path = %candidate.display(), "SwitchFile thunk compile failed twice; restarting the app");
    handle.toolchain.terminate_app(device, &session.axe_bundle_id).await?;
    handle.toolchain.install_app(device, &session.staging_dir).await?;
    let loader_dylib = handle.loader_dylib(LOADER_SOURCE, &session.loader_dir).await?;
    let env = vec![("AXE_LOADER_SOCKET".to_string(), session.socket_path.to_string_lossy().into_owned())];
    handle.toolchain.launch_app(device, &session.axe_bundle_id, &env, &[loader_dylib]).await?;

    try_switch_thunk(handle, candidate, session, watch_state, device).await?;
    Ok(preview_count)
}

async fn try_switch_thunk(
    handle: &StreamManagerHandle,
    candidate: &Path,
    session: &Session,
    watch_state: &WatchState,
    device: &str,
) -> anyhow::Result<()> {
    run_thunk_pipeline(handle, candidate, &session.thunk_dir, watch_state, "0", device, &session.socket_path, &session.axe_bundle_id).await
}

#[allow(clippy::too_many_arguments)]
async fn run_event_loop(
    handle: &StreamManagerHandle,
    stream_id: &str,
    cancel: &CancelToken,
    session: &mut Session,
    running: Running,
    switch_file_rx: &mut mpsc::Receiver<String>,
    next_preview_rx: &mut mpsc::Receiver<()>,
    input_rx: &mut mpsc::Receiver<InputParams>,
) -> (StreamStopReason, String) {
    let Running {
        watch_state,
        hid_handler,
        mut file_change_rx,
        mut target_file,
        mut relay_failed_rx,
    } = running;

    let (fire_tx, mut fire_rx) = mpsc::channel::<DebounceFired>(8);

    loop {
        let device = session.device.clone().unwrap_or_default();

        tokio::select! {
            _ = cancel.cancelled() => {
                return (StreamStopReason::Removed, "stream removed".to_string());
            }
            Some(change) = file_change_rx.recv() => {
                watch_state.on_file_change(change.path, fire_tx.clone()).await;
            }
            Some(fired) = fire_rx.recv() => {
                match fired {
                    DebounceFired::Tracked(path) => {
                        watch_state.clear_tracked_timer().await;
                        handle_tracked_change(handle, &target_file, session, &watch_state, &path).await;
                    }
                    DebounceFired::Untracked(_) => {
                        watch_state.clear_untracked_timer().await;
                        if let Err(e) = run_full_rebuild(handle, &target_file, session, &watch_state, cancel).await {
                            return (StreamStopReason::BuildError, e.to_string());
                        }
                    }
                }
            }
            Some(new_file) = switch_file_rx.recv() => {
                if tokio::fs::metadata(&new_file).await.is_ok() {
                    let candidate = PathBuf::from(new_file);
                    match switch_file(handle, &candidate, session, &watch_state, &device, cancel).await {
                        Ok(preview_count) => {
                            watch_state.reset_preview_cycle(preview_count).await;
                            target_file = candidate;
                        }
                        Err(e) => {
                            return (StreamStopReason::BuildError, e.to_string());
                        }
                    }
                } else {
                    warn!(stream_id, path = new_file, "SwitchFile target does not exist");
                }
            }
            Some(()) = next_preview_rx.recv() => {
                let selector = watch_state.advance_preview().await;
                if let Err(e) = run_thunk_pipeline(handle, &target_file, &session.thunk_dir, &watch_state, &selector, &device, &session.socket_path, &session.axe_bundle_id).await {
                    warn!(stream_id, error = %e, "NextPreview thunk compile failed");
                }
            }
            Some(input) = input_rx.recv() => {
                hid_handler.handle(input).await;
            }
            exited = wait_done(&session.boot_companion) => {
                if exited {
                    return (StreamStopReason::RuntimeError, "boot companion exited".to_string());
                }
            }
            exited = wait_done(&session.video_hid_companion) => {
                if exited {
                    return (StreamStopReason::RuntimeError, "video/HID companion exited".to_string());
                }
            }
            _ = wait_relay_failed(&mut relay_failed_rx) => {
                return (StreamStopReason::RuntimeError, "video relay failed permanently".to_string());
            }
        }
    }
}

/// Resolves only once the relay reports a permanent (retry-exhausted)
/// failure; a clean cancellation never fires it (spec.md §4.10).
async fn wait_relay_failed(relay_failed_rx: &mut watch::Receiver<bool>) {
    let _ = relay_failed_rx.wait_for(|failed| *failed).await;
}

async fn wait_done(companion: &Option<CompanionHandle>) -> bool {
    match companion {
        Some(handle) => {
            let mut rx = handle.done();
            let _ = rx.wait_for(|done| *done).await;
            true
        }
        None => std::future::pending().await,
    }
}

async fn handle_tracked_change(
    handle: &StreamManagerHandle,
    target_file: &Path,
    session: &Session,
    watch_state: &WatchState,
    changed_path: &Path,
) {
    let prev_hash = watch_state.skeleton(changed_path).await;
    let (classification, new_hash) = classify::classify_change(handle.analyzer.as_ref(), changed_path, prev_hash.as_deref()).await;

    match classification {
        Classification::HotReload => {
            watch_state.set_skeleton(changed_path.to_path_buf(), new_hash).await;
            let selector = watch_state.preview_selector().await;
            let device = session.device.clone().unwrap_or_default();
            if run_thunk_pipeline(handle, target_file, &session.thunk_dir, watch_state, &selector, &device, &session.socket_path, &session.axe_bundle_id)
                .await
                .is_ok()
            {
                watch_state.increment_reload().await;
            }
        }
        Classification::Rebuild => {
            let _ = run_full_rebuild(handle, target_file, session, watch_state, &CancelToken::new()).await;
        }
    }
}

async fn run_full_rebuild(
    handle: &StreamManagerHandle,
    target_file: &Path,
    session: &Session,
    watch_state: &WatchState,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    run_full_build(handle, cancel).await?;

    let selector = watch_state.preview_selector().await;
    let device = session.device.clone().unwrap_or_default();
    run_thunk_pipeline(handle, target_file, &session.thunk_dir, watch_state, &selector, &device, &session.socket_path, &session.axe_bundle_id).await?;

    let tracked = watch_state.tracked_files().await;
    watch_state.retain_skeletons(&tracked).await;
    for path in tracked {
        if let Some(hash) = classify::skeleton_hash(handle.analyzer.as_ref(), &path).await {
            watch_state.set_skeleton(path, hash).await;
        }
    }
    Ok(())
}

async fn run_full_build(handle: &StreamManagerHandle, cancel: &CancelToken) -> anyhow::Result<()> {
    let guard = handle.build_lock.lock(cancel).await?;
    let result = handle.toolchain.build_project().await;
    drop(guard);
    result
}

/// Always runs, every step idempotent (spec.md §4.8 Cleanup).
async fn cleanup(handle: &StreamManagerHandle, stream_id: &str, session: &mut Session) {
    if session.registered_with_watcher {
        handle.watcher.unregister(stream_id).await;
    }
    if let Some(device) = &session.device
        && session.app_installed
    {
        let _ = handle.toolchain.terminate_app(device, &session.axe_bundle_id).await;
    }
    if !session.socket_path.as_os_str().is_empty() {
        let _ = tokio::fs::remove_file(&session.socket_path).await;
    }
    if let Some(companion) = session.video_hid_companion.take() {
        companion.stop().await;
    }
    if let Some(companion) = session.boot_companion.take() {
        companion.stop().await;
    }
    if let Some(device) = session.device.take()
        && let Err(e) = handle.device_pool.release(&device).await
    {
        warn!(stream_id, error = %e, "device release failed");
    }
    info!(stream_id, "stream cleanup complete");
}
