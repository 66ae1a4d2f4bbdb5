//! `axe-previewd`: binary entrypoint.
//!
//! Reads commands as line-delimited JSON from stdin, writes events the same
//! way to stdout, and runs until stdin closes or a termination signal
//! arrives (spec.md §6).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use axe_preview_orchestrator::buildlock::BuildLock;
use axe_preview_orchestrator::config::{Cli, ProjectConfig};
use axe_preview_orchestrator::device_pool::DevicePool;
use axe_preview_orchestrator::manager::StreamManager;
use axe_preview_orchestrator::production::{LineScanAnalyzer, ShellCompanionFactory, ShellToolchain, TemplateThunkGenerator};
use axe_preview_orchestrator::watcher::{self, SharedWatcher};
use axe_preview_orchestrator::wire::{CommandReader, Events, EventWriter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = ProjectConfig::from_cli(cli)?;

    let toolchain: Arc<dyn axe_preview_orchestrator::toolchain::Toolchain> = Arc::new(ShellToolchain::new(config.clone()));
    let analyzer: Arc<dyn axe_preview_orchestrator::parser::SourceAnalyzer> = Arc::new(LineScanAnalyzer);
    let thunk_generator: Arc<dyn axe_preview_orchestrator::parser::ThunkGenerator> = Arc::new(TemplateThunkGenerator);
    let companion_binary = std::env::var("AXE_COMPANION_BIN").unwrap_or_else(|_| "axe-companion".to_string());
    let companion_factory: Arc<dyn axe_preview_orchestrator::companion::CompanionFactory> =
        Arc::new(ShellCompanionFactory::new(PathBuf::from(companion_binary), config.device_set.clone()));

    let device_pool = Arc::new(DevicePool::new(toolchain.clone(), config.device_set.clone()));
    let build_lock = Arc::new(BuildLock::open(&config.build_dir()).await?);

    let watch_root = config.primary_path().parent().unwrap_or(config.primary_path()).to_path_buf();
    let watch_dirs = watcher::discover_watch_dirs(&watch_root).await?;
    let watcher = Arc::new(SharedWatcher::new(&watch_dirs)?);

    let events: Events = EventWriter::new(Box::new(tokio::io::stdout()));

    let manager = Arc::new(StreamManager::new(
        toolchain,
        analyzer,
        thunk_generator,
        companion_factory,
        device_pool.clone(),
        build_lock,
        watcher,
        events,
        config,
    ));

    device_pool.cleanup_orphans().await.ok();
    device_pool.garbage_collect().await.ok();

    let mut reader = CommandReader::new(tokio::io::stdin());

    let shutdown = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = sighup.recv() => {}
        }
        Ok::<(), std::io::Error>(())
    };

    tokio::select! {
        _ = shutdown => {
            tracing::info!("received termination signal, shutting down");
        }
        _ = drive_commands(&mut reader, &manager) => {
            tracing::info!("stdin closed, shutting down");
        }
    }

    manager.stop_all().await;
    device_pool.garbage_collect().await.ok();
    Ok(())
}

async fn drive_commands(reader: &mut CommandReader<tokio::io::Stdin>, manager: &StreamManager) {
    loop {
        match reader.next_command().await {
            Ok(Some(cmd)) => manager.handle_command(cmd).await,
            Ok(None) => return,
            Err(e) => tracing::warn!(error = %e, "failed to parse command, skipping"),
        }
    }
}
