//! StreamManager: owns the stream map and every process-wide cache, and
//! dispatches incoming commands to the right stream (spec.md §4.9).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell, mpsc};
use tracing::warn;

use crate::buildlock::{BuildLock, CancelToken};
use crate::companion::CompanionFactory;
use crate::config::ProjectConfig;
use crate::device_pool::DevicePool;
use crate::parser::{ParseResult, SourceAnalyzer, ThunkGenerator};
use crate::stream::{self, StreamCommandChannels};
use crate::toolchain::{BuildSettings, Toolchain};
use crate::watcher::SharedWatcher;
use crate::wire::{Command, CommandPayload, Events, InputParams};

/// Wraps an injected [`SourceAnalyzer`] with a process-wide `path + mtime
/// -> ParseResult` cache (spec.md §9 Design Notes). Classification and
/// dependency resolution both flow through this, so a body-only edit that
/// hasn't changed a file's mtime never re-parses.
struct CachingAnalyzer {
    inner: Arc<dyn SourceAnalyzer>,
    cache: Mutex<HashMap<(PathBuf, SystemTime), ParseResult>>,
}

impl CachingAnalyzer {
    fn new(inner: Arc<dyn SourceAnalyzer>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn clear(&self) {
        self.cache.lock().await.clear();
    }
}

#[async_trait]
impl SourceAnalyzer for CachingAnalyzer {
    async fn parse(&self, path: &std::path::Path) -> anyhow::Result<ParseResult> {
        let mtime = tokio::fs::metadata(path).await?.modified()?;
        let key = (path.to_path_buf(), mtime);
        if let Some(cached) = self.cache.lock().await.get(&key) {
            return Ok(cached.clone());
        }
        let result = self.inner.parse(path).await?;
        self.cache.lock().await.insert(key, result.clone());
        Ok(result)
    }

    async fn resolve_dependencies(&self, path: &std::path::Path) -> anyhow::Result<Vec<PathBuf>> {
        self.inner.resolve_dependencies(path).await
    }
}

/// A non-owning handle to manager-wide shared state, passed into each
/// spawned stream task instead of a back-reference to the manager itself —
/// the stream self-unregisters on its own cleanup path, the same cyclic
/// reference resolution the teacher applies between its rebuild pipeline
/// and `WsServer` (spec.md §9).
#[derive(Clone)]
pub struct StreamManagerHandle {
    pub toolchain: Arc<dyn Toolchain>,
    pub analyzer: Arc<dyn SourceAnalyzer>,
    pub thunk_generator: Arc<dyn ThunkGenerator>,
    pub companion_factory: Arc<dyn CompanionFactory>,
    pub device_pool: Arc<DevicePool>,
    pub build_lock: Arc<BuildLock>,
    pub watcher: Arc<SharedWatcher>,
    pub events: Events,
    pub config: ProjectConfig,
    build_settings: Arc<OnceCell<BuildSettings>>,
    loader_dylib: Arc<Mutex<Option<PathBuf>>>,
}

impl StreamManagerHandle {
    /// Fetch `BuildSettings` once per manager via `tokio::sync::OnceCell`
    /// (spec.md §4.8 step 4, double-checked locking).
    pub async fn build_settings(&self) -> anyhow::Result<BuildSettings> {
        self.build_settings
            .get_or_try_init(|| async { self.toolchain.fetch_build_settings().await })
            .await
            .cloned()
    }

    /// Compile the injected loader exactly once per manager, returning the
    /// cached dylib path on subsequent calls (spec.md §4.8 step 9).
    pub async fn loader_dylib(&self, loader_source: &str, out_dir: &Path) -> anyhow::Result<PathBuf> {
        let mut cached = self.loader_dylib.lock().await;
        if let Some(path) = cached.as_ref() {
            return Ok(path.clone());
        }
        let flags = self.build_settings().await?.extra_compiler_flags;
        let path = self.toolchain.compile_dylib(loader_source, &flags, out_dir).await?;
        *cached = Some(path.clone());
        Ok(path)
    }
}

struct StreamHandle {
    commands: StreamCommandChannels,
    cancel: CancelToken,
    join: tokio::task::JoinHandle<()>,
}

pub struct StreamManager {
    streams: Mutex<HashMap<String, StreamHandle>>,
    handle: StreamManagerHandle,
    caching_analyzer: Arc<CachingAnalyzer>,
}

impl StreamManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        toolchain: Arc<dyn Toolchain>,
        analyzer: Arc<dyn SourceAnalyzer>,
        thunk_generator: Arc<dyn ThunkGenerator>,
        companion_factory: Arc<dyn CompanionFactory>,
        device_pool: Arc<DevicePool>,
        build_lock: Arc<BuildLock>,
        watcher: Arc<SharedWatcher>,
        events: Events,
        config: ProjectConfig,
    ) -> Self {
        let caching_analyzer = Arc::new(CachingAnalyzer::new(analyzer));
        let handle = StreamManagerHandle {
            toolchain,
            analyzer: caching_analyzer.clone() as Arc<dyn SourceAnalyzer>,
            thunk_generator,
            companion_factory,
            device_pool,
            build_lock,
            watcher,
            events,
            config,
            build_settings: Arc::new(OnceCell::new()),
            loader_dylib: Arc::new(Mutex::new(None)),
        };
        Self {
            streams: Mutex::new(HashMap::new()),
            handle,
            caching_analyzer,
        }
    }

    /// Test hook clearing the process-wide parse cache, avoiding
    /// mtime-granularity races in fast test loops (spec.md §9).
    pub async fn clear_parse_cache(&self) {
        self.caching_analyzer.clear().await;
    }

    pub async fn handle_command(&self, cmd: Command) {
        match cmd.payload {
            CommandPayload::AddStream(params) => {
                self.add_stream(cmd.stream_id, params.file, params.device_type, params.runtime)
                    .await;
            }
            CommandPayload::RemoveStream(_) => self.remove_stream(&cmd.stream_id).await,
            CommandPayload::SwitchFile(params) => {
                self.dispatch_switch_file(&cmd.stream_id, params.file).await;
            }
            CommandPayload::NextPreview(_) => self.dispatch_next_preview(&cmd.stream_id).await,
            CommandPayload::Input(input) => self.dispatch_input(&cmd.stream_id, input).await,
        }
    }

    async fn add_stream(&self, stream_id: String, file: String, device_type: String, runtime: String) {
        let mut streams = self.streams.lock().await;
        if streams.contains_key(&stream_id) {
            warn!(stream_id, "duplicate AddStream ignored");
            return;
        }

        let (switch_file_tx, switch_file_rx) = mpsc::channel(1);
        let (next_preview_tx, next_preview_rx) = mpsc::channel(1);
        let (input_tx, input_rx) = mpsc::channel(1);
        let cancel = CancelToken::new();

        let handle = self.handle.clone();
        let join_stream_id = stream_id.clone();
        let join_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            stream::run(
                handle,
                join_stream_id,
                PathBuf::from(file),
                device_type,
                runtime,
                join_cancel,
                switch_file_rx,
                next_preview_rx,
                input_rx,
            )
            .await;
        });

        streams.insert(
            stream_id,
            StreamHandle {
                commands: StreamCommandChannels {
                    switch_file_tx,
                    next_preview_tx,
                    input_tx,
                },
                cancel,
                join,
            },
        );
    }

    async fn remove_stream(&self, stream_id: &str) {
        let removed = self.streams.lock().await.remove(stream_id);
        let Some(handle) = removed else {
            warn!(stream_id, "RemoveStream for unknown stream id");
            return;
        };
        handle.cancel.cancel();
        let _ = handle.join.await;
    }

    async fn dispatch_switch_file(&self, stream_id: &str, file: String) {
        let streams = self.streams.lock().await;
        let Some(handle) = streams.get(stream_id) else {
            warn!(stream_id, "SwitchFile for unknown stream id");
            return;
        };
        let _ = handle.commands.switch_file_tx.try_send(file);
    }

    async fn dispatch_next_preview(&self, stream_id: &str) {
        let streams = self.streams.lock().await;
        let Some(handle) = streams.get(stream_id) else {
            warn!(stream_id, "NextPreview for unknown stream id");
            return;
        };
        let _ = handle.commands.next_preview_tx.try_send(());
    }

    async fn dispatch_input(&self, stream_id: &str, input: InputParams) {
        let streams = self.streams.lock().await;
        let Some(handle) = streams.get(stream_id) else {
            warn!(stream_id, "Input for unknown stream id");
            return;
        };
        let _ = handle.commands.input_tx.try_send(input);
    }

    /// Snapshot and clear the stream map, cancel every stream, join them
    /// all, then shut down every pooled device (spec.md §4.9 StopAll).
    pub async fn stop_all(&self) {
        let handles: Vec<StreamHandle> = {
            let mut streams = self.streams.lock().await;
            streams.drain().map(|(_, h)| h).collect()
        };
        for handle in &handles {
            handle.cancel.cancel();
        }
        for handle in handles {
            let _ = handle.join.await;
        }
        let _ = self.handle.device_pool.shutdown_all().await;
    }
}
