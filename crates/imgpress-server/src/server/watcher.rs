//! Watch-folder ingress for local mode.
//!
//! New image files dropped into `WATCH_DIR` are compressed one at a time as
//! single-item batches and written to `OUTPUT_DIR` under the usual
//! `compressed_<base>.<ext>` name. A file is only picked up once its writer is
//! done with it: no create/modify events for the quiet period, and the same
//! length on two consecutive polls.

use crate::server::{config::WatchConfig, pool::manager::WorkerPool};
use anyhow::{Context, bail};
use imgpress_core::{BatchOrchestrator, CompressionOutcome, Compressor, SourceItem, TargetFormat};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

const SUPPORTED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

/// `true` if `path` has one of the recognised image extensions.
pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    last_event: Instant,
    last_len: Option<u64>,
}

/// Tracks files that are still being written.
#[derive(Debug)]
pub struct PendingWrites {
    quiet_period: Duration,
    files: HashMap<PathBuf, Pending>,
}

impl PendingWrites {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            files: HashMap::new(),
        }
    }

    /// Records a write to `path`, restarting its quiet period.
    pub fn touch(&mut self, path: PathBuf, now: Instant) {
        self.files.insert(
            path,
            Pending {
                last_event: now,
                last_len: None,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Returns the files that have settled, removing them from the tracker.
    ///
    /// `file_len` reports the current length of a file, or `None` if it no
    /// longer exists. Vanished files are dropped silently.
    pub fn poll(
        &mut self,
        now: Instant,
        mut file_len: impl FnMut(&Path) -> Option<u64>,
    ) -> Vec<PathBuf> {
        let quiet_period = self.quiet_period;
        let mut ready = Vec::new();

        self.files.retain(|path, pending| {
            if now.saturating_duration_since(pending.last_event) < quiet_period {
                return true;
            }

            match file_len(path) {
                None => false,
                Some(len) if pending.last_len == Some(len) => {
                    ready.push(path.clone());
                    false
                }
                Some(len) => {
                    pending.last_len = Some(len);
                    true
                }
            }
        });

        ready.sort();
        ready
    }
}

/// Compresses files as they appear in a directory.
pub struct FolderWatcher {
    orchestrator: BatchOrchestrator<dyn Compressor>,
    pool: Arc<WorkerPool>,
    config: WatchConfig,
    format: TargetFormat,
}

impl FolderWatcher {
    pub fn new(
        orchestrator: BatchOrchestrator<dyn Compressor>,
        pool: Arc<WorkerPool>,
        config: WatchConfig,
        format: TargetFormat,
    ) -> Self {
        Self {
            orchestrator,
            pool,
            config,
            format,
        }
    }

    /// Creates the watch and output directories, registers the watch, and
    /// runs the event loop in a background task until `shutdown` is
    /// cancelled.
    ///
    /// Files already in the directory are left alone.
    ///
    /// # Errors
    ///
    /// Fails if either directory cannot be created or the watch cannot be
    /// registered.
    pub async fn spawn(self, shutdown: CancellationToken) -> anyhow::Result<JoinHandle<()>> {
        for dir in [&self.config.watch_dir, &self.config.output_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )
        .context("failed to create file watcher")?;

        watcher
            .watch(&self.config.watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| {
                format!("failed to watch directory {}", self.config.watch_dir.display())
            })?;

        tracing::info!(
            watch_dir = %self.config.watch_dir.display(),
            output_dir = %self.config.output_dir.display(),
            format = %self.format,
            "Watching for new images"
        );

        Ok(tokio::spawn(self.run(watcher, rx, shutdown)))
    }

    async fn run(
        self,
        // Dropping the watcher ends the watch.
        _watcher: RecommendedWatcher,
        mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
        shutdown: CancellationToken,
    ) {
        let mut pending = PendingWrites::new(self.config.quiet_period);
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(res) = rx.recv() => match res {
                    Ok(event) => self.observe(event, &mut pending),
                    Err(e) => tracing::warn!(error = %e, "File watcher error"),
                },
                _ = ticker.tick(), if !pending.is_empty() => {
                    let ready = pending.poll(Instant::now(), |path| {
                        std::fs::metadata(path).ok().map(|meta| meta.len())
                    });

                    for path in ready {
                        match self.process_file(&path).await {
                            Ok(output) => tracing::info!(
                                source = %path.display(),
                                output = %output.display(),
                                "Compressed watched file"
                            ),
                            Err(e) => tracing::error!(
                                source = %path.display(),
                                error = %format!("{e:#}"),
                                "Failed to compress watched file"
                            ),
                        }
                    }
                }
            }
        }

        tracing::info!(pending = pending.len(), "Folder watcher stopped");
    }

    fn observe(&self, event: Event, pending: &mut PendingWrites) {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }

        let now = Instant::now();
        for path in event.paths {
            if is_supported(&path) {
                tracing::trace!(path = %path.display(), "Write observed");
                pending.touch(path, now);
            } else if matches!(event.kind, EventKind::Create(_)) {
                tracing::info!(path = %path.display(), "Ignoring file with unsupported extension");
            }
        }
    }

    /// Compresses one file and writes the result to the output directory,
    /// returning the output path.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read, compression fails, the output cannot
    /// be written, or the pool is shutting down.
    pub async fn process_file(&self, path: &Path) -> anyhow::Result<PathBuf> {
        let _guard = self.pool.begin_batch()?;

        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("unusable file name {}", path.display()))?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;

        let item = SourceItem::new(name, bytes, None)?;
        let mut result = self.orchestrator.collect(vec![item], self.format).await;

        match result.outcomes.pop() {
            Some(CompressionOutcome::Success {
                output_name, bytes, ..
            }) => {
                let output = self.config.output_dir.join(output_name);
                tokio::fs::write(&output, &bytes)
                    .await
                    .with_context(|| format!("failed to write {}", output.display()))?;
                Ok(output)
            }
            Some(CompressionOutcome::Failure { reason, .. }) => bail!(reason),
            None => bail!("compression produced no outcome"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::pool::{PooledCompressor, tests::EchoCompressor};

    fn watcher(watch_dir: &Path, output_dir: &Path, quiet_ms: u64) -> FolderWatcher {
        let inner: Arc<dyn Compressor> = Arc::new(EchoCompressor::default());
        let pool = Arc::new(WorkerPool::spawn(
            Arc::clone(&inner),
            1,
            Duration::from_millis(50),
        ));
        let compressor: Arc<dyn Compressor> =
            Arc::new(PooledCompressor::new(Arc::clone(&pool), inner));

        FolderWatcher::new(
            BatchOrchestrator::new(compressor),
            pool,
            WatchConfig {
                watch_dir: watch_dir.to_path_buf(),
                output_dir: output_dir.to_path_buf(),
                quiet_period: Duration::from_millis(quiet_ms),
                poll_interval: Duration::from_millis(10),
            },
            TargetFormat::Original,
        )
    }

    #[test]
    fn recognises_image_extensions() {
        assert!(is_supported(Path::new("uploads/a.png")));
        assert!(is_supported(Path::new("a.JPEG")));
        assert!(is_supported(Path::new("a.webp")));
        assert!(!is_supported(Path::new("a.gif")));
        assert!(!is_supported(Path::new("png")));
        assert!(!is_supported(Path::new("a.png.tmp")));
    }

    #[test]
    fn file_settles_after_quiet_period_and_stable_length() {
        let quiet = Duration::from_millis(100);
        let mut pending = PendingWrites::new(quiet);
        let path = PathBuf::from("a.png");
        let t0 = Instant::now();

        pending.touch(path.clone(), t0);
        assert!(pending.poll(t0 + Duration::from_millis(50), |_| Some(5)).is_empty());
        // First poll past the quiet period only records the length.
        assert!(pending.poll(t0 + Duration::from_millis(150), |_| Some(5)).is_empty());
        // Length changed, still settling.
        assert!(pending.poll(t0 + Duration::from_millis(200), |_| Some(9)).is_empty());
        assert_eq!(
            pending.poll(t0 + Duration::from_millis(250), |_| Some(9)),
            [path]
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn new_write_restarts_quiet_period() {
        let mut pending = PendingWrites::new(Duration::from_millis(100));
        let path = PathBuf::from("a.png");
        let t0 = Instant::now();

        pending.touch(path.clone(), t0);
        assert!(pending.poll(t0 + Duration::from_millis(150), |_| Some(5)).is_empty());
        pending.touch(path.clone(), t0 + Duration::from_millis(160));
        assert!(pending.poll(t0 + Duration::from_millis(200), |_| Some(5)).is_empty());
        assert!(pending.poll(t0 + Duration::from_millis(270), |_| Some(5)).is_empty());
        assert_eq!(
            pending.poll(t0 + Duration::from_millis(280), |_| Some(5)),
            [path]
        );
    }

    #[test]
    fn vanished_files_are_dropped() {
        let mut pending = PendingWrites::new(Duration::ZERO);
        pending.touch(PathBuf::from("gone.png"), Instant::now());
        assert!(pending.poll(Instant::now(), |_| None).is_empty());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn process_file_writes_compressed_output() -> anyhow::Result<()> {
        let input = tempfile::tempdir()?;
        let output = tempfile::tempdir()?;
        let source = input.path().join("photo.png");
        std::fs::write(&source, b"pixels")?;

        let written = watcher(input.path(), output.path(), 0)
            .process_file(&source)
            .await?;

        assert_eq!(written, output.path().join("compressed_photo.png"));
        assert_eq!(std::fs::read(&written)?, b"pixels");
        Ok(())
    }

    #[tokio::test]
    async fn process_file_reports_failure_without_output() -> anyhow::Result<()> {
        let input = tempfile::tempdir()?;
        let output = tempfile::tempdir()?;
        let source = input.path().join("broken.png");
        std::fs::write(&source, b"!broken")?;

        let err = watcher(input.path(), output.path(), 0)
            .process_file(&source)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Decode error"), "got {err:#}");
        assert_eq!(std::fs::read_dir(output.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn picks_up_new_files_only() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let watch_dir = root.path().join("uploads");
        let output_dir = root.path().join("converted");
        std::fs::create_dir_all(&watch_dir)?;
        std::fs::write(watch_dir.join("old.png"), b"old")?;

        let shutdown = CancellationToken::new();
        let handle = watcher(&watch_dir, &output_dir, 50)
            .spawn(shutdown.clone())
            .await?;

        std::fs::write(watch_dir.join("new.png"), b"new")?;
        std::fs::write(watch_dir.join("notes.txt"), b"text")?;

        let expected = output_dir.join("compressed_new.png");
        let deadline = Instant::now() + Duration::from_secs(10);
        while !expected.exists() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(std::fs::read(&expected)?, b"new");
        assert!(!output_dir.join("compressed_old.png").exists());
        assert!(!output_dir.join("compressed_notes.txt").exists());

        shutdown.cancel();
        handle.await?;
        Ok(())
    }
}
