use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mail_index_core::{
    BackgroundError, IndexBackend, IndexError, LockManager, SourceManager, Thread,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument};

use crate::backend::{Backend, BackendKind, ResolveInputs};
use crate::config::{IndexSettings, INDEX_TYPE_ENV};
use crate::lock::FileLock;
use crate::sync::{SyncWorker, DEFAULT_SYNC_PAUSE};

/// Handle over one index directory.
///
/// Owns the directory lock, the selected backend and the optional sync
/// worker. While the worker runs, every state write goes through it; when it
/// is stopped, writes go straight to the backend.
pub struct Index<B: IndexBackend = Backend> {
    dir: PathBuf,
    lock: FileLock,
    backend: Arc<B>,
    sources: Option<Arc<dyn SourceManager>>,
    worker: Mutex<Option<SyncWorker>>,
    sync_pause: Duration,
    heartbeat_interval: Duration,
    errors_tx: mpsc::UnboundedSender<BackgroundError>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<BackgroundError>>>,
}

impl Index<Backend> {
    /// Open the index in `dir` with the backend picked from `explicit`, the
    /// environment, the settings file and the directory content.
    pub async fn open(dir: impl Into<PathBuf>, explicit: Option<&str>) -> Result<Self, IndexError> {
        let env = std::env::var(INDEX_TYPE_ENV).ok();
        Self::open_with_env(dir, explicit, env.as_deref()).await
    }

    /// Like [`Index::open`], with the environment's index type passed in.
    pub async fn open_with_env(
        dir: impl Into<PathBuf>,
        explicit: Option<&str>,
        env: Option<&str>,
    ) -> Result<Self, IndexError> {
        let dir = dir.into();
        let settings = IndexSettings::load(&dir).await?;

        let kind = BackendKind::resolve(&ResolveInputs {
            explicit,
            env,
            config: settings.index.as_deref(),
            dir: &dir,
        })?;
        info!("Using {} index at {}", kind, dir.display());

        Ok(Self::new(dir, Backend::open(kind))
            .with_sync_pause(settings.sync_pause())
            .with_heartbeat_interval(settings.heartbeat_interval()))
    }
}

impl<B: IndexBackend + 'static> Index<B> {
    pub fn new(dir: impl Into<PathBuf>, backend: B) -> Self {
        let dir = dir.into();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            lock: FileLock::new(&dir).with_background_errors(errors_tx.clone()),
            dir,
            backend: Arc::new(backend),
            sources: None,
            worker: Mutex::new(None),
            sync_pause: DEFAULT_SYNC_PAUSE,
            heartbeat_interval: crate::lock::DEFAULT_HEARTBEAT_INTERVAL,
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        }
    }

    /// Load and save `sources` together with the index.
    pub fn with_sources(mut self, sources: Arc<dyn SourceManager>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn with_sync_pause(mut self, pause: Duration) -> Self {
        self.sync_pause = pause;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn lock_manager(&self) -> &FileLock {
        &self.lock
    }

    /// Receiver of failures from the heartbeat and the sync worker. Can be
    /// taken once.
    pub async fn take_background_errors(&self) -> Option<mpsc::UnboundedReceiver<BackgroundError>> {
        self.errors_rx.lock().await.take()
    }

    // =========================================================================
    // Locking
    // =========================================================================

    pub async fn lock(&self) -> Result<(), IndexError> {
        self.lock.lock().await
    }

    pub async fn unlock(&self) -> Result<(), IndexError> {
        self.lock.unlock().await
    }

    /// Start refreshing the lock with the configured interval.
    pub async fn start_lock_heartbeat(&self) -> Result<(), IndexError> {
        self.lock.start_heartbeat(self.heartbeat_interval).await
    }

    pub async fn stop_lock_heartbeat(&self) {
        self.lock.stop_heartbeat().await
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Load sources, then the index.
    #[instrument(skip(self), level = "debug", fields(dir = %self.dir.display()))]
    pub async fn load(&self) -> Result<(), IndexError> {
        if let Some(sources) = &self.sources {
            sources.load_sources().await?;
        }
        self.backend.load_index(&self.dir).await
    }

    /// Save sources, then the index.
    #[instrument(skip(self), level = "debug", fields(dir = %self.dir.display()))]
    pub async fn save(&self) -> Result<(), IndexError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            IndexError::Io(format!("Failed to create index dir {}: {}", self.dir.display(), e))
        })?;
        if let Some(sources) = &self.sources {
            sources.save_sources().await?;
        }
        self.backend.save_index(&self.dir).await
    }

    // =========================================================================
    // State sync
    // =========================================================================

    /// Push the state of every dirty message of `thread` to the index.
    ///
    /// Each message is cleared once its update has been handed off (queued
    /// to the worker, or applied directly). On error the failing message and
    /// the ones after it stay dirty.
    pub async fn save_thread(&self, thread: &mut Thread) -> Result<(), IndexError> {
        // Held for the whole thread so the worker cannot stop halfway
        let worker = self.worker.lock().await;
        let mut saved = 0usize;
        for message in thread.dirty_messages_mut() {
            match &*worker {
                Some(worker) => worker.enqueue(message.clone())?,
                None => self.backend.update_message_state(message).await?,
            }
            message.clear_dirty();
            saved += 1;
        }
        if saved > 0 {
            debug!(
                "Saved state of {} messages ({})",
                saved,
                if worker.is_some() { "queued" } else { "direct" }
            );
        }
        Ok(())
    }

    /// Start the background sync worker. Fails if it is already running.
    pub async fn start_sync_worker(&self) -> Result<(), IndexError> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(IndexError::Internal(
                "index sync worker is already running".to_string(),
            ));
        }
        *worker = Some(SyncWorker::start(
            Arc::clone(&self.backend),
            self.sync_pause,
            Some(self.errors_tx.clone()),
        ));
        Ok(())
    }

    /// Stop the sync worker once every queued update is applied. No-op when
    /// it is not running.
    ///
    /// The worker slot stays locked until the queue is drained, so a
    /// concurrent `save_thread` cannot write directly while older queued
    /// states are still pending.
    pub async fn stop_sync_worker(&self) {
        let mut slot = self.worker.lock().await;
        if let Some(worker) = slot.take() {
            worker.stop().await;
        }
    }

    pub async fn is_sync_worker_running(&self) -> bool {
        self.worker.lock().await.is_some()
    }
}

impl<B: IndexBackend> std::fmt::Debug for Index<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("dir", &self.dir)
            .field("backend", &self.backend.name())
            .field("sync_pause", &self.sync_pause)
            .finish_non_exhaustive()
    }
}
