use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use mail_index_core::{BackgroundError, IndexError, LockInfo, LockManager};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Name of the lock file inside the index directory.
pub const LOCK_FILE_NAME: &str = "lock";

/// Interval between two liveness refreshes of a held lock.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// An acquired lock: the open, OS-locked file and the record written into it.
#[derive(Debug)]
struct HeldLock {
    file: File,
    info: LockInfo,
}

impl HeldLock {
    /// Refresh the heartbeat timestamp on disk.
    fn touch(&mut self, path: &Path) -> Result<(), IndexError> {
        // Writing through an unlinked file would succeed silently
        if !path.exists() {
            return Err(IndexError::Lock(format!(
                "lock file {} disappeared",
                path.display()
            )));
        }
        self.info.heartbeat_at = chrono::Utc::now();
        write_record(&mut self.file, &self.info)
    }
}

#[derive(Debug)]
struct Heartbeat {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Exclusive lock over an index directory.
///
/// Uses an OS advisory lock (flock on Unix, LockFile on Windows) on
/// `{dir}/lock`, acquired without retries:
/// - The file handle is held while the lock is held
/// - Closing the handle releases the lock, so a crashed process frees it too
/// - The file body is a JSON [`LockInfo`] record so that contenders can report
///   who holds the directory and when it last showed signs of life
///
/// Each `FileLock` is an independent handle: two handles on the same directory
/// exclude each other even inside one process.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    holder_id: String,
    held: Arc<Mutex<Option<HeldLock>>>,
    heartbeat: Mutex<Option<Heartbeat>>,
    errors: Option<mpsc::UnboundedSender<BackgroundError>>,
}

impl FileLock {
    /// Create a lock handle for the index directory `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(LOCK_FILE_NAME),
            holder_id: uuid::Uuid::new_v4().to_string(),
            held: Arc::new(Mutex::new(None)),
            heartbeat: Mutex::new(None),
            errors: None,
        }
    }

    /// Report heartbeat failures on `errors`.
    pub fn with_background_errors(mut self, errors: mpsc::UnboundedSender<BackgroundError>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Ensure the index directory exists.
    fn ensure_dir(&self) -> Result<(), IndexError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                IndexError::Io(format!("Failed to create index dir {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Describe the current holder for a contention error, even when its record
    /// is missing or unreadable.
    fn describe_holder(&self) -> LockInfo {
        match read_record(&self.path) {
            Ok(Some(info)) => info,
            Ok(None) | Err(_) => {
                let since = std::fs::metadata(&self.path)
                    .and_then(|m| m.modified())
                    .map(chrono::DateTime::<chrono::Utc>::from)
                    .unwrap_or_else(|_| chrono::Utc::now());
                LockInfo {
                    holder_id: "unknown".to_string(),
                    host: None,
                    pid: None,
                    acquired_at: since,
                    heartbeat_at: since,
                }
            }
        }
    }

    fn new_record(&self) -> LockInfo {
        let now = chrono::Utc::now();
        LockInfo {
            holder_id: self.holder_id.clone(),
            host: hostname::get().ok().map(|h| h.to_string_lossy().into_owned()),
            pid: Some(std::process::id()),
            acquired_at: now,
            heartbeat_at: now,
        }
    }
}

#[async_trait]
impl LockManager for FileLock {
    #[instrument(skip(self), level = "debug")]
    async fn lock(&self) -> Result<(), IndexError> {
        let mut held = self.held.lock().await;
        if held.is_some() {
            return Err(IndexError::Lock(format!(
                "{} is already held by this handle",
                self.path.display()
            )));
        }

        self.ensure_dir()?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| IndexError::Io(format!("Failed to open lock file: {}", e)))?;

        // Try non-blocking exclusive lock, no retries
        match file.try_lock_exclusive() {
            Ok(()) => {
                let info = self.new_record();
                write_record(&mut file, &info)?;
                debug!("Acquired index lock for {}", self.holder_id);
                *held = Some(HeldLock { file, info });
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let holder = self.describe_holder();
                debug!("Index lock held by {} (requested by {})", holder, self.holder_id);
                Err(IndexError::LockHeld(Box::new(holder)))
            }
            Err(e) => Err(IndexError::Io(format!("Failed to acquire lock: {}", e))),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn unlock(&self) -> Result<(), IndexError> {
        self.stop_heartbeat().await;

        let mut held = self.held.lock().await;
        let Some(HeldLock { file, .. }) = held.take() else {
            debug!("Index lock not held by {}, nothing to release", self.holder_id);
            return Ok(());
        };

        // Clear the record but keep the file: unlinking a flock'ed file lets a
        // contender lock a stale inode.
        if let Err(e) = file.set_len(0) {
            warn!("Failed to clear lock record {}: {}", self.path.display(), e);
        }
        let _ = fs2::FileExt::unlock(&file);
        debug!("Released index lock for {}", self.holder_id);
        Ok(())
    }

    async fn is_locked(&self) -> bool {
        self.held.lock().await.is_some()
    }

    async fn lock_info_on_disk(&self) -> Result<Option<LockInfo>, IndexError> {
        read_record(&self.path)
    }

    #[instrument(skip(self), level = "debug")]
    async fn start_heartbeat(&self, interval: Duration) -> Result<(), IndexError> {
        if !self.is_locked().await {
            return Err(IndexError::Lock(
                "cannot start a heartbeat without holding the lock".to_string(),
            ));
        }

        let mut heartbeat = self.heartbeat.lock().await;
        if heartbeat.is_some() {
            debug!("Lock heartbeat already running");
            return Ok(());
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let held = Arc::clone(&self.held);
        let path = self.path.clone();
        let errors = self.errors.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; the record is fresh already
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        let mut held = held.lock().await;
                        let Some(lock) = held.as_mut() else { break };
                        match lock.touch(&path) {
                            Ok(()) => debug!("Refreshed lock heartbeat at {}", path.display()),
                            Err(e) => {
                                warn!("Lock heartbeat failed: {}", e);
                                if let Some(errors) = &errors {
                                    let _ = errors.send(BackgroundError::Heartbeat(e));
                                }
                            }
                        }
                    }
                }
            }
        });

        *heartbeat = Some(Heartbeat { stop_tx, handle });
        Ok(())
    }

    async fn stop_heartbeat(&self) {
        let Some(Heartbeat { stop_tx, handle }) = self.heartbeat.lock().await.take() else {
            return;
        };
        let _ = stop_tx.send(true);
        if let Err(e) = handle.await {
            warn!("Lock heartbeat task ended abnormally: {}", e);
        }
        debug!("Stopped lock heartbeat");
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.get_mut().take() {
            heartbeat.handle.abort();
        }
    }
}

/// Replace the lock file body with `info`.
/// Overwrite the record in place. The file is never truncated: a shorter
/// record is padded with whitespace, so readers always see a complete record.
fn write_record(file: &mut File, info: &LockInfo) -> Result<(), IndexError> {
    let mut body = serde_json::to_vec(info)
        .map_err(|e| IndexError::Serialization(format!("Failed to encode lock record: {}", e)))?;
    file.metadata()
        .and_then(|meta| {
            if (body.len() as u64) < meta.len() {
                body.resize(meta.len() as usize, b' ');
            }
            file.seek(SeekFrom::Start(0))
        })
        .and_then(|_| file.write_all(&body))
        .and_then(|_| file.sync_data())
        .map_err(|e| IndexError::Io(format!("Failed to write lock record: {}", e)))
}

/// Read the lock record at `path`. A missing or empty file has no record.
fn read_record(path: &Path) -> Result<Option<LockInfo>, IndexError> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(IndexError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    if content.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| IndexError::Serialization(format!("Corrupted lock record: {}", e)))
}
