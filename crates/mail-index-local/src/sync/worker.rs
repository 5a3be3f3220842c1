use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mail_index_core::{BackgroundError, IndexBackend, IndexError, Message};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Pause between two applied updates, so that bursts of small writes do not
/// starve foreground readers of the backend.
pub const DEFAULT_SYNC_PAUSE: Duration = Duration::from_millis(30);

/// Destination of queued state updates.
///
/// Every index backend is one, through `update_message_state`.
#[async_trait]
pub trait StateSink: Send + Sync + 'static {
    async fn apply_state(&self, message: &Message) -> Result<(), IndexError>;
}

#[async_trait]
impl<B: IndexBackend + 'static> StateSink for B {
    async fn apply_state(&self, message: &Message) -> Result<(), IndexError> {
        self.update_message_state(message).await
    }
}

#[derive(Debug)]
enum SyncEntry {
    Update(Box<Message>),
    Terminate,
}

/// Single background writer for message state updates.
///
/// Updates are applied one at a time, strictly in enqueue order. Stopping
/// sends a terminate marker behind everything already queued and waits for
/// the task to exit, so every update enqueued before `stop` is applied.
#[derive(Debug)]
pub struct SyncWorker {
    tx: mpsc::UnboundedSender<SyncEntry>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Spawn the worker task.
    pub fn start<S: StateSink>(
        sink: Arc<S>,
        pause: Duration,
        errors: Option<mpsc::UnboundedSender<BackgroundError>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(sink, rx, pause, errors));
        debug!("Started index sync worker");
        Self { tx, handle }
    }

    /// Append a message to the queue. Never blocks.
    pub fn enqueue(&self, message: Message) -> Result<(), IndexError> {
        self.tx
            .send(SyncEntry::Update(Box::new(message)))
            .map_err(|_| IndexError::Internal("index sync worker has exited".to_string()))
    }

    /// Terminate the worker and wait until its task has exited.
    pub async fn stop(self) {
        // The task may already be gone if it panicked; joining reports that
        let _ = self.tx.send(SyncEntry::Terminate);
        if let Err(e) = self.handle.await {
            warn!("Index sync worker ended abnormally: {}", e);
        }
        debug!("Stopped index sync worker");
    }
}

async fn run<S: StateSink>(
    sink: Arc<S>,
    mut rx: mpsc::UnboundedReceiver<SyncEntry>,
    pause: Duration,
    errors: Option<mpsc::UnboundedSender<BackgroundError>>,
) {
    while let Some(entry) = rx.recv().await {
        match entry {
            SyncEntry::Update(message) => {
                apply(sink.as_ref(), &message, errors.as_ref()).await;
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
            SyncEntry::Terminate => {
                // Apply anything that raced in behind the marker, then exit
                rx.close();
                let mut drained = 0usize;
                while let Some(entry) = rx.recv().await {
                    if let SyncEntry::Update(message) = entry {
                        apply(sink.as_ref(), &message, errors.as_ref()).await;
                        drained += 1;
                    }
                }
                if drained > 0 {
                    debug!("Drained {} queued updates on shutdown", drained);
                }
                return;
            }
        }
    }
}

async fn apply<S: StateSink>(
    sink: &S,
    message: &Message,
    errors: Option<&mpsc::UnboundedSender<BackgroundError>>,
) {
    if let Err(error) = sink.apply_state(message).await {
        warn!("Failed to sync state of {}: {}", message.id, error);
        if let Some(errors) = errors {
            let _ = errors.send(BackgroundError::SyncUpdate {
                id: message.id.clone(),
                error,
            });
        }
    }
}
