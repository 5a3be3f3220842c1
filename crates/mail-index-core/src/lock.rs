use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexError;

/// Lock record persisted next to the index so that other processes can tell
/// who holds the directory and whether the holder is still alive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier of the lock handle (one per handle, not per process)
    pub holder_id: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
    /// Last liveness refresh written by the holder
    pub heartbeat_at: chrono::DateTime<chrono::Utc>,
}

impl LockInfo {
    /// Time elapsed since the holder last refreshed the record.
    pub fn heartbeat_age(&self, now: chrono::DateTime<chrono::Utc>) -> chrono::Duration {
        now - self.heartbeat_at
    }

    /// Whether the holder looks dead to a reader using `max_age` as threshold.
    ///
    /// The holder never evaluates this; the threshold is the reader's call.
    pub fn is_stale(&self, now: chrono::DateTime<chrono::Utc>, max_age: Duration) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => self.heartbeat_age(now) > max_age,
            Err(_) => false,
        }
    }

    /// Diagnostic key/value view, in display order.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("holder", self.holder_id.clone()),
            ("host", self.host.clone().unwrap_or_else(|| "unknown".to_string())),
            (
                "pid",
                self.pid.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string()),
            ),
            ("acquired_at", self.acquired_at.to_rfc3339()),
            ("heartbeat_at", self.heartbeat_at.to_rfc3339()),
        ]
    }
}

impl fmt::Display for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs = self
            .pairs()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>();
        f.write_str(&pairs.join(" "))
    }
}

/// Exclusive ownership of an index directory.
///
/// Acquisition never waits: it either succeeds immediately or fails with
/// `IndexError::LockHeld`, and the caller decides whether to report, wait or
/// abort. Releasing a lock this handle does not hold is a no-op.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try once to acquire the lock.
    async fn lock(&self) -> Result<(), IndexError>;

    /// Release the lock if this handle holds it.
    async fn unlock(&self) -> Result<(), IndexError>;

    /// Whether this handle currently holds the lock.
    async fn is_locked(&self) -> bool;

    /// Read the lock record currently on disk, if any.
    async fn lock_info_on_disk(&self) -> Result<Option<LockInfo>, IndexError>;

    /// Refresh the liveness timestamp every `interval` until stopped.
    async fn start_heartbeat(&self, interval: Duration) -> Result<(), IndexError>;

    /// Stop the heartbeat. Safe to call any number of times.
    async fn stop_heartbeat(&self);
}
