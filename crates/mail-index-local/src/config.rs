use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use mail_index_core::IndexError;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::lock::DEFAULT_HEARTBEAT_INTERVAL;
use crate::sync::DEFAULT_SYNC_PAUSE;

/// Environment variable naming the index type.
pub const INDEX_TYPE_ENV: &str = "MAIL_INDEX_TYPE";

/// Settings file inside the index directory.
pub const SETTINGS_FILE_NAME: &str = "config.json";

/// Command line of the mail-index tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "mail-index")]
#[command(about = "Inspect and maintain a local mail search index")]
pub struct Config {
    /// Index directory
    #[arg(long, env = "MAIL_INDEX_DIR", global = true)]
    pub index_dir: Option<PathBuf>,

    /// Index type: json, ferret or auto. Overrides MAIL_INDEX_TYPE and the
    /// settings file.
    #[arg(long, global = true)]
    pub index_type: Option<String>,

    /// Hold the index lock while the command runs
    #[arg(long, global = true)]
    pub lock: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show the resolved backend and index size
    Info,

    /// Report who holds the index lock
    LockStatus {
        /// Report the holder as stale after this many seconds without heartbeat
        #[arg(long, default_value = "120")]
        stale_after: u64,
    },

    /// List messages matching a query, newest first
    Search {
        query: String,

        #[arg(long, short = 'n', default_value = "20")]
        limit: usize,
    },

    /// Count messages matching a query
    Count { query: String },

    /// List the thread of a message, oldest first
    Thread {
        id: String,

        /// Stop at the first killed message
        #[arg(long)]
        skip_killed: bool,

        #[arg(long, short = 'n')]
        limit: Option<usize>,
    },

    /// List the correspondents of one or more addresses
    Contacts {
        #[arg(required = true)]
        addresses: Vec<String>,

        #[arg(long, short = 'n')]
        limit: Option<usize>,
    },

    /// Run backend maintenance and save the index
    Optimize,
}

impl Config {
    /// Get the effective index directory.
    pub fn effective_index_dir(&self) -> PathBuf {
        self.index_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mail-index")
        })
    }
}

/// Per-directory settings, read from `{index_dir}/config.json`.
///
/// Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Index type token
    pub index: Option<String>,
    pub heartbeat_secs: u64,
    pub sync_pause_ms: u64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            index: None,
            heartbeat_secs: DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
            sync_pause_ms: DEFAULT_SYNC_PAUSE.as_millis() as u64,
        }
    }
}

impl IndexSettings {
    /// Load the settings of `dir`. A missing file yields the defaults.
    pub async fn load(dir: &Path) -> Result<Self, IndexError> {
        let path = dir.join(SETTINGS_FILE_NAME);
        match fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                IndexError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(IndexError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn sync_pause(&self) -> Duration {
        Duration::from_millis(self.sync_pause_ms)
    }
}
