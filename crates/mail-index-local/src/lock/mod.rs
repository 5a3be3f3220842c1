mod file;

pub use file::{FileLock, DEFAULT_HEARTBEAT_INTERVAL, LOCK_FILE_NAME};
pub use mail_index_core::{LockInfo, LockManager};
