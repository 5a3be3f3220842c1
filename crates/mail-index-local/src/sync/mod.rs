mod worker;

pub use worker::{StateSink, SyncWorker, DEFAULT_SYNC_PAUSE};
