//! Core traits and types for mail index backends.
//!
//! This crate defines the abstractions shared between the index handle and concrete backends:
//! - `IndexBackend`: the capability set every search/index backend implements
//! - `LockManager`: exclusive, cross-process ownership of an index directory
//! - `SourceManager`: the upstream mail sources persisted alongside the index
//! - `Message`, `Thread`, `Person`: the message model types crossing the boundary

mod error;
mod index;
mod lock;
mod message;
mod sources;

pub use error::{BackgroundError, IndexError};
pub use index::{ContactOptions, DeferredMessage, IndexBackend, ThreadOptions};
pub use lock::{LockInfo, LockManager};
pub use message::{Message, MessageId, Person, SourceId, Thread, LABEL_KILLED};
pub use sources::SourceManager;

/// Result type used throughout the index layer.
pub type Result<T, E = IndexError> = std::result::Result<T, E>;
