//! Local mail index: filesystem backends, directory locking and the state
//! sync worker, tied together by [`Index`].

pub mod backend;
pub mod config;
pub mod index;
pub mod lock;
pub mod query;
pub mod store;
pub mod sync;

pub use backend::{Backend, BackendKind, FerretIndex, JsonIndex, ResolveInputs};
pub use config::{Config, IndexSettings};
pub use index::Index;
pub use lock::FileLock;
pub use query::SearchQuery;
pub use sync::SyncWorker;
