use async_trait::async_trait;

use crate::error::IndexError;

/// Registry of upstream mail sources, persisted alongside the index.
///
/// The index handle loads sources before the index and saves them before the
/// index, so that message source ids always resolve.
#[async_trait]
pub trait SourceManager: Send + Sync {
    async fn load_sources(&self) -> Result<(), IndexError>;

    async fn save_sources(&self) -> Result<(), IndexError>;
}
