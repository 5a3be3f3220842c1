use std::path::Path;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};

use crate::error::IndexError;
use crate::message::{Message, MessageId, Person, SourceId};

/// Options for [`IndexBackend::each_message_in_thread_for`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadOptions {
    /// Maximum number of messages yielded
    pub limit: Option<usize>,
    /// Stop expanding the thread at the first killed message
    pub skip_killed: bool,
}

/// Options for [`IndexBackend::load_contacts`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ContactOptions {
    /// Maximum number of people returned
    pub limit: Option<usize>,
}

/// A message that has been located but not built yet.
///
/// Thread iteration hands these out so that callers can skip building
/// messages they are not interested in.
pub struct DeferredMessage<'a, B: ?Sized> {
    id: MessageId,
    backend: &'a B,
}

impl<'a, B: IndexBackend + ?Sized> DeferredMessage<'a, B> {
    pub fn new(backend: &'a B, id: MessageId) -> Self {
        Self { id, backend }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Build the full message from the index.
    pub async fn build(self) -> Result<Message, IndexError> {
        self.backend.build_message(&self.id).await
    }
}

impl<B: ?Sized> std::fmt::Debug for DeferredMessage<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredMessage")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Capability set of a search/index backend.
///
/// Exactly one backend serves a process. Every required method must be
/// provided by each backend; a backend that cannot support a capability
/// returns `IndexError::NotImplemented` from it.
///
/// All methods take `&self`: backends use interior mutability, and mutation
/// ordering is enforced by the index handle (direct calls or the sync worker,
/// never both at once).
#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Compiled query, produced by [`IndexBackend::parse_query`].
    type Query: Send + Sync;

    /// Returns the backend type token (e.g., "json", "ferret").
    fn name(&self) -> &'static str;

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Load backend state from `dir`.
    async fn load_index(&self, dir: &Path) -> Result<(), IndexError>;

    /// Persist backend state under `dir`.
    async fn save_index(&self, dir: &Path) -> Result<(), IndexError>;

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Index a new message.
    async fn add_message(&self, message: &Message) -> Result<(), IndexError>;

    /// Re-index every field of a message.
    async fn update_message(&self, message: &Message) -> Result<(), IndexError>;

    /// Re-index the mutable state (labels) of a message.
    async fn update_message_state(&self, message: &Message) -> Result<(), IndexError>;

    /// Remove a message. Returns whether it was present.
    async fn delete(&self, id: &MessageId) -> Result<bool, IndexError>;

    /// Backend-specific maintenance pass. Safe to call when idle.
    async fn optimize(&self) -> Result<(), IndexError>;

    // =========================================================================
    // Lookups
    // =========================================================================

    async fn contains_id(&self, id: &MessageId) -> Result<bool, IndexError>;

    async fn contains(&self, message: &Message) -> Result<bool, IndexError> {
        self.contains_id(&message.id).await
    }

    /// Number of indexed messages.
    async fn size(&self) -> Result<usize, IndexError>;

    async fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.size().await? == 0)
    }

    /// Load a message from the index.
    async fn build_message(&self, id: &MessageId) -> Result<Message, IndexError>;

    /// Source the message was synced from.
    async fn source_for_id(&self, id: &MessageId) -> Result<SourceId, IndexError>;

    /// People who sent mail to, or received mail from, any of `addresses`.
    async fn load_contacts(
        &self,
        addresses: &[String],
        options: ContactOptions,
    ) -> Result<Vec<Person>, IndexError>;

    // =========================================================================
    // Queries
    // =========================================================================

    /// Parse a user query. Fails with `IndexError::Parse`, never partially.
    fn parse_query(&self, text: &str) -> Result<Self::Query, IndexError>;

    /// Number of messages matching `query`.
    async fn num_results_for(&self, query: &Self::Query) -> Result<usize, IndexError>;

    /// Ids matching `query`.
    ///
    /// Each call starts a fresh sequence.
    fn each_id<'a>(&'a self, query: &'a Self::Query) -> BoxStream<'a, Result<MessageId, IndexError>>;

    /// Ids matching `query`, newest first.
    ///
    /// Results can be very large; callers are expected to stop early.
    fn each_id_by_date<'a>(
        &'a self,
        query: &'a Self::Query,
    ) -> BoxStream<'a, Result<MessageId, IndexError>>;

    /// Messages matching `query`, in the order of [`IndexBackend::each_id`].
    fn each_message<'a>(&'a self, query: &'a Self::Query) -> BoxStream<'a, Result<Message, IndexError>> {
        self.each_id(query)
            .then(move |id| async move {
                match id {
                    Ok(id) => self.build_message(&id).await,
                    Err(e) => Err(e),
                }
            })
            .boxed()
    }

    /// Every message of the thread containing `message`, oldest first, found
    /// by repeatedly querying the index.
    fn each_message_in_thread_for<'a>(
        &'a self,
        message: &'a Message,
        options: ThreadOptions,
    ) -> BoxStream<'a, Result<(MessageId, DeferredMessage<'a, Self>), IndexError>>;
}
