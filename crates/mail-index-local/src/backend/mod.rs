//! Index backends and backend selection.
//!
//! A process serves exactly one backend, chosen once at startup by
//! [`BackendKind::resolve`] and wrapped in the [`Backend`] dispatcher.

/// Implement `IndexBackend` for a backend holding its messages in a
/// `store: MessageStore` field.
///
/// Lookups and queries are answered by the store; the persistence and
/// mutation methods are given by the caller.
macro_rules! store_backed_index {
    ($ty:ident, $kind:expr, $($methods:tt)*) => {
        #[async_trait::async_trait]
        impl mail_index_core::IndexBackend for $ty {
            type Query = $crate::query::SearchQuery;

            fn name(&self) -> &'static str {
                $kind.token()
            }

            $($methods)*

            async fn contains_id(
                &self,
                id: &mail_index_core::MessageId,
            ) -> Result<bool, mail_index_core::IndexError> {
                Ok(self.store.contains(id).await)
            }

            async fn size(&self) -> Result<usize, mail_index_core::IndexError> {
                Ok(self.store.len().await)
            }

            async fn build_message(
                &self,
                id: &mail_index_core::MessageId,
            ) -> Result<mail_index_core::Message, mail_index_core::IndexError> {
                self.store
                    .get(id)
                    .await
                    .ok_or_else(|| mail_index_core::IndexError::message_not_found(id))
            }

            async fn source_for_id(
                &self,
                id: &mail_index_core::MessageId,
            ) -> Result<mail_index_core::SourceId, mail_index_core::IndexError> {
                self.store
                    .get(id)
                    .await
                    .map(|m| m.source)
                    .ok_or_else(|| mail_index_core::IndexError::message_not_found(id))
            }

            async fn load_contacts(
                &self,
                addresses: &[String],
                options: mail_index_core::ContactOptions,
            ) -> Result<Vec<mail_index_core::Person>, mail_index_core::IndexError> {
                Ok(self.store.contacts(addresses, options.limit).await)
            }

            fn parse_query(
                &self,
                text: &str,
            ) -> Result<$crate::query::SearchQuery, mail_index_core::IndexError> {
                $crate::query::SearchQuery::parse(text)
            }

            async fn num_results_for(
                &self,
                query: &$crate::query::SearchQuery,
            ) -> Result<usize, mail_index_core::IndexError> {
                Ok(self.store.count(query).await)
            }

            fn each_id<'a>(
                &'a self,
                query: &'a $crate::query::SearchQuery,
            ) -> futures::stream::BoxStream<
                'a,
                Result<mail_index_core::MessageId, mail_index_core::IndexError>,
            > {
                $crate::backend::date_stream(&self.store, query)
            }

            fn each_id_by_date<'a>(
                &'a self,
                query: &'a $crate::query::SearchQuery,
            ) -> futures::stream::BoxStream<
                'a,
                Result<mail_index_core::MessageId, mail_index_core::IndexError>,
            > {
                $crate::backend::date_stream(&self.store, query)
            }

            fn each_message_in_thread_for<'a>(
                &'a self,
                message: &'a mail_index_core::Message,
                options: mail_index_core::ThreadOptions,
            ) -> futures::stream::BoxStream<
                'a,
                Result<
                    (mail_index_core::MessageId, mail_index_core::DeferredMessage<'a, Self>),
                    mail_index_core::IndexError,
                >,
            > {
                $crate::backend::thread_stream(self, &self.store, message, options)
            }
        }
    };
}

mod ferret;
mod json;

pub use ferret::FerretIndex;
pub use json::JsonIndex;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use mail_index_core::{
    ContactOptions, DeferredMessage, IndexBackend, IndexError, Message, MessageId, Person,
    SourceId, ThreadOptions, LABEL_KILLED,
};
use tracing::debug;

use crate::query::SearchQuery;
use crate::store::{DateKey, MessageStore};

/// Token that asks for on-disk detection instead of a specific backend.
pub const AUTO: &str = "auto";

/// Known backend types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Json,
    Ferret,
}

impl BackendKind {
    /// Used when nothing else points at a backend.
    pub const DEFAULT: BackendKind = BackendKind::Json;

    /// On-disk evidence, checked in this order.
    const DETECTION_ORDER: [BackendKind; 2] = [BackendKind::Json, BackendKind::Ferret];

    pub fn token(self) -> &'static str {
        match self {
            BackendKind::Json => "json",
            BackendKind::Ferret => "ferret",
        }
    }

    /// Subdirectory of the index directory holding this backend's data.
    pub fn dir_name(self) -> &'static str {
        self.token()
    }

    /// Pick the backend type.
    ///
    /// First match wins: an explicit request other than `auto`, the
    /// environment, the config file, an existing backend subdirectory of
    /// `inputs.dir`, then [`BackendKind::DEFAULT`]. An unknown token is an
    /// error, never a fallback.
    pub fn resolve(inputs: &ResolveInputs<'_>) -> Result<Self, IndexError> {
        let requested = [
            (inputs.explicit, "argument"),
            (inputs.env, "environment"),
            (inputs.config, "config file"),
        ]
        .into_iter()
        .find_map(|(token, origin)| {
            token
                .map(str::trim)
                .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case(AUTO))
                .map(|t| (t, origin))
        });

        if let Some((token, origin)) = requested {
            let kind = token.parse()?;
            debug!("Index type {} requested by {}", kind, origin);
            return Ok(kind);
        }

        for kind in Self::DETECTION_ORDER {
            if inputs.dir.join(kind.dir_name()).is_dir() {
                debug!("Detected {} index in {}", kind, inputs.dir.display());
                return Ok(kind);
            }
        }

        debug!("No index found in {}, using {}", inputs.dir.display(), Self::DEFAULT);
        Ok(Self::DEFAULT)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for BackendKind {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::DETECTION_ORDER
            .into_iter()
            .find(|kind| kind.token().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| IndexError::BackendResolution {
                requested: s.to_string(),
                reason: format!(
                    "expected one of {}",
                    Self::DETECTION_ORDER.map(BackendKind::token).join(", ")
                ),
            })
    }
}

/// Everything [`BackendKind::resolve`] looks at.
#[derive(Debug, Clone, Copy)]
pub struct ResolveInputs<'a> {
    pub explicit: Option<&'a str>,
    pub env: Option<&'a str>,
    pub config: Option<&'a str>,
    pub dir: &'a Path,
}

/// The backend serving this process.
#[derive(Debug)]
pub enum Backend {
    Json(JsonIndex),
    Ferret(FerretIndex),
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $body:expr) => {
        match $self {
            Backend::Json($b) => $body,
            Backend::Ferret($b) => $body,
        }
    };
}

impl Backend {
    /// An empty backend of the given type. Call `load_index` to fill it.
    pub fn open(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Json => Backend::Json(JsonIndex::new()),
            BackendKind::Ferret => Backend::Ferret(FerretIndex::new()),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Json(_) => BackendKind::Json,
            Backend::Ferret(_) => BackendKind::Ferret,
        }
    }
}

#[async_trait]
impl IndexBackend for Backend {
    type Query = SearchQuery;

    fn name(&self) -> &'static str {
        dispatch!(self, b => b.name())
    }

    async fn load_index(&self, dir: &Path) -> Result<(), IndexError> {
        dispatch!(self, b => b.load_index(dir).await)
    }

    async fn save_index(&self, dir: &Path) -> Result<(), IndexError> {
        dispatch!(self, b => b.save_index(dir).await)
    }

    async fn add_message(&self, message: &Message) -> Result<(), IndexError> {
        dispatch!(self, b => b.add_message(message).await)
    }

    async fn update_message(&self, message: &Message) -> Result<(), IndexError> {
        dispatch!(self, b => b.update_message(message).await)
    }

    async fn update_message_state(&self, message: &Message) -> Result<(), IndexError> {
        dispatch!(self, b => b.update_message_state(message).await)
    }

    async fn delete(&self, id: &MessageId) -> Result<bool, IndexError> {
        dispatch!(self, b => b.delete(id).await)
    }

    async fn optimize(&self) -> Result<(), IndexError> {
        dispatch!(self, b => b.optimize().await)
    }

    async fn contains_id(&self, id: &MessageId) -> Result<bool, IndexError> {
        dispatch!(self, b => b.contains_id(id).await)
    }

    async fn size(&self) -> Result<usize, IndexError> {
        dispatch!(self, b => b.size().await)
    }

    async fn build_message(&self, id: &MessageId) -> Result<Message, IndexError> {
        dispatch!(self, b => b.build_message(id).await)
    }

    async fn source_for_id(&self, id: &MessageId) -> Result<SourceId, IndexError> {
        dispatch!(self, b => b.source_for_id(id).await)
    }

    async fn load_contacts(
        &self,
        addresses: &[String],
        options: ContactOptions,
    ) -> Result<Vec<Person>, IndexError> {
        dispatch!(self, b => b.load_contacts(addresses, options).await)
    }

    fn parse_query(&self, text: &str) -> Result<SearchQuery, IndexError> {
        dispatch!(self, b => b.parse_query(text))
    }

    async fn num_results_for(&self, query: &SearchQuery) -> Result<usize, IndexError> {
        dispatch!(self, b => b.num_results_for(query).await)
    }

    fn each_id<'a>(&'a self, query: &'a SearchQuery) -> BoxStream<'a, Result<MessageId, IndexError>> {
        dispatch!(self, b => b.each_id(query))
    }

    fn each_id_by_date<'a>(
        &'a self,
        query: &'a SearchQuery,
    ) -> BoxStream<'a, Result<MessageId, IndexError>> {
        dispatch!(self, b => b.each_id_by_date(query))
    }

    fn each_message_in_thread_for<'a>(
        &'a self,
        message: &'a Message,
        options: ThreadOptions,
    ) -> BoxStream<'a, Result<(MessageId, DeferredMessage<'a, Self>), IndexError>> {
        let ids = dispatch!(self, b => b
            .each_message_in_thread_for(message, options)
            .map_ok(|(id, _)| id)
            .boxed());
        ids.map_ok(move |id| (id.clone(), DeferredMessage::new(self, id)))
            .boxed()
    }
}

/// Ids matching `query`, newest first, one store lookup per item.
pub(crate) fn date_stream<'a>(
    store: &'a MessageStore,
    query: &'a SearchQuery,
) -> BoxStream<'a, Result<MessageId, IndexError>> {
    stream::unfold(None::<DateKey>, move |cursor| async move {
        let key = store.next_match_by_date(cursor.as_ref(), query).await?;
        Some((Ok(key.1.clone()), Some(key)))
    })
    .boxed()
}

/// Thread members of `message`, oldest first, stopping at the first killed
/// message when asked to.
pub(crate) fn thread_stream<'a, B: IndexBackend>(
    backend: &'a B,
    store: &'a MessageStore,
    message: &'a Message,
    options: ThreadOptions,
) -> BoxStream<'a, Result<(MessageId, DeferredMessage<'a, B>), IndexError>> {
    stream::once(store.thread_of(message))
        .flat_map(stream::iter)
        .then(move |id| async move {
            let killed = store
                .get(&id)
                .await
                .is_some_and(|m| m.has_label(LABEL_KILLED));
            (id, killed)
        })
        .take_while(move |(_, killed)| future::ready(!(options.skip_killed && *killed)))
        .take(options.limit.unwrap_or(usize::MAX))
        .map(move |(id, _)| Ok((id.clone(), DeferredMessage::new(backend, id))))
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn inputs<'a>(
        dir: &'a Path,
        explicit: Option<&'a str>,
        env: Option<&'a str>,
        config: Option<&'a str>,
    ) -> ResolveInputs<'a> {
        ResolveInputs {
            explicit,
            env,
            config,
            dir,
        }
    }

    #[test]
    fn test_resolve_precedence() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path();
        std::fs::create_dir(dir.join("json")).unwrap();

        let resolve = |e, v, c| BackendKind::resolve(&inputs(dir, e, v, c)).unwrap();
        assert_eq!(resolve(Some("ferret"), Some("json"), Some("json")), BackendKind::Ferret);
        assert_eq!(resolve(None, Some("ferret"), Some("json")), BackendKind::Ferret);
        assert_eq!(resolve(None, None, Some("Ferret")), BackendKind::Ferret);
        assert_eq!(resolve(Some("auto"), Some("ferret"), None), BackendKind::Ferret);
        assert_eq!(resolve(None, None, None), BackendKind::Json);
    }

    #[test]
    fn test_resolve_auto_detects_legacy_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("ferret")).unwrap();

        let kind = BackendKind::resolve(&inputs(temp.path(), Some("auto"), None, None)).unwrap();
        assert_eq!(kind, BackendKind::Ferret);

        // The current format wins when both are present
        std::fs::create_dir(temp.path().join("json")).unwrap();
        let kind = BackendKind::resolve(&inputs(temp.path(), None, None, None)).unwrap();
        assert_eq!(kind, BackendKind::Json);
    }

    #[test]
    fn test_resolve_empty_dir_uses_default() {
        let temp = TempDir::new().unwrap();
        let kind = BackendKind::resolve(&inputs(temp.path(), None, None, None)).unwrap();
        assert_eq!(kind, BackendKind::DEFAULT);
    }

    #[test]
    fn test_resolve_unknown_type_fails() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("json")).unwrap();

        let err = BackendKind::resolve(&inputs(temp.path(), None, Some("xapian"), None)).unwrap_err();
        match err {
            IndexError::BackendResolution { requested, reason } => {
                assert_eq!(requested, "xapian");
                assert!(reason.contains("json"));
            }
            other => panic!("expected resolution error, got {:?}", other),
        }
    }

    #[test]
    fn test_open_matches_kind() {
        for kind in [BackendKind::Json, BackendKind::Ferret] {
            let backend = Backend::open(kind);
            assert_eq!(backend.kind(), kind);
            assert_eq!(backend.name(), kind.token());
            assert!(tokio_test::block_on(backend.is_empty()).unwrap());
        }
    }

    async fn read_all<B: IndexBackend<Query = SearchQuery>>(
        backend: &B,
        seed: &Message,
    ) -> (usize, bool, Vec<MessageId>, Vec<MessageId>, Vec<String>, SourceId) {
        let query = backend.parse_query("from:b@example.org OR subject:plan").unwrap();
        let ids = backend.each_id_by_date(&query).try_collect().await.unwrap();
        let thread = backend
            .each_message_in_thread_for(seed, ThreadOptions::default())
            .map_ok(|(id, _)| id)
            .try_collect()
            .await
            .unwrap();
        let contacts = backend
            .load_contacts(&["b@example.org".to_string()], ContactOptions { limit: Some(10) })
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.email)
            .collect();
        (
            backend.size().await.unwrap(),
            backend.contains_id(&seed.id).await.unwrap(),
            ids,
            thread,
            contacts,
            backend.source_for_id(&seed.id).await.unwrap(),
        )
    }

    #[tokio::test]
    async fn test_store_backed_reads_agree_across_backends() {
        let temp = TempDir::new().unwrap();
        let date = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut root = Message::new("root", date, Person::new(None, "a@example.org"), SourceId(4));
        root.subject = "plan".into();
        let mut reply = Message::new(
            "reply",
            date + chrono::Duration::minutes(1),
            Person::new(None, "b@example.org"),
            SourceId(4),
        );
        reply.replytos.push(root.id.clone());
        reply.to.push(Person::new(None, "a@example.org"));

        let json = JsonIndex::new();
        json.add_message(&root).await.unwrap();
        json.add_message(&reply).await.unwrap();

        let legacy_dir = temp.path().join("ferret");
        std::fs::create_dir(&legacy_dir).unwrap();
        let lines: Vec<String> = [&root, &reply]
            .iter()
            .map(|m| serde_json::to_string(m).unwrap())
            .collect();
        std::fs::write(legacy_dir.join("messages.jsonl"), lines.join("\n")).unwrap();
        let ferret = FerretIndex::new();
        ferret.load_index(temp.path()).await.unwrap();

        let expected = read_all(&json, &reply).await;
        assert_eq!(expected.0, 2);
        assert_eq!(expected.2, vec![reply.id.clone(), root.id.clone()]);
        assert_eq!(expected.3, vec![root.id.clone(), reply.id.clone()]);
        assert_eq!(expected.4, vec!["a@example.org".to_string()]);
        assert_eq!(read_all(&ferret, &reply).await, expected);

        let missing = MessageId::new("missing");
        assert!(matches!(
            ferret.build_message(&missing).await,
            Err(IndexError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_selected_backend() {
        let backend = Backend::open(BackendKind::Json);
        let date = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let root = Message::new("root", date, Person::new(None, "a@example.org"), SourceId(1));
        let mut reply = Message::new(
            "reply",
            date + chrono::Duration::minutes(1),
            Person::new(None, "b@example.org"),
            SourceId(1),
        );
        reply.replytos.push(root.id.clone());
        backend.add_message(&root).await.unwrap();
        backend.add_message(&reply).await.unwrap();

        let query = backend.parse_query("from:b@example.org").unwrap();
        assert_eq!(backend.num_results_for(&query).await.unwrap(), 1);

        let thread: Vec<_> = backend
            .each_message_in_thread_for(&reply, ThreadOptions::default())
            .try_collect()
            .await
            .unwrap();
        let (first_id, first) = thread.into_iter().next().unwrap();
        assert_eq!(first_id, root.id);
        assert_eq!(first.build().await.unwrap().from.email, "a@example.org");

        let legacy = Backend::open(BackendKind::Ferret);
        assert!(matches!(
            legacy.add_message(&root).await,
            Err(IndexError::NotImplemented { backend: "ferret", .. })
        ));
    }
}
