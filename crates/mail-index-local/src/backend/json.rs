use std::path::{Path, PathBuf};

use mail_index_core::{IndexError, Message, MessageId};
use tokio::fs;
use tracing::{debug, info, instrument};

use super::BackendKind;
use crate::store::MessageStore;

const MESSAGES_FILE: &str = "messages.json";

/// Default index backend.
///
/// Keeps every message in memory and persists them as one JSON array:
/// ```text
/// {index_dir}/
///   json/
///     messages.json
/// ```
#[derive(Debug, Default)]
pub struct JsonIndex {
    store: MessageStore,
}

impl JsonIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_dir(dir: &Path) -> PathBuf {
        dir.join(BackendKind::Json.dir_name())
    }

    fn messages_path(dir: &Path) -> PathBuf {
        Self::index_dir(dir).join(MESSAGES_FILE)
    }
}

store_backed_index! {
    JsonIndex,
    BackendKind::Json,

    #[instrument(skip(self), level = "debug")]
    async fn load_index(&self, dir: &Path) -> Result<(), IndexError> {
        let path = Self::messages_path(dir);
        let messages: Vec<Message> = match fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                IndexError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No index at {}, starting empty", path.display());
                Vec::new()
            }
            Err(e) => {
                return Err(IndexError::Io(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let count = messages.len();
        self.store.replace_all(messages).await;
        info!("Loaded {} messages from {}", count, path.display());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn save_index(&self, dir: &Path) -> Result<(), IndexError> {
        let index_dir = Self::index_dir(dir);
        fs::create_dir_all(&index_dir).await.map_err(|e| {
            IndexError::Io(format!("Failed to create {}: {}", index_dir.display(), e))
        })?;

        let messages = self.store.snapshot().await;
        let data = serde_json::to_vec(&messages)
            .map_err(|e| IndexError::Serialization(format!("Failed to encode index: {}", e)))?;

        // Write atomically via temp file
        let path = Self::messages_path(dir);
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &data).await.map_err(|e| {
            IndexError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            IndexError::Io(format!("Failed to rename {}: {}", temp_path.display(), e))
        })?;

        debug!("Saved {} messages ({} bytes)", messages.len(), data.len());
        Ok(())
    }

    #[instrument(skip(self, message), level = "debug", fields(id = %message.id))]
    async fn add_message(&self, message: &Message) -> Result<(), IndexError> {
        if self.store.insert(message.clone()).await.is_some() {
            debug!("Replaced existing entry");
        }
        Ok(())
    }

    #[instrument(skip(self, message), level = "debug", fields(id = %message.id))]
    async fn update_message(&self, message: &Message) -> Result<(), IndexError> {
        self.store.insert(message.clone()).await;
        Ok(())
    }

    #[instrument(skip(self, message), level = "debug", fields(id = %message.id))]
    async fn update_message_state(&self, message: &Message) -> Result<(), IndexError> {
        if !self.store.update_labels(message).await {
            debug!("State update for unindexed message, indexing it");
            self.store.insert(message.clone()).await;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, id: &MessageId) -> Result<bool, IndexError> {
        Ok(self.store.remove(id).await.is_some())
    }

    async fn optimize(&self) -> Result<(), IndexError> {
        let count = self.store.rebuild().await;
        info!("Rebuilt index orderings for {} messages", count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::BoxStream;
    use futures::{StreamExt, TryStreamExt};
    use mail_index_core::{IndexBackend, Person, SourceId, ThreadOptions, LABEL_KILLED};
    use tempfile::TempDir;

    fn message(id: &str, minutes: i64) -> Message {
        let date = chrono::DateTime::from_timestamp(1_700_000_000 + minutes * 60, 0).unwrap();
        let mut m = Message::new(id, date, Person::new(None, "ann@example.org"), SourceId(7));
        m.subject = format!("subject {}", id);
        m
    }

    async fn ids(stream: BoxStream<'_, Result<MessageId, IndexError>>) -> Vec<String> {
        stream
            .map_ok(|id| id.to_string())
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_delete_round_trip() {
        let index = JsonIndex::new();
        index.add_message(&message("keep", 1)).await.unwrap();
        let before = index.size().await.unwrap();

        let m = message("temp", 2);
        index.add_message(&m).await.unwrap();
        assert!(index.contains(&m).await.unwrap());
        assert!(index.delete(&m.id).await.unwrap());

        assert_eq!(index.size().await.unwrap(), before);
        assert!(!index.contains_id(&m.id).await.unwrap());

        // Deleting again is a no-op
        assert!(!index.delete(&m.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_is_empty_tracks_size() {
        let index = JsonIndex::new();
        assert!(index.is_empty().await.unwrap());
        assert_eq!(index.size().await.unwrap(), 0);

        index.add_message(&message("a", 1)).await.unwrap();
        assert!(!index.is_empty().await.unwrap());
        assert_eq!(index.size().await.unwrap(), 1);

        for i in 0..9 {
            index.add_message(&message(&format!("n{}", i), i)).await.unwrap();
        }
        assert!(!index.is_empty().await.unwrap());
        assert_eq!(index.size().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_each_id_by_date_is_newest_first() {
        let index = JsonIndex::new();
        index.add_message(&message("old", 1)).await.unwrap();
        index.add_message(&message("new", 3)).await.unwrap();
        index.add_message(&message("mid", 2)).await.unwrap();

        let query = index.parse_query("subject").unwrap();
        assert_eq!(ids(index.each_id_by_date(&query)).await, vec!["new", "mid", "old"]);

        // Early stop only pulls what it needs
        let first: Vec<_> = index.each_id_by_date(&query).take(1).collect().await;
        assert_eq!(first.len(), 1);
    }

    #[tokio::test]
    async fn test_each_message_mirrors_each_id() {
        let index = JsonIndex::new();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            index.add_message(&message(id, i as i64)).await.unwrap();
        }
        index.add_message(&message("zzz-other", 9)).await.unwrap();

        let query = index.parse_query("id:a OR id:c").unwrap();
        let expected = ids(index.each_id(&query)).await;
        let built: Vec<String> = index
            .each_message(&query)
            .map_ok(|m| m.id.to_string())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(built, expected);
        assert_eq!(expected, vec!["c", "a"]);

        // A second call yields a fresh sequence
        assert_eq!(ids(index.each_id(&query)).await, expected);
        assert_eq!(index.num_results_for(&query).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_thread_stops_at_killed_message() {
        let index = JsonIndex::new();
        let first = message("t1", 1);
        let mut second = message("t2", 2);
        second.replytos.push(first.id.clone());
        let mut third = message("t3", 3);
        third.replytos.push(second.id.clone());
        third.labels.insert(LABEL_KILLED.to_string());
        let mut fourth = message("t4", 4);
        fourth.replytos.push(third.id.clone());

        for m in [&first, &second, &third, &fourth] {
            index.add_message(m).await.unwrap();
        }

        let options = ThreadOptions {
            skip_killed: true,
            ..Default::default()
        };
        let entries: Vec<_> = index
            .each_message_in_thread_for(&first, options)
            .try_collect()
            .await
            .unwrap();
        let yielded: Vec<&str> = entries.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(yielded, vec!["t1", "t2"]);

        // Without skip_killed the whole thread comes back, bounded by limit
        let options = ThreadOptions {
            limit: Some(3),
            skip_killed: false,
        };
        let entries: Vec<_> = index
            .each_message_in_thread_for(&fourth, options)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);

        let (id, deferred) = entries.into_iter().nth(2).unwrap();
        assert_eq!(deferred.build().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_update_message_state_only_touches_labels() {
        let index = JsonIndex::new();
        let mut m = message("a", 1);
        index.add_message(&m).await.unwrap();

        m.subject = "edited locally".to_string();
        m.add_label("starred");
        index.update_message_state(&m).await.unwrap();

        let stored = index.build_message(&m.id).await.unwrap();
        assert!(stored.has_label("starred"));
        assert_eq!(stored.subject, "subject a");

        index.update_message(&m).await.unwrap();
        assert_eq!(index.build_message(&m.id).await.unwrap().subject, "edited locally");
    }

    #[tokio::test]
    async fn test_lookups_of_missing_message() {
        let index = JsonIndex::new();
        let id = MessageId::new("missing");
        assert!(matches!(index.build_message(&id).await, Err(IndexError::NotFound(_))));
        assert!(matches!(index.source_for_id(&id).await, Err(IndexError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let index = JsonIndex::new();
        let mut m = message("a", 1);
        m.labels.insert("inbox".to_string());
        index.add_message(&m).await.unwrap();
        index.add_message(&message("b", 2)).await.unwrap();
        index.save_index(temp.path()).await.unwrap();
        assert!(temp.path().join("json").join(MESSAGES_FILE).exists());

        let reloaded = JsonIndex::new();
        reloaded.load_index(temp.path()).await.unwrap();
        assert_eq!(reloaded.size().await.unwrap(), 2);
        assert_eq!(reloaded.source_for_id(&m.id).await.unwrap(), SourceId(7));
        assert!(reloaded.build_message(&m.id).await.unwrap().has_label("inbox"));

        reloaded.optimize().await.unwrap();
        assert_eq!(reloaded.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_load_without_index_is_empty() {
        let temp = TempDir::new().unwrap();
        let index = JsonIndex::new();
        index.load_index(temp.path()).await.unwrap();
        assert!(index.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_parse_query_errors() {
        let index = JsonIndex::new();
        assert!(index.parse_query("subject:foo AND NOT label:spam").is_ok());
        assert!(matches!(
            index.parse_query("subject:foo AND NOT"),
            Err(IndexError::Parse { .. })
        ));
    }
}
