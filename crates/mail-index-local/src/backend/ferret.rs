use std::path::{Path, PathBuf};

use mail_index_core::{IndexBackend, IndexError, Message, MessageId};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, instrument};

use super::BackendKind;
use crate::store::MessageStore;

const MESSAGES_FILE: &str = "messages.jsonl";

/// Legacy index format, supported read-only.
///
/// One JSON message per line:
/// ```text
/// {index_dir}/
///   ferret/
///     messages.jsonl
/// ```
/// Lookups and queries work as with the json index. Every mutation, saving
/// and optimizing fail with `IndexError::NotImplemented`.
#[derive(Debug, Default)]
pub struct FerretIndex {
    store: MessageStore,
}

impl FerretIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn messages_path(dir: &Path) -> PathBuf {
        dir.join(BackendKind::Ferret.dir_name()).join(MESSAGES_FILE)
    }

    fn read_only(&self, capability: &'static str) -> IndexError {
        IndexError::not_implemented(self.name(), capability)
    }
}

store_backed_index! {
    FerretIndex,
    BackendKind::Ferret,

    #[instrument(skip(self), level = "debug")]
    async fn load_index(&self, dir: &Path) -> Result<(), IndexError> {
        let path = Self::messages_path(dir);
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No index at {}, starting empty", path.display());
                self.store.replace_all(Vec::new()).await;
                return Ok(());
            }
            Err(e) => {
                return Err(IndexError::Io(format!(
                    "Failed to open {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let mut lines = BufReader::new(file).lines();
        let mut messages = Vec::new();
        let mut line_no = 0usize;

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| IndexError::Io(format!("Failed to read {}: {}", path.display(), e)))?
        {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let message: Message = serde_json::from_str(&line).map_err(|e| {
                IndexError::Serialization(format!(
                    "Failed to parse {} line {}: {}",
                    path.display(),
                    line_no,
                    e
                ))
            })?;
            messages.push(message);
        }

        let count = messages.len();
        self.store.replace_all(messages).await;
        info!("Loaded {} messages from legacy index {}", count, path.display());
        Ok(())
    }

    async fn save_index(&self, _dir: &Path) -> Result<(), IndexError> {
        Err(self.read_only("save_index"))
    }

    async fn add_message(&self, _message: &Message) -> Result<(), IndexError> {
        Err(self.read_only("add_message"))
    }

    async fn update_message(&self, _message: &Message) -> Result<(), IndexError> {
        Err(self.read_only("update_message"))
    }

    async fn update_message_state(&self, _message: &Message) -> Result<(), IndexError> {
        Err(self.read_only("update_message_state"))
    }

    async fn delete(&self, _id: &MessageId) -> Result<bool, IndexError> {
        Err(self.read_only("delete"))
    }

    async fn optimize(&self) -> Result<(), IndexError> {
        Err(self.read_only("optimize"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use mail_index_core::{Person, SourceId, ThreadOptions};
    use tempfile::TempDir;

    fn message(id: &str, minutes: i64) -> Message {
        let date = chrono::DateTime::from_timestamp(1_700_000_000 + minutes * 60, 0).unwrap();
        Message::new(id, date, Person::new(None, "ann@example.org"), SourceId(3))
    }

    async fn write_legacy(dir: &Path, messages: &[Message]) {
        let legacy = dir.join("ferret");
        fs::create_dir_all(&legacy).await.unwrap();
        let mut data = String::new();
        for m in messages {
            data.push_str(&serde_json::to_string(m).unwrap());
            data.push_str("\n\n");
        }
        fs::write(legacy.join(MESSAGES_FILE), data).await.unwrap();
    }

    #[tokio::test]
    async fn test_loads_and_queries_legacy_index() {
        let temp = TempDir::new().unwrap();
        let mut reply = message("b", 2);
        reply.replytos.push(MessageId::new("a"));
        write_legacy(temp.path(), &[message("a", 1), reply.clone()]).await;

        let index = FerretIndex::new();
        index.load_index(temp.path()).await.unwrap();
        assert_eq!(index.size().await.unwrap(), 2);
        assert_eq!(index.source_for_id(&reply.id).await.unwrap(), SourceId(3));

        let query = index.parse_query("from:ann").unwrap();
        let ids: Vec<MessageId> = index.each_id_by_date(&query).try_collect().await.unwrap();
        assert_eq!(ids, vec![MessageId::new("b"), MessageId::new("a")]);

        let thread: Vec<_> = index
            .each_message_in_thread_for(&reply, ThreadOptions::default())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(thread.len(), 2);
    }

    #[tokio::test]
    async fn test_mutations_are_not_implemented() {
        let temp = TempDir::new().unwrap();
        let index = FerretIndex::new();
        index.load_index(temp.path()).await.unwrap();
        let m = message("a", 1);

        assert!(matches!(
            index.add_message(&m).await,
            Err(IndexError::NotImplemented { backend: "ferret", capability: "add_message" })
        ));
        assert!(matches!(
            index.update_message_state(&m).await,
            Err(IndexError::NotImplemented { .. })
        ));
        assert!(matches!(index.delete(&m.id).await, Err(IndexError::NotImplemented { .. })));
        assert!(matches!(
            index.save_index(temp.path()).await,
            Err(IndexError::NotImplemented { .. })
        ));
        assert!(matches!(index.optimize().await, Err(IndexError::NotImplemented { .. })));

        // Failed writes leave the index untouched
        assert!(index.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_line_reports_position() {
        let temp = TempDir::new().unwrap();
        let legacy = temp.path().join("ferret");
        fs::create_dir_all(&legacy).await.unwrap();
        let line = serde_json::to_string(&message("a", 1)).unwrap();
        fs::write(legacy.join(MESSAGES_FILE), format!("{}\n{{broken\n", line))
            .await
            .unwrap();

        let err = FerretIndex::new().load_index(temp.path()).await.unwrap_err();
        match err {
            IndexError::Serialization(msg) => assert!(msg.contains("line 2"), "{}", msg),
            other => panic!("expected serialization error, got {:?}", other),
        }
    }
}
