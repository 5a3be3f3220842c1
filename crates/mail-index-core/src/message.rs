use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Label carried by messages the user has muted ("killed") in a thread.
pub const LABEL_KILLED: &str = "killed";

/// RFC 5322 message identifier, without angle brackets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of the upstream mail source a message was ingested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A correspondent. Two people are the same person when their addresses match
/// case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    #[serde(default)]
    pub name: Option<String>,
    pub email: String,
}

impl Person {
    pub fn new(name: Option<&str>, email: impl Into<String>) -> Self {
        Self {
            name: name.map(str::to_string),
            email: email.into(),
        }
    }

    /// Lower-cased address, used for comparisons.
    pub fn normalized_email(&self) -> String {
        self.email.to_ascii_lowercase()
    }
}

impl PartialEq for Person {
    fn eq(&self, other: &Self) -> bool {
        self.email.eq_ignore_ascii_case(&other.email)
    }
}

impl Eq for Person {}

impl std::hash::Hash for Person {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized_email().hash(state);
    }
}

impl fmt::Display for Person {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.email),
            None => f.write_str(&self.email),
        }
    }
}

/// A message as seen by the index.
///
/// The message model owns construction; the index only stores what it needs to
/// search, rebuild threads and rebuild the message itself. `dirty` is never
/// persisted: it marks label changes that still have to reach the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub date: chrono::DateTime<chrono::Utc>,
    pub from: Person,
    #[serde(default)]
    pub to: Vec<Person>,
    #[serde(default)]
    pub cc: Vec<Person>,
    #[serde(default)]
    pub bcc: Vec<Person>,
    #[serde(default)]
    pub subject: String,
    /// Leading text of the body
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Ids from the References header
    #[serde(default)]
    pub refs: Vec<MessageId>,
    /// Ids from the In-Reply-To header
    #[serde(default)]
    pub replytos: Vec<MessageId>,
    pub source: SourceId,
    /// Offset of the message inside its source
    #[serde(default)]
    pub source_info: u64,
    #[serde(skip)]
    dirty: bool,
}

impl Message {
    pub fn new(
        id: impl Into<MessageId>,
        date: chrono::DateTime<chrono::Utc>,
        from: Person,
        source: SourceId,
    ) -> Self {
        Self {
            id: id.into(),
            date,
            from,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: String::new(),
            snippet: String::new(),
            labels: BTreeSet::new(),
            refs: Vec::new(),
            replytos: Vec::new(),
            source,
            source_info: 0,
            dirty: false,
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// Add a label, marking the message dirty if it was not already there.
    pub fn add_label(&mut self, label: impl Into<String>) {
        if self.labels.insert(label.into()) {
            self.dirty = true;
        }
    }

    /// Remove a label, marking the message dirty if it was present.
    pub fn remove_label(&mut self, label: &str) {
        if self.labels.remove(label) {
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Every person on the recipient side (to, cc and bcc).
    pub fn recipients(&self) -> impl Iterator<Item = &Person> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    /// Ids this message points at: references followed by reply-tos.
    pub fn referenced_ids(&self) -> impl Iterator<Item = &MessageId> {
        self.refs.iter().chain(self.replytos.iter())
    }
}

/// An ordered conversation, as assembled by the thread model.
#[derive(Debug, Clone, Default)]
pub struct Thread {
    messages: Vec<Message>,
}

impl Thread {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn messages_mut(&mut self) -> &mut [Message] {
        &mut self.messages
    }

    /// Messages carrying label changes not yet handed to the index.
    pub fn dirty_messages_mut(&mut self) -> impl Iterator<Item = &mut Message> {
        self.messages.iter_mut().filter(|m| m.is_dirty())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
