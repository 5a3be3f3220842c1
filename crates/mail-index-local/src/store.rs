use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::ops::Bound;

use mail_index_core::{Message, MessageId, Person};
use tokio::sync::RwLock;

use crate::query::SearchQuery;

/// Position of a message in newest-first order. Ties are broken by id.
pub type DateKey = (Reverse<chrono::DateTime<chrono::Utc>>, MessageId);

fn date_key(message: &Message) -> DateKey {
    (Reverse(message.date), message.id.clone())
}

#[derive(Debug, Default)]
struct StoreState {
    docs: HashMap<MessageId, Message>,
    by_date: BTreeSet<DateKey>,
    /// id -> ids of the messages that reference it
    referrers: HashMap<MessageId, BTreeSet<MessageId>>,
}

impl StoreState {
    fn insert(&mut self, mut message: Message) -> Option<Message> {
        let previous = self.remove(&message.id);
        message.clear_dirty();
        self.by_date.insert(date_key(&message));
        for target in message.referenced_ids() {
            self.referrers
                .entry(target.clone())
                .or_default()
                .insert(message.id.clone());
        }
        self.docs.insert(message.id.clone(), message);
        previous
    }

    fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let message = self.docs.remove(id)?;
        self.by_date.remove(&date_key(&message));
        for target in message.referenced_ids() {
            if let Some(children) = self.referrers.get_mut(target) {
                children.remove(id);
                if children.is_empty() {
                    self.referrers.remove(target);
                }
            }
        }
        Some(message)
    }
}

/// In-memory message store behind the local backends.
///
/// Keeps every message by id, a newest-first ordering for date iteration and a
/// reverse reference map for thread reconstruction. Iteration never holds the
/// lock across yields: callers resume from a [`DateKey`] cursor.
#[derive(Debug, Default)]
pub struct MessageStore {
    state: RwLock<StoreState>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole content of the store.
    pub async fn replace_all(&self, messages: Vec<Message>) {
        let mut fresh = StoreState::default();
        for message in messages {
            fresh.insert(message);
        }
        *self.state.write().await = fresh;
    }

    /// All messages, newest first.
    pub async fn snapshot(&self) -> Vec<Message> {
        let state = self.state.read().await;
        state
            .by_date
            .iter()
            .filter_map(|(_, id)| state.docs.get(id).cloned())
            .collect()
    }

    /// Insert or replace a message. Returns the replaced version.
    pub async fn insert(&self, message: Message) -> Option<Message> {
        self.state.write().await.insert(message)
    }

    /// Copy the labels of `message` onto the stored version.
    ///
    /// Returns false when the message is not stored.
    pub async fn update_labels(&self, message: &Message) -> bool {
        let mut state = self.state.write().await;
        match state.docs.get_mut(&message.id) {
            Some(stored) => {
                stored.labels = message.labels.clone();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: &MessageId) -> Option<Message> {
        self.state.write().await.remove(id)
    }

    pub async fn get(&self, id: &MessageId) -> Option<Message> {
        self.state.read().await.docs.get(id).cloned()
    }

    pub async fn contains(&self, id: &MessageId) -> bool {
        self.state.read().await.docs.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.docs.len()
    }

    /// First message after `cursor` (newest-first order) matching `query`.
    pub async fn next_match_by_date(
        &self,
        cursor: Option<&DateKey>,
        query: &SearchQuery,
    ) -> Option<DateKey> {
        let state = self.state.read().await;
        let lower = match cursor {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        state
            .by_date
            .range((lower, Bound::Unbounded))
            .find(|(_, id)| state.docs.get(id).is_some_and(|m| query.matches(m)))
            .cloned()
    }

    pub async fn count(&self, query: &SearchQuery) -> usize {
        let state = self.state.read().await;
        state.docs.values().filter(|m| query.matches(m)).count()
    }

    /// Ids of the thread containing `seed`, oldest first.
    ///
    /// Follows references in both directions until no new message turns up.
    /// The references carried by `seed` are always followed, so an unstored
    /// seed still finds its thread; only stored messages are returned.
    pub async fn thread_of(&self, seed: &Message) -> Vec<MessageId> {
        let state = self.state.read().await;
        let mut seen: HashSet<MessageId> = HashSet::new();
        let mut queue: VecDeque<MessageId> = VecDeque::new();
        queue.push_back(seed.id.clone());
        queue.extend(seed.referenced_ids().cloned());

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(message) = state.docs.get(&id) {
                queue.extend(message.referenced_ids().filter(|r| !seen.contains(*r)).cloned());
            }
            if let Some(children) = state.referrers.get(&id) {
                queue.extend(children.iter().filter(|c| !seen.contains(*c)).cloned());
            }
        }

        let mut found: Vec<&Message> = seen.iter().filter_map(|id| state.docs.get(id)).collect();
        found.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        found.into_iter().map(|m| m.id.clone()).collect()
    }

    /// Distinct correspondents of `addresses`, most recent first.
    pub async fn contacts(&self, addresses: &[String], limit: Option<usize>) -> Vec<Person> {
        let wanted: HashSet<String> = addresses.iter().map(|a| a.to_ascii_lowercase()).collect();
        let state = self.state.read().await;
        let mut seen = HashSet::new();
        let mut people = Vec::new();

        for (_, id) in &state.by_date {
            let Some(message) = state.docs.get(id) else { continue };
            let candidates: Vec<&Person> = if wanted.contains(&message.from.normalized_email()) {
                message.recipients().collect()
            } else if message
                .recipients()
                .any(|p| wanted.contains(&p.normalized_email()))
            {
                vec![&message.from]
            } else {
                continue;
            };

            for person in candidates {
                let email = person.normalized_email();
                if wanted.contains(&email) || !seen.insert(email) {
                    continue;
                }
                people.push(person.clone());
                if limit.is_some_and(|n| people.len() >= n) {
                    return people;
                }
            }
        }
        people
    }

    /// Rebuild the secondary orderings from the stored messages.
    pub async fn rebuild(&self) -> usize {
        let mut state = self.state.write().await;
        let messages: Vec<Message> = state.docs.drain().map(|(_, m)| m).collect();
        let count = messages.len();
        let mut fresh = StoreState::default();
        for message in messages {
            fresh.insert(message);
        }
        *state = fresh;
        count
    }
}
