/// Message store: the ordered, de-duplicated feed of the active conversation.
///
/// Newest first. Every path that adds a message goes through one id check, so a
/// server message fetched by the poller and the same message returned by a send can
/// never both land in the feed.
use crate::types::{ConversationId, Message, MessageId, MessageStatus, UserId};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use uuid::Uuid;

const PROVISIONAL_PREFIX: &str = "local";

/// What the user typed, before the store turns it into a provisional message
#[derive(Debug, Clone)]
pub struct OutgoingDraft {
    pub conversation_id: Option<ConversationId>,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    /// Insertion order, used to break `created_at` ties (later insert sorts as newer)
    seq: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    entries: Vec<Entry>,
    next_seq: u64,
}

impl PartialEq for MessageStore {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|(a, b)| a.message == b.message)
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert every message whose id is not already present, then re-sort.
    /// Idempotent and commutative over the resulting set. Returns how many were added.
    pub fn merge<I>(&mut self, batch: I) -> usize
    where
        I: IntoIterator<Item = Message>,
    {
        let mut added = 0;
        for mut message in batch {
            message.status = MessageStatus::Sent;
            if self.insert_if_absent(message, None) {
                added += 1;
            }
        }
        if added > 0 {
            self.sort();
        }
        added
    }

    /// Add a `Sending` message with a fresh provisional id. Returns the inserted message.
    /// Stamped no earlier than just after the newest entry, so it sorts first even when the
    /// server clock runs ahead of this device.
    pub fn insert_optimistic(&mut self, draft: OutgoingDraft) -> Message {
        let mut id = provisional_id();
        while self.contains(&id) {
            id = provisional_id();
        }
        let now = Utc::now();
        let created_at = self
            .entries
            .iter()
            .map(|e| e.message.created_at)
            .max()
            .map(|newest| now.max(newest + ChronoDuration::microseconds(1)))
            .unwrap_or(now);

        let message = Message {
            id,
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            receiver_id: draft.receiver_id,
            content: draft.content,
            created_at,
            status: MessageStatus::Sending,
        };
        self.insert_if_absent(message.clone(), None);
        self.sort();
        message
    }

    /// Replace a provisional entry with its server-confirmed copy. If the poller already
    /// merged the server copy, the provisional entry is simply dropped.
    /// Never adds: when the provisional entry is gone (deleted while sending), nothing
    /// changes and false is returned.
    pub fn reconcile(&mut self, provisional_id: &str, mut confirmed: Message) -> bool {
        let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.message.id == provisional_id && e.message.is_provisional())
        else {
            return false;
        };
        let removed = self.entries.remove(idx);

        confirmed.status = MessageStatus::Sent;
        self.insert_if_absent(confirmed, Some(removed.seq));
        self.sort();
        true
    }

    /// Flip a `Sending` entry to `Failed` in place. Content is untouched so the user can retry.
    pub fn mark_failed(&mut self, provisional_id: &str) -> Option<Message> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.message.id == provisional_id)?;
        if entry.message.status != MessageStatus::Sending {
            return None;
        }
        entry.message.status = MessageStatus::Failed;
        Some(entry.message.clone())
    }

    /// Remove a failed entry so its content can be sent again under a new provisional id
    pub fn take_failed(&mut self, id: &str) -> Option<Message> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.message.id == id && e.message.status == MessageStatus::Failed)?;
        Some(self.entries.remove(idx).message)
    }

    /// Explicit delete. The only way a message leaves the feed.
    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let idx = self.entries.iter().position(|e| e.message.id == id)?;
        Some(self.entries.remove(idx).message)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.entries.iter().map(|e| &e.message).find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.message.id == id)
    }

    pub fn failed(&self) -> Vec<Message> {
        self.entries
            .iter()
            .filter(|e| e.message.status == MessageStatus::Failed)
            .map(|e| e.message.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert_if_absent(&mut self, message: Message, seq: Option<u64>) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        let seq = seq.unwrap_or_else(|| {
            let s = self.next_seq;
            self.next_seq += 1;
            s
        });
        self.entries.push(Entry { message, seq });
        true
    }

    fn sort(&mut self) {
        self.entries.sort_by(|a, b| {
            b.message
                .created_at
                .cmp(&a.message.created_at)
                .then_with(|| b.seq.cmp(&a.seq))
        });
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        let mut seen = HashSet::new();
        for e in &self.entries {
            assert!(seen.insert(e.message.id.clone()), "duplicate id {}", e.message.id);
        }
        for pair in self.entries.windows(2) {
            assert!(pair[0].message.created_at >= pair[1].message.created_at);
        }
    }
}

/// Timestamp plus a 128-bit random token
fn provisional_id() -> MessageId {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{}-{}-{}", PROVISIONAL_PREFIX, nanos, Uuid::new_v4().simple())
}

/// Ids of a snapshot as a set, for comparisons that ignore order
pub fn id_set(messages: &[Message]) -> HashSet<MessageId> {
    messages.iter().map(|m| m.id.clone()).collect()
}
