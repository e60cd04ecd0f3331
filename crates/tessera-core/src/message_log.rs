//! Application-visible messages across sub-sessions.

use std::collections::HashMap;

use bytes::Bytes;
use tessera_proto::{MemberId, MessageId, SubSessionId};

use crate::message::MessageSet;

/// One accepted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Sub-session the payload was sent in
    pub sub_session: SubSessionId,
    /// Message id
    pub id: MessageId,
    /// Author
    pub author: MemberId,
    /// Parents within the sub-session
    pub parents: MessageSet,
    /// Application data
    pub payload: Bytes,
}

/// Append-only log of accepted payloads, in acceptance order.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: Vec<LogEntry>,
    index: HashMap<MessageId, usize>,
}

impl MessageLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Ids already logged are ignored.
    ///
    /// Returns true if the entry was added.
    pub fn push(&mut self, entry: LogEntry) -> bool {
        if self.index.contains_key(&entry.id) {
            return false;
        }
        self.index.insert(entry.id, self.entries.len());
        self.entries.push(entry);
        true
    }

    /// True if `id` is a logged payload.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    /// Entry for `id`.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&LogEntry> {
        self.index.get(id).and_then(|at| self.entries.get(*at))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing was logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in acceptance order.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}
