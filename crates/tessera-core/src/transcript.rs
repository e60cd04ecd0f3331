//! Causally ordered transcript of a sub-session.
//!
//! Every message names as parents the latest messages its author had seen.
//! The transcript is the resulting DAG. From it we derive acknowledgement: a
//! member has acknowledged a message once it has authored a descendant of it,
//! and a message is *fully acknowledged* once every recipient has.
//!
//! # Architecture
//!
//! Acknowledgement is tracked incrementally. When a message by `a` is added,
//! we walk its ancestry and remove `a` from the remaining-unackers of every
//! ancestor, stopping at messages `a` had already acknowledged (their
//! ancestors are acknowledged too) and at `a`'s own messages. Each message is
//! therefore visited at most once per member over the transcript's lifetime.
//!
//! # Invariants
//!
//! - **Causal Closure**: a message enters only after all its parents
//! - **Acyclic**: follows from causal closure and content-derived ids
//! - **Author Chain**: an author's messages are totally ordered by ancestry,
//!   so "the latest message by X before M" is always well defined
//! - **Fixed Membership**: every message claims the same membership as its
//!   parents
//! - **Monotonic**: messages are never removed

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use indexmap::IndexMap;
use tessera_proto::{MemberId, MessageId};
use thiserror::Error;

use crate::{
    message::{Message, MessageSet},
    set::MemberSet,
};

/// Reasons a message cannot be added to the transcript.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranscriptError {
    /// Some parents are not in the transcript yet
    #[error("message {id} is missing {} parent(s)", missing.len())]
    CausalGap {
        /// Message being added
        id: MessageId,
        /// Parents not in the transcript
        missing: Vec<MessageId>,
    },

    /// Message is already in the transcript
    #[error("duplicate message {id}")]
    Duplicate {
        /// Message being added
        id: MessageId,
    },

    /// Author is a recipient, or claimed membership differs from a parent's
    #[error("message {id} has inconsistent membership: {reason}")]
    MembershipMismatch {
        /// Message being added
        id: MessageId,
        /// What was inconsistent
        reason: String,
    },

    /// The author's previous message is not an ancestor
    #[error("message {id} by {author} does not follow the author's previous message")]
    AuthorOrder {
        /// Message being added
        id: MessageId,
        /// Its author
        author: MemberId,
    },
}

impl TranscriptError {
    /// Returns true if the message may become acceptable later.
    ///
    /// Only a causal gap can be closed by future input; everything else means
    /// the message is malformed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CausalGap { .. })
    }
}

#[derive(Debug)]
struct Entry {
    message: Message,
    /// Position in insertion order
    seq: usize,
    /// Position in the author's chain
    author_seq: usize,
    /// Latest message by each member at or before this one
    latest_by: BTreeMap<MemberId, MessageId>,
    /// First message by each member after this one
    suc_by: BTreeMap<MemberId, MessageId>,
    children: BTreeSet<MessageId>,
}

/// Append-only causal message DAG with acknowledgement tracking.
#[derive(Debug, Default)]
pub struct Transcript {
    entries: HashMap<MessageId, Entry>,
    order: Vec<MessageId>,
    frontier: BTreeSet<MessageId>,
    /// Not fully acknowledged messages and who still has to acknowledge them
    unacked: IndexMap<MessageId, BTreeSet<MemberId>>,
    last_by_author: HashMap<MemberId, MessageId>,
}

impl Transcript {
    /// Empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True if no message was added yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// True if `id` is in the transcript.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    /// Message by id.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.entries.get(id).map(|entry| &entry.message)
    }

    /// Message ids in insertion order (a topological order).
    pub fn ids(&self) -> impl Iterator<Item = &MessageId> {
        self.order.iter()
    }

    /// Parents of `id`.
    #[must_use]
    pub fn parents(&self, id: &MessageId) -> Option<&MessageSet> {
        self.get(id).map(|message| &message.parents)
    }

    /// Messages that name `id` as a parent.
    pub fn children(&self, id: &MessageId) -> impl Iterator<Item = &MessageId> {
        self.entries.get(id).into_iter().flat_map(|entry| entry.children.iter())
    }

    /// The frontier: messages with no children yet.
    ///
    /// New messages use the frontier as their parents.
    #[must_use]
    pub fn max(&self) -> MessageSet {
        self.frontier.iter().copied().collect()
    }

    /// Messages not yet fully acknowledged, in insertion order.
    pub fn unacked(&self) -> impl Iterator<Item = &MessageId> {
        self.unacked.keys()
    }

    /// Number of messages not yet fully acknowledged.
    #[must_use]
    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// Recipients of `id` that have not acknowledged it yet.
    ///
    /// Empty for fully acknowledged messages and for unknown ids.
    #[must_use]
    pub fn unackby(&self, id: &MessageId) -> MemberSet {
        self.unacked.get(id).map(|members| members.iter().cloned().collect()).unwrap_or_default()
    }

    /// True if every recipient has acknowledged `id`.
    #[must_use]
    pub fn is_fully_acked(&self, id: &MessageId) -> bool {
        self.contains(id) && !self.unacked.contains_key(id)
    }

    /// Position of `id` within its author's messages, starting at 0.
    #[must_use]
    pub fn author_seq(&self, id: &MessageId) -> Option<usize> {
        self.entries.get(id).map(|entry| entry.author_seq)
    }

    /// Latest message by `member` at or before `id`.
    #[must_use]
    pub fn pre_ruid(&self, id: &MessageId, member: &MemberId) -> Option<MessageId> {
        self.entries.get(id).and_then(|entry| entry.latest_by.get(member).copied())
    }

    /// First message by `member` that has `id` as an ancestor.
    #[must_use]
    pub fn suc_ruid(&self, id: &MessageId, member: &MemberId) -> Option<MessageId> {
        self.entries.get(id).and_then(|entry| entry.suc_by.get(member).copied())
    }

    /// Latest message by `member` at or before any of `parents`.
    ///
    /// Unknown parents are ignored.
    #[must_use]
    pub fn latest_by_in(&self, parents: &MessageSet, member: &MemberId) -> Option<MessageId> {
        parents
            .iter()
            .filter_map(|parent| self.pre_ruid(parent, member))
            .max_by_key(|id| self.author_seq(id))
    }

    /// Latest message by `member` anywhere in the transcript.
    #[must_use]
    pub fn last_by(&self, member: &MemberId) -> Option<MessageId> {
        self.last_by_author.get(member).copied()
    }

    /// True if `ancestor` is `id` or one of its ancestors.
    #[must_use]
    pub fn is_ancestor(&self, ancestor: &MessageId, id: &MessageId) -> bool {
        let (Some(target), Some(entry)) = (self.entries.get(ancestor), self.entries.get(id)) else {
            return false;
        };
        let author = &target.message.author;
        // Ancestry of an author's message is exactly "that author's latest
        // message at or before id is at or after it".
        match entry.latest_by.get(author).and_then(|latest| self.author_seq(latest)) {
            Some(seq) => seq >= target.author_seq,
            None => false,
        }
    }

    /// Add a message whose parents are all present.
    ///
    /// Returns the ids that became fully acknowledged by this message, in
    /// insertion order. A message with no recipients is fully acknowledged
    /// as soon as it is added.
    ///
    /// # Errors
    ///
    /// See [`TranscriptError`]. On error the transcript is unchanged.
    pub fn add(&mut self, message: Message) -> Result<Vec<MessageId>, TranscriptError> {
        let id = message.id;
        self.validate(&message)?;

        let author = message.author.clone();
        let author_seq = match self.last_by_author.get(&author) {
            Some(prev) => self.author_seq(prev).map_or(0, |seq| seq + 1),
            None => 0,
        };

        let mut latest_by: BTreeMap<MemberId, MessageId> = BTreeMap::new();
        for parent in &message.parents {
            let Some(entry) = self.entries.get(parent) else { continue };
            for (member, candidate) in &entry.latest_by {
                let newer = match latest_by.get(member) {
                    Some(current) => self.author_seq(candidate) > self.author_seq(current),
                    None => true,
                };
                if newer {
                    latest_by.insert(member.clone(), *candidate);
                }
            }
        }
        latest_by.insert(author.clone(), id);

        let mut fully_acked = self.acknowledge_ancestry(&message);

        for parent in &message.parents {
            if let Some(entry) = self.entries.get_mut(parent) {
                entry.children.insert(id);
            }
            self.frontier.remove(parent);
        }
        self.frontier.insert(id);

        if let Some(prev) = self.last_by_author.insert(author.clone(), id) {
            if let Some(entry) = self.entries.get_mut(&prev) {
                entry.suc_by.entry(author.clone()).or_insert(id);
            }
        }

        if message.recipients.is_empty() {
            fully_acked.push(id);
        } else {
            self.unacked.insert(id, message.recipients.iter().cloned().collect());
        }

        let seq = self.order.len();
        self.order.push(id);
        self.entries.insert(
            id,
            Entry {
                message,
                seq,
                author_seq,
                latest_by,
                suc_by: BTreeMap::new(),
                children: BTreeSet::new(),
            },
        );

        fully_acked.sort_by_key(|acked| self.entries.get(acked).map_or(usize::MAX, |e| e.seq));

        debug_assert!(!self.frontier.is_empty());
        debug_assert!(self.unacked.keys().all(|unacked| self.entries.contains_key(unacked)));

        Ok(fully_acked)
    }

    fn validate(&self, message: &Message) -> Result<(), TranscriptError> {
        let id = message.id;
        if self.contains(&id) {
            return Err(TranscriptError::Duplicate { id });
        }

        let missing: Vec<MessageId> =
            message.parents.iter().filter(|parent| !self.contains(parent)).copied().collect();
        if !missing.is_empty() {
            return Err(TranscriptError::CausalGap { id, missing });
        }

        if message.recipients.contains(&message.author) {
            return Err(TranscriptError::MembershipMismatch {
                id,
                reason: format!("author {} is also a recipient", message.author),
            });
        }

        let members = message.members();
        for parent in &message.parents {
            if let Some(parent_msg) = self.get(parent) {
                if parent_msg.members() != members {
                    return Err(TranscriptError::MembershipMismatch {
                        id,
                        reason: format!(
                            "claims {} but parent {} claims {}",
                            members,
                            parent,
                            parent_msg.members()
                        ),
                    });
                }
            }
        }

        let expected = self.last_by_author.get(&message.author).copied();
        let found = self.latest_by_in(&message.parents, &message.author);
        if expected != found {
            return Err(TranscriptError::AuthorOrder { id, author: message.author.clone() });
        }

        Ok(())
    }

    /// Remove the author from the unackers of every ancestor it had not
    /// acknowledged yet. Returns ids that became fully acknowledged.
    fn acknowledge_ancestry(&mut self, message: &Message) -> Vec<MessageId> {
        let author = &message.author;
        let mut fully_acked = Vec::new();
        let mut seen: BTreeSet<MessageId> = BTreeSet::new();
        let mut queue: VecDeque<MessageId> = message.parents.iter().copied().collect();

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            let Some(entry) = self.entries.get_mut(&current) else { continue };
            if &entry.message.author == author {
                continue;
            }
            let Some(remaining) = self.unacked.get_mut(&current) else { continue };
            if !remaining.remove(author) {
                continue;
            }

            entry.suc_by.entry(author.clone()).or_insert(message.id);
            queue.extend(entry.message.parents.iter().copied());

            if remaining.is_empty() {
                self.unacked.shift_remove(&current);
                fully_acked.push(current);
            }
        }

        fully_acked
    }
}
