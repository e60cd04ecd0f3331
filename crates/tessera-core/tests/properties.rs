//! Property-based tests for the building blocks of a sub-session.
//!
//! These tests use proptest to verify invariants hold for all inputs:
//! - Membership diffs compose and merges commute
//! - The trial buffer never grows past capacity and keeps arrival order
//! - A transcript rebuilt from any delivery order matches the sender's

use std::{
    collections::BTreeSet,
    time::{Duration, Instant},
};

use bytes::Bytes;
use proptest::prelude::*;
use tessera_core::{
    message::Message,
    set::{ImmutableSet, SetDiff},
    transcript::Transcript,
    trial_buffer::{DropReason, OverflowPolicy, TrialBuffer, TrialTarget},
    MemberSet,
};
use tessera_proto::{MemberId, MessageBody, MessageId};

const NAMES: [&str; 3] = ["alice", "bob", "carol"];

// Strategy for small sets of small integers, so that sets overlap often
fn small_set() -> impl Strategy<Value = ImmutableSet<u8>> {
    proptest::collection::btree_set(0u8..16, 0..10).prop_map(|items| items.into_iter().collect())
}

#[test]
fn prop_patch_with_diff_reaches_newer() {
    proptest!(|(older in small_set(), newer in small_set())| {
        let diff = older.diff(&newer);
        prop_assert!(diff.added.is_disjoint(&diff.removed));
        prop_assert_eq!(older.patch(&diff).unwrap(), newer);
    });
}

#[test]
fn prop_conflicting_diff_is_rejected() {
    proptest!(|(base in small_set(), shared in 0u8..16)| {
        let diff = SetDiff {
            added: ImmutableSet::new().with(shared),
            removed: ImmutableSet::new().with(shared),
        };
        prop_assert!(base.patch(&diff).is_err());
    });
}

#[test]
fn prop_merge_is_commutative() {
    proptest!(|(parent in small_set(), a in small_set(), b in small_set())| {
        let ab = ImmutableSet::merge(&parent, &a, &b).unwrap();
        let ba = ImmutableSet::merge(&parent, &b, &a).unwrap();
        prop_assert_eq!(ab, ba);
    });
}

/// Target that never accepts anything.
#[derive(Default)]
struct Refuse {
    capacity: usize,
    dropped: Vec<u32>,
}

impl TrialTarget for Refuse {
    type Item = u32;
    type Key = u32;

    fn identity(&self, item: &u32) -> u32 {
        *item
    }

    fn max_capacity(&self) -> usize {
        self.capacity
    }

    fn try_accept(&mut self, _pending: bool, item: u32) -> Result<(), u32> {
        Err(item)
    }

    fn on_drop(&mut self, item: u32, reason: DropReason) {
        assert_eq!(reason, DropReason::Overflow);
        self.dropped.push(item);
    }
}

#[test]
fn prop_trial_buffer_evicts_oldest_first() {
    proptest!(|(capacity in 1usize..8, count in 0u32..32)| {
        let now = Instant::now();
        let mut buffer = TrialBuffer::new("prop", OverflowPolicy::Drop);
        let mut target = Refuse { capacity, ..Refuse::default() };

        for item in 0..count {
            buffer.trial(item, now, &mut target);
            prop_assert!(buffer.len() <= capacity);
        }

        let kept: Vec<u32> = buffer.keys().copied().collect();
        let first_kept = count.saturating_sub(capacity as u32);
        prop_assert_eq!(kept, (first_kept..count).collect::<Vec<_>>());
        prop_assert_eq!(target.dropped, (0..first_kept).collect::<Vec<_>>());
    });
}

/// Transcript fed through a trial buffer, as a sub-session does.
struct Replica {
    transcript: Transcript,
}

impl TrialTarget for Replica {
    type Item = Message;
    type Key = MessageId;

    fn identity(&self, item: &Message) -> MessageId {
        item.id
    }

    fn max_capacity(&self) -> usize {
        usize::MAX
    }

    fn try_accept(&mut self, _pending: bool, item: Message) -> Result<(), Message> {
        match self.transcript.add(item.clone()) {
            Ok(_) => Ok(()),
            Err(err) if err.is_transient() => Err(item),
            Err(err) => panic!("valid history rejected: {err}"),
        }
    }
}

fn group() -> MemberSet {
    NAMES.iter().map(|name| MemberId::from(*name)).collect()
}

/// A conversation where every message replies to everything before it.
fn conversation(authors: &[usize]) -> (Transcript, Vec<Message>) {
    let members = group();
    let mut reference = Transcript::new();
    let mut messages = Vec::new();
    for (index, author) in authors.iter().enumerate() {
        let author = MemberId::from(NAMES[*author]);
        let label = format!("message {index}");
        let message = Message {
            id: MessageId::digest(label.as_bytes()),
            parents: reference.max(),
            recipients: members.without(&author),
            author,
            body: MessageBody::Payload(Bytes::from(label)),
        };
        reference.add(message.clone()).expect("linear history is valid");
        messages.push(message);
    }
    (reference, messages)
}

// Strategy for a list of authors and a delivery order of the same length
fn history() -> impl Strategy<Value = (Vec<usize>, Vec<usize>)> {
    (1usize..24).prop_flat_map(|len| {
        (
            proptest::collection::vec(0usize..NAMES.len(), len),
            Just((0..len).collect::<Vec<_>>()).prop_shuffle(),
        )
    })
}

#[test]
fn prop_any_delivery_order_rebuilds_the_transcript() {
    proptest!(|((authors, order) in history())| {
        let (reference, messages) = conversation(&authors);
        let now = Instant::now();
        let mut buffer = TrialBuffer::new("accept", OverflowPolicy::Drop);
        let mut replica = Replica { transcript: Transcript::new() };

        for index in order {
            buffer.trial(messages[index].clone(), now, &mut replica);
        }

        prop_assert!(buffer.is_empty());
        prop_assert_eq!(replica.transcript.len(), reference.len());
        prop_assert_eq!(replica.transcript.max(), reference.max());

        let unacked: BTreeSet<_> = replica.transcript.unacked().copied().collect();
        let expected: BTreeSet<_> = reference.unacked().copied().collect();
        prop_assert_eq!(unacked, expected);
    });
}

#[test]
fn prop_missing_parents_expire_together() {
    proptest!(|(authors in proptest::collection::vec(0usize..NAMES.len(), 2..12))| {
        let (_, messages) = conversation(&authors);
        let start = Instant::now();
        let ttl = Duration::from_secs(1);
        let mut buffer = TrialBuffer::new("accept", OverflowPolicy::Drop);
        let mut replica = Replica { transcript: Transcript::new() };

        // Everything but the first message waits for it.
        for message in &messages[1..] {
            buffer.trial(message.clone(), start, &mut replica);
        }
        prop_assert_eq!(buffer.len(), messages.len() - 1);
        prop_assert_eq!(buffer.next_expiry(ttl), Some(start + ttl));

        let expired = buffer.expire(start + ttl, ttl, &mut replica);
        prop_assert_eq!(expired.len(), messages.len() - 1);
        prop_assert!(replica.transcript.is_empty());
    });
}
