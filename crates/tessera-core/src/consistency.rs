//! Per-message full-acknowledgement watchdog.
//!
//! Every accepted message gets a watch. The watch ends when the message is
//! fully acknowledged. Until then it fires at checkpoints planned by flow
//! control:
//!
//! - **Full-ack checkpoints**: back-off checks on the whole group. The last
//!   one is the final deadline; passing it yields
//!   [`MonitorEvent::NotFullyAcked`] once. The watch keeps running, since the
//!   acknowledgements may still arrive.
//! - **Own-ack checkpoints**: for messages by others, checks that *we* have
//!   acknowledged it. If not, [`MonitorEvent::UnackedByOwn`] asks the session
//!   to send an automatic acknowledgement.
//!
//! # Invariants
//!
//! - **Single Completion**: [`MonitorEvent::FullyAcked`] is yielded at most
//!   once per id, and [`ConsistencyMonitor::fully_acked`] reports true at
//!   most once per id
//! - **Watches Mirror Transcript**: a session keeps exactly one watch per
//!   message the transcript reports as not fully acknowledged

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use indexmap::IndexMap;
use tessera_proto::{MemberId, MessageId};

use crate::set::MemberSet;

/// When to check on a newly accepted message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchPlan {
    /// Offsets of the full-ack checkpoints; the last is the final deadline
    pub full_ack: Vec<Duration>,
    /// Offsets at which to check our own acknowledgement
    pub own_ack: Vec<Duration>,
    /// False for messages that need no liveness monitoring (explicit acks)
    pub monitor: bool,
}

/// Output of [`ConsistencyMonitor::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Nobody is left to acknowledge the message; its watch has ended
    FullyAcked(MessageId),
    /// The final deadline passed without full acknowledgement
    NotFullyAcked(MessageId),
    /// We still have not acknowledged a message by somebody else
    UnackedByOwn(MessageId),
}

#[derive(Debug)]
struct Watch {
    full_ack: VecDeque<Instant>,
    own_ack: VecDeque<Instant>,
    warned: bool,
}

impl Watch {
    fn next_deadline(&self) -> Option<Instant> {
        match (self.full_ack.front(), self.own_ack.front()) {
            (Some(a), Some(b)) => Some(*a.min(b)),
            (a, b) => a.or(b).copied(),
        }
    }
}

/// Watchdog over the messages of one sub-session.
#[derive(Debug)]
pub struct ConsistencyMonitor {
    owner: MemberId,
    watches: IndexMap<MessageId, Watch>,
}

impl ConsistencyMonitor {
    /// Create a monitor for `owner`'s view of a sub-session.
    pub fn new(owner: MemberId) -> Self {
        Self { owner, watches: IndexMap::new() }
    }

    /// Start watching `id`, accepted at `now`.
    pub fn expect(&mut self, id: MessageId, now: Instant, plan: WatchPlan) {
        let (full_ack, own_ack) = if plan.monitor {
            (
                plan.full_ack.iter().map(|offset| now + *offset).collect(),
                plan.own_ack.iter().map(|offset| now + *offset).collect(),
            )
        } else {
            (VecDeque::new(), VecDeque::new())
        };
        let previous = self.watches.insert(id, Watch { full_ack, own_ack, warned: false });
        debug_assert!(previous.is_none(), "message {id} watched twice");
    }

    /// Stop watching `id` because it was fully acknowledged.
    ///
    /// Returns true if the watch was active.
    pub fn fully_acked(&mut self, id: &MessageId) -> bool {
        self.watches.shift_remove(id).is_some()
    }

    /// True if `id` is being watched.
    #[must_use]
    pub fn is_watching(&self, id: &MessageId) -> bool {
        self.watches.contains_key(id)
    }

    /// Watched ids, in the order they were accepted.
    pub fn active(&self) -> impl Iterator<Item = &MessageId> {
        self.watches.keys()
    }

    /// Number of active watches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    /// True if nothing is watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Earliest pending checkpoint.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.watches.values().filter_map(Watch::next_deadline).min()
    }

    /// Run every checkpoint due at `now`.
    ///
    /// `unackby` reports who still has to acknowledge a message.
    pub fn tick<F>(&mut self, now: Instant, unackby: F) -> Vec<MonitorEvent>
    where
        F: Fn(&MessageId) -> MemberSet,
    {
        let mut events = Vec::new();
        let mut done = Vec::new();

        for (id, watch) in &mut self.watches {
            let pending = unackby(id);
            if pending.is_empty() {
                done.push(*id);
                events.push(MonitorEvent::FullyAcked(*id));
                continue;
            }

            let mut passed_final = false;
            while watch.full_ack.front().is_some_and(|deadline| *deadline <= now) {
                watch.full_ack.pop_front();
                if watch.full_ack.is_empty() {
                    passed_final = true;
                } else {
                    tracing::debug!(
                        owner = %self.owner,
                        id = %id,
                        unackby = %pending,
                        "message not yet fully acked at checkpoint"
                    );
                }
            }
            if passed_final && !watch.warned {
                watch.warned = true;
                events.push(MonitorEvent::NotFullyAcked(*id));
            }

            let mut own_due = false;
            while watch.own_ack.front().is_some_and(|deadline| *deadline <= now) {
                watch.own_ack.pop_front();
                own_due = true;
            }
            if own_due && pending.contains(&self.owner) {
                events.push(MonitorEvent::UnackedByOwn(*id));
            }
        }

        for id in done {
            self.watches.shift_remove(&id);
        }
        events
    }

    /// Drop every watch.
    pub fn stop(&mut self) {
        self.watches.clear();
    }
}
