//! Retry buffer for input that cannot be processed yet.
//!
//! Ciphertext reaches us in whatever order the channel delivers it. A message
//! whose parents have not arrived cannot enter the transcript; a packet for a
//! sub-session whose key we do not have yet cannot be decrypted. Rather than
//! dropping such input, the caller hands it to a [`TrialBuffer`], which keeps
//! it and tries again every time some other item is accepted.
//!
//! # Architecture
//!
//! The buffer owns the pending items; the caller owns the acceptance logic,
//! supplied per call as a [`TrialTarget`]. Passing the target per call (rather
//! than storing it) lets a session keep the buffer as a field and still lend
//! itself out as the target.
//!
//! # Invariants
//!
//! - **Arrival Order**: items are retried and evicted oldest first. Storage is
//!   a single insertion-ordered map, so order and lookup cannot disagree.
//! - **No Silent Loss**: every item that leaves the buffer without being
//!   accepted is handed to [`TrialTarget::on_drop`], which owns its clean-up
//!   (for example destroying a pending decryption secret).

use std::{
    fmt::Debug,
    hash::Hash,
    time::{Duration, Instant},
};

use indexmap::IndexMap;

/// Why an item left the buffer without being accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Evicted because the buffer was over capacity
    Overflow,
    /// Buffered for longer than the time-to-live
    Expired,
    /// Buffer was cleared because its owner shut down
    Cleared,
}

/// What to do when the buffer grows past [`TrialTarget::max_capacity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest item
    #[default]
    Drop,
    /// Keep everything, only log that we are over capacity
    Warn,
}

/// Acceptance logic for the items of a [`TrialBuffer`].
pub trait TrialTarget {
    /// Buffered item type.
    type Item;
    /// Identity used to recognise re-deliveries of the same item.
    type Key: Hash + Eq + Clone + Debug;

    /// Identity of `item`.
    fn identity(&self, item: &Self::Item) -> Self::Key;

    /// Expected maximum number of buffered items.
    fn max_capacity(&self) -> usize;

    /// Try to process `item`. Return it back on failure so it can be stashed.
    ///
    /// `pending` is true if the item was already in the buffer when it was
    /// delivered again. False does not mean it was never seen: it may have
    /// been dropped since.
    fn try_accept(&mut self, pending: bool, item: Self::Item) -> Result<(), Self::Item>;

    /// Clean up an item that leaves the buffer without being accepted.
    fn on_drop(&mut self, _item: Self::Item, _reason: DropReason) {}
}

#[derive(Debug)]
struct Stashed<T> {
    item: T,
    since: Instant,
}

/// Buffer of items awaiting acceptance, in arrival order.
#[derive(Debug)]
pub struct TrialBuffer<K, T> {
    label: &'static str,
    policy: OverflowPolicy,
    items: IndexMap<K, Stashed<T>>,
}

impl<K: Hash + Eq + Clone + Debug, T> TrialBuffer<K, T> {
    /// Create an empty buffer. `label` names it in logs.
    pub fn new(label: &'static str, policy: OverflowPolicy) -> Self {
        Self { label, policy, items: IndexMap::new() }
    }

    /// Number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True if an item with this identity is buffered.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.items.contains_key(key)
    }

    /// Identities of buffered items, oldest first.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.items.keys()
    }

    /// Try to accept `item`, stashing it on failure.
    ///
    /// On success every stashed item is retried until a full pass accepts
    /// nothing more. Returns whether `item` itself was accepted.
    pub fn trial<G>(&mut self, item: T, now: Instant, target: &mut G) -> bool
    where
        G: TrialTarget<Item = T, Key = K>,
    {
        let key = target.identity(&item);
        let previous = self.items.shift_remove(&key);
        let pending = previous.is_some();
        let since = previous.map_or(now, |stashed| stashed.since);

        match target.try_accept(pending, item) {
            Ok(()) => {
                self.sweep(target);
                true
            },
            Err(item) => {
                tracing::debug!(
                    buffer = self.label,
                    key = ?key,
                    pending,
                    size = self.items.len() + 1,
                    "stashed item"
                );
                self.items.insert(key, Stashed { item, since });
                self.enforce_capacity(target);
                false
            },
        }
    }

    /// Retry every stashed item once the target may accept more than
    /// before. Returns whether anything was accepted.
    pub fn retry<G>(&mut self, target: &mut G) -> bool
    where
        G: TrialTarget<Item = T, Key = K>,
    {
        self.sweep(target)
    }

    fn sweep<G>(&mut self, target: &mut G) -> bool
    where
        G: TrialTarget<Item = T, Key = K>,
    {
        let mut accepted = false;
        loop {
            let mut progress = false;
            let mut index = 0;
            while index < self.items.len() {
                let Some((key, stashed)) = self.items.shift_remove_index(index) else {
                    break;
                };
                match target.try_accept(false, stashed.item) {
                    Ok(()) => {
                        tracing::debug!(buffer = self.label, key = ?key, "unstashed item");
                        progress = true;
                    },
                    Err(item) => {
                        self.items.shift_insert(index, key, Stashed { item, since: stashed.since });
                        index += 1;
                    },
                }
            }
            if !progress {
                break;
            }
            accepted = true;
        }
        accepted
    }

    fn enforce_capacity<G>(&mut self, target: &mut G)
    where
        G: TrialTarget<Item = T, Key = K>,
    {
        let max = target.max_capacity();
        if self.items.len() <= max {
            return;
        }

        match self.policy {
            OverflowPolicy::Drop => {
                while self.items.len() > max {
                    let Some((key, stashed)) = self.items.shift_remove_index(0) else {
                        break;
                    };
                    tracing::warn!(
                        buffer = self.label,
                        key = ?key,
                        max,
                        "dropped oldest item over capacity, potential data loss"
                    );
                    target.on_drop(stashed.item, DropReason::Overflow);
                }
            },
            OverflowPolicy::Warn => {
                tracing::info!(
                    buffer = self.label,
                    over = self.items.len() - max,
                    "buffer over expected capacity"
                );
            },
        }
    }

    /// Remove items buffered for longer than `ttl`, oldest first.
    ///
    /// Each expired item is passed to [`TrialTarget::on_drop`]; their
    /// identities are returned.
    pub fn expire<G>(&mut self, now: Instant, ttl: Duration, target: &mut G) -> Vec<K>
    where
        G: TrialTarget<Item = T, Key = K>,
    {
        let mut expired = Vec::new();
        let mut index = 0;
        while index < self.items.len() {
            let is_expired = self
                .items
                .get_index(index)
                .is_some_and(|(_, stashed)| now.saturating_duration_since(stashed.since) >= ttl);
            if !is_expired {
                index += 1;
                continue;
            }
            if let Some((key, stashed)) = self.items.shift_remove_index(index) {
                tracing::debug!(buffer = self.label, key = ?key, "buffered item expired");
                target.on_drop(stashed.item, DropReason::Expired);
                expired.push(key);
            }
        }
        expired
    }

    /// Earliest time at which [`TrialBuffer::expire`] would remove something.
    #[must_use]
    pub fn next_expiry(&self, ttl: Duration) -> Option<Instant> {
        self.items.values().map(|stashed| stashed.since + ttl).min()
    }

    /// Drop every item, handing each to [`TrialTarget::on_drop`].
    pub fn clear<G>(&mut self, target: &mut G)
    where
        G: TrialTarget<Item = T, Key = K>,
    {
        for (_, stashed) in self.items.drain(..) {
            target.on_drop(stashed.item, DropReason::Cleared);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    /// Accepts `n` once `n - 1` has been accepted (0 is always accepted).
    #[derive(Default)]
    struct Sequence {
        accepted: Vec<u32>,
        dropped: Vec<(u32, DropReason)>,
        capacity: usize,
    }

    impl TrialTarget for Sequence {
        type Item = u32;
        type Key = u32;

        fn identity(&self, item: &u32) -> u32 {
            *item
        }

        fn max_capacity(&self) -> usize {
            self.capacity
        }

        fn try_accept(&mut self, _pending: bool, item: u32) -> Result<(), u32> {
            let ready = item == 0 || self.accepted.contains(&(item - 1));
            if ready {
                self.accepted.push(item);
                Ok(())
            } else {
                Err(item)
            }
        }

        fn on_drop(&mut self, item: u32, reason: DropReason) {
            self.dropped.push((item, reason));
        }
    }

    fn target(capacity: usize) -> Sequence {
        Sequence { capacity, ..Default::default() }
    }

    #[test]
    fn out_of_order_items_are_released_by_success() {
        let now = Instant::now();
        let mut buffer = TrialBuffer::new("test", OverflowPolicy::Drop);
        let mut seq = target(16);

        assert!(!buffer.trial(3, now, &mut seq));
        assert!(!buffer.trial(1, now, &mut seq));
        assert!(!buffer.trial(2, now, &mut seq));
        assert_eq!(buffer.len(), 3);

        assert!(buffer.trial(0, now, &mut seq));
        assert!(buffer.is_empty());
        assert_eq!(seq.accepted, vec![0, 1, 2, 3]);
    }

    #[test]
    fn redelivery_is_pending_and_keeps_one_copy() {
        struct Pending(Vec<bool>);
        impl TrialTarget for Pending {
            type Item = u32;
            type Key = u32;
            fn identity(&self, item: &u32) -> u32 {
                *item
            }
            fn max_capacity(&self) -> usize {
                8
            }
            fn try_accept(&mut self, pending: bool, item: u32) -> Result<(), u32> {
                self.0.push(pending);
                Err(item)
            }
        }

        let now = Instant::now();
        let mut buffer = TrialBuffer::new("test", OverflowPolicy::Drop);
        let mut target = Pending(Vec::new());

        buffer.trial(5, now, &mut target);
        buffer.trial(5, now, &mut target);

        assert_eq!(target.0, vec![false, true]);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn overflow_evicts_oldest_under_drop_policy() {
        let now = Instant::now();
        let mut buffer = TrialBuffer::new("test", OverflowPolicy::Drop);
        let mut seq = target(2);

        for item in [5, 6, 7] {
            buffer.trial(item, now, &mut seq);
        }

        assert_eq!(buffer.keys().copied().collect::<Vec<_>>(), vec![6, 7]);
        assert_eq!(seq.dropped, vec![(5, DropReason::Overflow)]);
    }

    #[test]
    fn overflow_is_kept_under_warn_policy() {
        let now = Instant::now();
        let mut buffer = TrialBuffer::new("test", OverflowPolicy::Warn);
        let mut seq = target(2);

        for item in [5, 6, 7] {
            buffer.trial(item, now, &mut seq);
        }

        assert_eq!(buffer.len(), 3);
        assert!(seq.dropped.is_empty());
    }

    #[test]
    fn expiry_uses_first_stash_time() {
        let start = Instant::now();
        let ttl = Duration::from_secs(2);
        let mut buffer = TrialBuffer::new("test", OverflowPolicy::Drop);
        let mut seq = target(16);

        buffer.trial(4, start, &mut seq);
        buffer.trial(9, start + Duration::from_secs(1), &mut seq);
        // Redelivery does not refresh the stash time.
        buffer.trial(4, start + Duration::from_secs(1), &mut seq);

        assert_eq!(buffer.next_expiry(ttl), Some(start + ttl));
        assert!(buffer.expire(start + Duration::from_millis(1999), ttl, &mut seq).is_empty());
        assert_eq!(buffer.expire(start + ttl, ttl, &mut seq), vec![4]);
        assert_eq!(seq.dropped, vec![(4, DropReason::Expired)]);
        assert_eq!(buffer.next_expiry(ttl), Some(start + Duration::from_secs(3)));
    }

    #[test]
    fn clear_hands_everything_to_on_drop() {
        let now = Instant::now();
        let mut buffer = TrialBuffer::new("test", OverflowPolicy::Drop);
        let mut seq = target(16);

        buffer.trial(2, now, &mut seq);
        buffer.trial(3, now, &mut seq);
        buffer.clear(&mut seq);

        assert!(buffer.is_empty());
        let dropped: BTreeSet<u32> = seq.dropped.iter().map(|(item, _)| *item).collect();
        assert_eq!(dropped, BTreeSet::from([2, 3]));
        assert!(seq.dropped.iter().all(|(_, reason)| *reason == DropReason::Cleared));
    }
}
