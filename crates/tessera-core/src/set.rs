//! Persistent sets of identifiers.
//!
//! Membership flows through almost every part of the session layer: each
//! message claims one, each sub-session fixes one, each membership operation
//! proposes one. [`ImmutableSet`] is the value type for all of them. Clones
//! share storage; every operation returns a new set.
//!
//! # Invariants
//!
//! - **Patch Inverts Diff**: for all sets `a`, `b`:
//!   `a.patch(&a.diff(&b)) == Ok(b)`
//! - **Valid Diffs**: a [`SetDiff`] never adds and removes the same element;
//!   [`ImmutableSet::patch`] rejects one that does

use std::{collections::BTreeSet, fmt, sync::Arc};

use tessera_proto::MemberId;
use thiserror::Error;

/// Set of group members.
pub type MemberSet = ImmutableSet<MemberId>;

/// Errors from set algebra.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SetError {
    /// A diff both adds and removes the same elements
    #[error("conflicting diff: {count} element(s) both added and removed")]
    ConflictingDiff {
        /// Number of elements in `added ∩ removed`
        count: usize,
    },
}

/// Immutable, cheaply clonable ordered set.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImmutableSet<T: Ord> {
    inner: Arc<BTreeSet<T>>,
}

/// Difference between two sets, as returned by [`ImmutableSet::diff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<T: Ord> {
    /// Elements in the newer set only
    pub added: ImmutableSet<T>,
    /// Elements in the older set only
    pub removed: ImmutableSet<T>,
}

impl<T: Ord + Clone> SetDiff<T> {
    /// The empty diff.
    pub fn empty() -> Self {
        Self { added: ImmutableSet::new(), removed: ImmutableSet::new() }
    }

    /// True if the diff changes nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl<T: Ord + Clone> ImmutableSet<T> {
    /// The empty set.
    pub fn new() -> Self {
        Self { inner: Arc::new(BTreeSet::new()) }
    }

    fn from_set(set: BTreeSet<T>) -> Self {
        Self { inner: Arc::new(set) }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True if the set has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, item: &T) -> bool {
        self.inner.contains(item)
    }

    /// Iterate in ascending order.
    pub fn iter(&self) -> std::collections::btree_set::Iter<'_, T> {
        self.inner.iter()
    }

    /// The sole element of a one-element set.
    #[must_use]
    pub fn single(&self) -> Option<&T> {
        if self.inner.len() == 1 { self.inner.first() } else { None }
    }

    /// New set with `item` added.
    #[must_use]
    pub fn with(&self, item: T) -> Self {
        let mut set = (*self.inner).clone();
        set.insert(item);
        Self::from_set(set)
    }

    /// New set with `item` removed.
    #[must_use]
    pub fn without(&self, item: &T) -> Self {
        if !self.contains(item) {
            return self.clone();
        }
        let mut set = (*self.inner).clone();
        set.remove(item);
        Self::from_set(set)
    }

    /// Elements in either set.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self::from_set(self.inner.union(&other.inner).cloned().collect())
    }

    /// Elements in both sets.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        Self::from_set(self.inner.intersection(&other.inner).cloned().collect())
    }

    /// Elements of `self` not in `other`.
    #[must_use]
    pub fn subtract(&self, other: &Self) -> Self {
        Self::from_set(self.inner.difference(&other.inner).cloned().collect())
    }

    /// True if no element is in both sets.
    #[must_use]
    pub fn is_disjoint(&self, other: &Self) -> bool {
        self.inner.is_disjoint(&other.inner)
    }

    /// True if every element of `self` is in `other`.
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.inner.is_subset(&other.inner)
    }

    /// What changed going from `self` to `newer`.
    #[must_use]
    pub fn diff(&self, newer: &Self) -> SetDiff<T> {
        SetDiff { added: newer.subtract(self), removed: self.subtract(newer) }
    }

    /// Apply a diff: `(self ∪ added) − removed`.
    ///
    /// # Errors
    ///
    /// [`SetError::ConflictingDiff`] if the diff adds and removes the same
    /// element.
    pub fn patch(&self, diff: &SetDiff<T>) -> Result<Self, SetError> {
        let conflicts = diff.added.intersect(&diff.removed);
        if !conflicts.is_empty() {
            return Err(SetError::ConflictingDiff { count: conflicts.len() });
        }
        Ok(self.union(&diff.added).subtract(&diff.removed))
    }

    /// Three-way merge: apply the change `parent -> a` on top of `b`.
    ///
    /// # Errors
    ///
    /// Never in practice, since a computed diff cannot conflict; the error is
    /// propagated from [`ImmutableSet::patch`].
    pub fn merge(parent: &Self, a: &Self, b: &Self) -> Result<Self, SetError> {
        b.patch(&parent.diff(a))
    }
}

impl<T: Ord + Clone> Default for ImmutableSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone> FromIterator<T> for ImmutableSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_set(iter.into_iter().collect())
    }
}

impl<'a, T: Ord + Clone> IntoIterator for &'a ImmutableSet<T> {
    type Item = &'a T;
    type IntoIter = std::collections::btree_set::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl<T: Ord + fmt::Debug> fmt::Debug for ImmutableSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.inner.iter()).finish()
    }
}

impl<T: Ord + fmt::Display> fmt::Display for ImmutableSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, item) in self.inner.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", item)?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[u32]) -> ImmutableSet<u32> {
        items.iter().copied().collect()
    }

    #[test]
    fn algebra() {
        let a = set(&[1, 2, 3]);
        let b = set(&[3, 4]);

        assert_eq!(a.union(&b), set(&[1, 2, 3, 4]));
        assert_eq!(a.intersect(&b), set(&[3]));
        assert_eq!(a.subtract(&b), set(&[1, 2]));
        assert!(!a.is_disjoint(&b));
        assert!(set(&[1, 2]).is_subset(&a));
    }

    #[test]
    fn diff_then_patch() {
        let old = set(&[1, 2, 3]);
        let new = set(&[2, 3, 4, 5]);
        let diff = old.diff(&new);

        assert_eq!(diff.added, set(&[4, 5]));
        assert_eq!(diff.removed, set(&[1]));
        assert_eq!(old.patch(&diff).unwrap(), new);
    }

    #[test]
    fn conflicting_diff_is_rejected() {
        let diff = SetDiff { added: set(&[1, 2]), removed: set(&[2]) };
        assert_eq!(set(&[]).patch(&diff), Err(SetError::ConflictingDiff { count: 1 }));
    }

    #[test]
    fn merge_applies_first_change_to_second_child() {
        let parent = set(&[1, 2, 3]);
        let a = set(&[1, 2, 3, 4]); // added 4
        let b = set(&[2, 3, 5]); // removed 1, added 5

        assert_eq!(ImmutableSet::merge(&parent, &a, &b).unwrap(), set(&[2, 3, 4, 5]));
    }

    #[test]
    fn single_and_display() {
        assert_eq!(set(&[7]).single(), Some(&7));
        assert_eq!(set(&[7, 8]).single(), None);
        assert_eq!(set(&[]).single(), None);

        let members: MemberSet = ["bob", "alice"].into_iter().map(MemberId::from).collect();
        assert_eq!(members.to_string(), "{alice, bob}");
    }

    #[test]
    fn clones_share_storage() {
        let a = set(&[1, 2]);
        let b = a.clone();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));

        let c = a.with(3);
        assert_eq!(a, set(&[1, 2]));
        assert_eq!(c, set(&[1, 2, 3]));
    }
}
