//! Member presence as seen through the transcript.
//!
//! Every accepted message renews its author's presence. The renewal is
//! anchored on our own clock: a message written after our latest own message
//! proves its author was around when we accepted that own message, so that
//! acceptance time ("known") plus an expiry window is how long we keep the
//! author present. A fully acknowledged closing message marks its author
//! absent on purpose.
//!
//! A message whose author had seen nothing from us has no anchor; it keeps
//! its author present without a deadline until an anchored message arrives.
//! Renewals and absences with an older `known` than the current entry are
//! stale and ignored, so out-of-order acceptance never moves presence back.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use tessera_proto::MemberId;

/// Presence of one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    /// Seen recently enough
    Present {
        /// When the presence lapses without further messages, if anchored
        until: Option<Instant>,
    },
    /// Silent for longer than the expiry window
    Expired,
    /// Announced leaving, and everyone saw it
    Absent,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    known: Option<Instant>,
    until: Option<Instant>,
    absent: bool,
}

/// Presence of every member we heard from.
#[derive(Debug, Clone, Default)]
pub struct Presence {
    entries: BTreeMap<MemberId, Entry>,
}

impl Presence {
    /// No one present.
    pub fn new() -> Self {
        Self::default()
    }

    /// `member` was around at `known`; keep them present for `expire_after`.
    ///
    /// Returns false if the renewal was stale.
    pub fn renew(
        &mut self,
        member: &MemberId,
        known: Option<Instant>,
        expire_after: Duration,
    ) -> bool {
        let until = known.map(|known| known + expire_after);
        match self.entries.get_mut(member) {
            Some(entry) if known < entry.known => false,
            Some(entry) => {
                entry.known = known;
                entry.until = entry.until.max(until);
                entry.absent = false;
                true
            },
            None => {
                self.entries.insert(member.clone(), Entry { known, until, absent: false });
                true
            },
        }
    }

    /// `member` left on purpose, as of `known`.
    ///
    /// Returns false if something newer was already heard from them.
    pub fn absent(&mut self, member: &MemberId, known: Option<Instant>) -> bool {
        match self.entries.get_mut(member) {
            Some(entry) if known < entry.known => false,
            Some(entry) => {
                entry.known = known;
                entry.absent = true;
                true
            },
            None => {
                self.entries.insert(member.clone(), Entry { known, until: known, absent: true });
                true
            },
        }
    }

    /// Presence of `member` at `now`. `None` if never heard from.
    #[must_use]
    pub fn status(&self, member: &MemberId, now: Instant) -> Option<PresenceStatus> {
        let entry = self.entries.get(member)?;
        Some(match entry.until {
            _ if entry.absent => PresenceStatus::Absent,
            Some(until) if now >= until => PresenceStatus::Expired,
            until => PresenceStatus::Present { until },
        })
    }

    /// True if `member` is present at `now`.
    #[must_use]
    pub fn is_present(&self, member: &MemberId, now: Instant) -> bool {
        matches!(self.status(member, now), Some(PresenceStatus::Present { .. }))
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(4);

    #[test]
    fn renewal_expires_after_window() {
        let now = Instant::now();
        let bob = MemberId::from("bob");
        let mut presence = Presence::new();
        assert_eq!(presence.status(&bob, now), None);

        assert!(presence.renew(&bob, Some(now), WINDOW));
        let present = PresenceStatus::Present { until: Some(now + WINDOW) };
        assert_eq!(presence.status(&bob, now), Some(present));
        assert_eq!(presence.status(&bob, now + WINDOW), Some(PresenceStatus::Expired));
    }

    #[test]
    fn unanchored_renewal_has_no_deadline() {
        let now = Instant::now();
        let bob = MemberId::from("bob");
        let mut presence = Presence::new();

        assert!(presence.renew(&bob, None, WINDOW));
        let unbounded = PresenceStatus::Present { until: None };
        assert_eq!(presence.status(&bob, now + WINDOW * 10), Some(unbounded));

        assert!(presence.renew(&bob, Some(now), WINDOW));
        assert!(!presence.renew(&bob, None, WINDOW));
        assert_eq!(presence.status(&bob, now + WINDOW), Some(PresenceStatus::Expired));
    }

    #[test]
    fn stale_renewal_is_ignored() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        let bob = MemberId::from("bob");
        let mut presence = Presence::new();

        presence.renew(&bob, Some(later), WINDOW);
        assert!(!presence.renew(&bob, Some(now), WINDOW * 2));
        let present = PresenceStatus::Present { until: Some(later + WINDOW) };
        assert_eq!(presence.status(&bob, now), Some(present));
    }

    #[test]
    fn absence_sticks_until_newer_renewal() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        let bob = MemberId::from("bob");
        let mut presence = Presence::new();

        presence.renew(&bob, Some(now), WINDOW);
        assert!(presence.absent(&bob, Some(later)));
        assert!(!presence.is_present(&bob, later));
        assert_eq!(presence.status(&bob, later), Some(PresenceStatus::Absent));

        assert!(!presence.renew(&bob, Some(now), WINDOW));
        assert_eq!(presence.status(&bob, later), Some(PresenceStatus::Absent));

        assert!(presence.renew(&bob, Some(later), WINDOW));
        assert!(presence.is_present(&bob, later));
    }
}
