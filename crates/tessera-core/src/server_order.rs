//! Linearization of membership-change proposals.
//!
//! Any member may propose a membership change at any time, so proposals
//! race. The channel server relays every packet to every member in one
//! order; [`ServerOrder`] uses that order to pick a single winner.
//!
//! Each initial packet names the operation it follows through its
//! `(prev_pf, prev_ch)` pointer: the final packet of the previous operation
//! and the channel membership at that time. Only an initial packet whose
//! pointer matches ours starts an operation, and only its own final packet
//! ends it. Every member sees the same packets in the same order, so every
//! member accepts the same sequence.
//!
//! # Invariants
//!
//! - **Single Winner**: of two initial packets carrying the same pointer, at
//!   most one is accepted. The loser stays rejected, since the pointer
//!   advances past it when the winner finishes.
//! - **One Operation**: at most one operation is ongoing.

use tessera_proto::{MemberId, PacketId};
use thiserror::Error;

use crate::{
    greeter::{OpKind, OpPacket},
    set::MemberSet,
};

/// Why a membership packet was not accepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Not synced and the proposal does not include us
    #[error("not synced and not invited")]
    NotInvited,

    /// The packet follows a different operation than the last one we saw
    #[error("stale pointer: expected {expected:?}, got {got:?}")]
    StalePointer {
        /// Our pointer
        expected: Option<PacketId>,
        /// Pointer claimed by the packet
        got: Option<PacketId>,
    },

    /// The packet saw a different channel membership at its pointer
    #[error("channel membership at pointer differs")]
    ChannelMismatch,

    /// Proposed members are not all in the channel
    #[error("proposed members not in channel: {missing}")]
    NotInChannel {
        /// Missing members
        missing: MemberSet,
    },

    /// Another operation is still running
    #[error("operation {ongoing} still ongoing")]
    Ongoing {
        /// Initial packet of the running operation
        ongoing: PacketId,
    },

    /// Final packet of an operation that is not the ongoing one
    #[error("final packet does not match ongoing operation")]
    UnmatchedFinal,
}

/// Errors confirming an adopted pointer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerOrderError {
    /// The authenticated pointer differs from the one adopted while unsynced
    #[error("adopted pointer {adopted:?} but authenticated {authenticated:?}")]
    PointerMismatch {
        /// Pointer adopted from the unauthenticated packet
        adopted: Option<PacketId>,
        /// Pointer authenticated by the greeting
        authenticated: Option<PacketId>,
    },
}

/// Outcome of [`ServerOrder::try_op_packet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpDecision {
    /// The packet started a new operation
    AcceptedInitial {
        /// Initial packet
        packet: PacketId,
        /// Final packet of the operation it follows
        prev_pf: Option<PacketId>,
    },
    /// The packet finished the ongoing operation
    AcceptedFinal {
        /// Final packet
        packet: PacketId,
        /// Initial packet of the finished operation
        prev_pi: PacketId,
    },
    /// The packet does not advance the order
    Rejected(Rejection),
}

#[derive(Debug, Clone)]
struct Ongoing {
    initial: PacketId,
    prev_pf: Option<PacketId>,
    proposer: MemberId,
    members: MemberSet,
}

/// Operation order of one channel connection.
#[derive(Debug, Clone, Default)]
pub struct ServerOrder {
    prev_pf: Option<PacketId>,
    prev_ch: MemberSet,
    synced: bool,
    /// Pointer taken from an unauthenticated initial packet, until confirmed
    adopted: Option<Option<PacketId>>,
    ongoing: Option<Ongoing>,
}

impl ServerOrder {
    /// Create an unsynced order.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once we know the pointer of the channel.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// True while an operation is between its initial and final packet.
    #[must_use]
    pub fn has_ongoing_op(&self) -> bool {
        self.ongoing.is_some()
    }

    /// Initial packet of the ongoing operation.
    #[must_use]
    pub fn ongoing_initial(&self) -> Option<PacketId> {
        self.ongoing.as_ref().map(|ongoing| ongoing.initial)
    }

    /// Proposer of the ongoing operation.
    #[must_use]
    pub fn ongoing_proposer(&self) -> Option<&MemberId> {
        self.ongoing.as_ref().map(|ongoing| &ongoing.proposer)
    }

    /// Membership proposed by the ongoing operation.
    #[must_use]
    pub fn ongoing_members(&self) -> Option<&MemberSet> {
        self.ongoing.as_ref().map(|ongoing| &ongoing.members)
    }

    /// Final packet of the last finished operation.
    #[must_use]
    pub fn prev_pf(&self) -> Option<PacketId> {
        self.prev_pf
    }

    /// Channel membership when the last operation finished.
    #[must_use]
    pub fn prev_ch(&self) -> &MemberSet {
        &self.prev_ch
    }

    /// We are alone in a fresh channel: no operation precedes us.
    pub fn sync_new(&mut self, channel_members: &MemberSet) {
        debug_assert!(!self.synced, "sync_new on a synced order");
        debug_assert_eq!(channel_members.len(), 1, "sync_new requires a channel of one");
        self.prev_pf = None;
        self.prev_ch = channel_members.clone();
        self.synced = true;
        self.adopted = None;
        self.ongoing = None;
    }

    /// Forget everything: the channel connection was lost.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Decide whether `op` advances the order.
    ///
    /// `channel_members` is the channel membership at the time the server
    /// relayed the packet, including us.
    pub fn try_op_packet(
        &mut self,
        owner: &MemberId,
        op: &OpPacket,
        channel_members: &MemberSet,
    ) -> OpDecision {
        match &op.kind {
            OpKind::Initial { metadata, members } => {
                if let Some(ongoing) = &self.ongoing {
                    return OpDecision::Rejected(Rejection::Ongoing { ongoing: ongoing.initial });
                }

                if self.synced {
                    if metadata.prev_pf != self.prev_pf {
                        return OpDecision::Rejected(Rejection::StalePointer {
                            expected: self.prev_pf,
                            got: metadata.prev_pf,
                        });
                    }
                    if metadata.prev_ch != self.prev_ch {
                        return OpDecision::Rejected(Rejection::ChannelMismatch);
                    }
                    let missing = members.subtract(channel_members);
                    if !missing.is_empty() {
                        return OpDecision::Rejected(Rejection::NotInChannel { missing });
                    }
                } else {
                    if !members.contains(owner) {
                        return OpDecision::Rejected(Rejection::NotInvited);
                    }
                    tracing::info!(
                        owner = %owner,
                        packet = %op.id,
                        prev_pf = ?metadata.prev_pf,
                        "synced to operation order from invitation"
                    );
                    self.prev_pf = metadata.prev_pf;
                    self.prev_ch = metadata.prev_ch.clone();
                    self.adopted = Some(metadata.prev_pf);
                    self.synced = true;
                }

                self.ongoing = Some(Ongoing {
                    initial: op.id,
                    prev_pf: metadata.prev_pf,
                    proposer: op.sender.clone(),
                    members: members.clone(),
                });
                OpDecision::AcceptedInitial { packet: op.id, prev_pf: metadata.prev_pf }
            },
            OpKind::Final { initial } => {
                let Some(ongoing) = self.ongoing.take_if(|ongoing| ongoing.initial == *initial)
                else {
                    return OpDecision::Rejected(Rejection::UnmatchedFinal);
                };
                debug_assert_eq!(ongoing.prev_pf, self.prev_pf);
                self.prev_pf = Some(op.id);
                self.prev_ch = channel_members.clone();
                OpDecision::AcceptedFinal { packet: op.id, prev_pi: ongoing.initial }
            },
        }
    }

    /// Confirm the pointer adopted while unsynced, once the greeting has
    /// authenticated the metadata it came with.
    ///
    /// # Errors
    ///
    /// [`ServerOrderError::PointerMismatch`] if the authenticated pointer is
    /// not the adopted one.
    pub fn set_metadata_authenticated(
        &mut self,
        prev_pf: Option<PacketId>,
    ) -> Result<(), ServerOrderError> {
        match self.adopted.take() {
            None => Ok(()),
            Some(adopted) if adopted == prev_pf => Ok(()),
            Some(adopted) => {
                Err(ServerOrderError::PointerMismatch { adopted, authenticated: prev_pf })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{greeter::GreetingMetadata, message::MessageSet};

    fn group(names: &[&str]) -> MemberSet {
        names.iter().map(|name| MemberId::from(*name)).collect()
    }

    fn initial(
        label: &str,
        sender: &str,
        prev_pf: Option<PacketId>,
        prev_ch: &MemberSet,
        members: &[&str],
    ) -> OpPacket {
        OpPacket {
            id: PacketId::digest(label.as_bytes()),
            sender: MemberId::from(sender),
            kind: OpKind::Initial {
                metadata: GreetingMetadata {
                    prev_pf,
                    prev_ch: prev_ch.clone(),
                    author: MemberId::from(sender),
                    parents: MessageSet::new(),
                },
                members: group(members),
            },
        }
    }

    fn final_of(label: &str, sender: &str, initial: &OpPacket) -> OpPacket {
        OpPacket {
            id: PacketId::digest(label.as_bytes()),
            sender: MemberId::from(sender),
            kind: OpKind::Final { initial: initial.id },
        }
    }

    fn synced_alone(owner: &str) -> (ServerOrder, MemberSet) {
        let mut order = ServerOrder::new();
        let alone = group(&[owner]);
        order.sync_new(&alone);
        (order, alone)
    }

    #[test]
    fn exactly_one_of_two_concurrent_proposals_wins() {
        let (mut order, alone) = synced_alone("alice");
        let owner = MemberId::from("alice");
        let channel = group(&["alice", "bob", "carol"]);

        let from_alice = initial("pa", "alice", None, &alone, &["alice", "bob"]);
        let from_bob = initial("pb", "bob", None, &alone, &["alice", "carol"]);

        assert!(matches!(
            order.try_op_packet(&owner, &from_alice, &channel),
            OpDecision::AcceptedInitial { prev_pf: None, .. }
        ));
        assert!(matches!(
            order.try_op_packet(&owner, &from_bob, &channel),
            OpDecision::Rejected(Rejection::Ongoing { .. })
        ));

        let fin = final_of("fa", "alice", &from_alice);
        assert_eq!(
            order.try_op_packet(&owner, &fin, &channel),
            OpDecision::AcceptedFinal { packet: fin.id, prev_pi: from_alice.id }
        );
        assert_eq!(order.prev_pf(), Some(fin.id));
        assert_eq!(order.prev_ch(), &channel);

        // The loser's pointer is now stale.
        assert!(matches!(
            order.try_op_packet(&owner, &from_bob, &channel),
            OpDecision::Rejected(Rejection::StalePointer { .. })
        ));
    }

    #[test]
    fn unmatched_final_is_rejected() {
        let (mut order, alone) = synced_alone("alice");
        let owner = MemberId::from("alice");
        let channel = group(&["alice", "bob"]);

        let op = initial("p", "alice", None, &alone, &["alice", "bob"]);
        let other = initial("q", "bob", None, &alone, &["alice", "bob"]);
        assert_eq!(
            order.try_op_packet(&owner, &final_of("f", "bob", &other), &channel),
            OpDecision::Rejected(Rejection::UnmatchedFinal)
        );
        order.try_op_packet(&owner, &op, &channel);
        assert_eq!(
            order.try_op_packet(&owner, &final_of("f", "bob", &other), &channel),
            OpDecision::Rejected(Rejection::UnmatchedFinal)
        );
        assert!(order.has_ongoing_op());
    }

    #[test]
    fn proposed_members_must_be_in_channel() {
        let (mut order, alone) = synced_alone("alice");
        let owner = MemberId::from("alice");

        let op = initial("p", "alice", None, &alone, &["alice", "dave"]);
        assert_eq!(
            order.try_op_packet(&owner, &op, &group(&["alice", "bob"])),
            OpDecision::Rejected(Rejection::NotInChannel { missing: group(&["dave"]) })
        );
        assert!(!order.has_ongoing_op());
    }

    #[test]
    fn unsynced_member_only_follows_invitations() {
        let mut order = ServerOrder::new();
        let owner = MemberId::from("carol");
        let channel = group(&["alice", "bob", "carol"]);
        let prev = Some(PacketId::digest(b"earlier"));
        let prev_ch = group(&["alice", "bob"]);

        let without_us = initial("p", "alice", prev, &prev_ch, &["alice"]);
        assert_eq!(
            order.try_op_packet(&owner, &without_us, &channel),
            OpDecision::Rejected(Rejection::NotInvited)
        );
        assert!(!order.is_synced());

        let invite = initial("q", "alice", prev, &prev_ch, &["alice", "bob", "carol"]);
        assert!(matches!(
            order.try_op_packet(&owner, &invite, &channel),
            OpDecision::AcceptedInitial { .. }
        ));
        assert!(order.is_synced());
        assert_eq!(order.prev_pf(), prev);
        assert_eq!(order.ongoing_proposer(), Some(&MemberId::from("alice")));

        assert!(order.set_metadata_authenticated(prev).is_ok());
    }

    #[test]
    fn adopted_pointer_must_be_confirmed() {
        let mut order = ServerOrder::new();
        let owner = MemberId::from("carol");
        let channel = group(&["alice", "carol"]);
        let claimed = Some(PacketId::digest(b"claimed"));

        let invite = initial("q", "alice", claimed, &group(&["alice"]), &["alice", "carol"]);
        order.try_op_packet(&owner, &invite, &channel);

        assert_eq!(
            order.set_metadata_authenticated(None),
            Err(ServerOrderError::PointerMismatch { adopted: claimed, authenticated: None })
        );
    }

    #[test]
    fn clear_forgets_the_channel() {
        let (mut order, alone) = synced_alone("alice");
        let op = initial("p", "alice", None, &alone, &["alice"]);
        order.try_op_packet(&MemberId::from("alice"), &op, &alone);

        order.clear();
        assert!(!order.is_synced());
        assert!(!order.has_ongoing_op());
        assert_eq!(order.prev_pf(), None);
    }
}
