//! Channel seam: what the session layer needs from the transport.
//!
//! The channel is an unencrypted broadcast group run by a server. It relays
//! packets to its current members in a single order and tells everyone who
//! enters and leaves. Membership of the channel and membership of the
//! encrypted session are different things; reconciling them is the job of
//! [`HybridSession`](crate::hybrid::HybridSession).

use bytes::Bytes;
use tessera_proto::MemberId;

use crate::set::MemberSet;

/// Input from the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelInput {
    /// A packet relayed by the server
    Packet {
        /// Packet bytes
        packet: Bytes,
        /// Channel-level sender
        sender: MemberId,
    },
    /// We entered the channel, which now has `members` (including us)
    SelfEnter {
        /// Channel membership, including us
        members: MemberSet,
    },
    /// We left the channel, or were kicked
    SelfLeave,
    /// Others entered the channel
    Enter(MemberSet),
    /// Others left the channel
    Leave(MemberSet),
}

/// Request to the channel, returned by the session for the driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    /// Broadcast a packet
    Send {
        /// Packet bytes
        packet: Bytes,
        /// Intended recipients
        recipients: MemberSet,
    },
    /// Ask the server to remove these members from the channel
    Kick(MemberSet),
    /// Leave the channel ourselves
    LeaveSelf,
}
