//! Greeting (group key agreement) collaborator.
//!
//! A greeting is the multi-packet protocol that establishes a new
//! sub-session: its membership, its id and its key material. The session
//! layer does not know the protocol. It only needs to:
//!
//! - recognise the first ("initial") and last ("final") packet of an
//!   operation, so [`ServerOrder`](crate::server_order::ServerOrder) can
//!   linearize concurrent proposals;
//! - feed accepted packets to the greeting and forward what it wants to send;
//! - collect the outcome once the greeting completes.

use bytes::Bytes;
use tessera_proto::{MemberId, PacketId, SubSessionId};
use thiserror::Error;

use crate::{message::MessageSet, set::MemberSet};

/// Errors reported by greeting collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GreetError {
    /// Packet could not be decoded
    #[error("malformed greeting packet: {0}")]
    Malformed(String),

    /// Packet does not belong to this greeting
    #[error("unexpected greeting packet: {0}")]
    Unexpected(String),

    /// Proposal could not be produced
    #[error("cannot propose greeting: {0}")]
    Proposal(String),
}

/// Ordering metadata carried by every initial packet.
///
/// `prev_pf` and `prev_ch` are the proposer's view of the last accepted
/// operation; [`ServerOrder`](crate::server_order::ServerOrder) accepts the
/// packet only if they match its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreetingMetadata {
    /// Final packet of the previous operation, if any
    pub prev_pf: Option<PacketId>,
    /// Channel membership when the previous operation finished
    pub prev_ch: MemberSet,
    /// Proposer
    pub author: MemberId,
    /// Proposer's transcript frontier in the current sub-session
    pub parents: MessageSet,
}

/// What a membership packet is, as far as ordering is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    /// Starts an operation
    Initial {
        /// Ordering metadata
        metadata: GreetingMetadata,
        /// Proposed membership
        members: MemberSet,
    },
    /// Completes the operation started by `initial`
    Final {
        /// Initial packet of the operation
        initial: PacketId,
    },
}

/// Partially decoded membership-operation packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpPacket {
    /// Digest of the packet
    pub id: PacketId,
    /// Channel-level sender
    pub sender: MemberId,
    /// Initial or final
    pub kind: OpKind,
}

impl OpPacket {
    /// True for initial packets.
    #[must_use]
    pub fn is_initial(&self) -> bool {
        matches!(self.kind, OpKind::Initial { .. })
    }
}

/// A packet a greeting wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreetSend {
    /// Encoded packet
    pub packet: Bytes,
    /// Channel members to send it to
    pub recipients: MemberSet,
}

/// Result of a completed greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreetOutcome<S> {
    /// Id of the new sub-session
    pub sub_session_id: SubSessionId,
    /// Key material of the new sub-session
    pub state: S,
}

/// One running membership operation.
pub trait Greeting {
    /// Key material produced on completion.
    type State;

    /// Initial packet that started this greeting.
    fn initial_id(&self) -> PacketId;

    /// Membership after the operation.
    fn members(&self) -> &MemberSet;

    /// Membership before the operation.
    fn prev_members(&self) -> &MemberSet;

    /// Ordering metadata of the initial packet.
    fn metadata(&self) -> &GreetingMetadata;

    /// True if the metadata was authenticated by the key agreement (not just
    /// claimed by the channel-level sender).
    fn metadata_is_authenticated(&self) -> bool;

    /// Process a packet of this greeting.
    ///
    /// Returns `Ok(None)` if the packet is not part of this greeting,
    /// otherwise the packets to send in response.
    ///
    /// # Errors
    ///
    /// [`GreetError`] if the packet belongs to the greeting but is invalid.
    fn recv(
        &mut self,
        packet: &[u8],
        sender: &MemberId,
    ) -> Result<Option<Vec<GreetSend>>, GreetError>;

    /// Take the outcome once the greeting has completed. Yields at most once.
    fn take_outcome(&mut self) -> Option<GreetOutcome<Self::State>>;
}

/// Factory and codec of greetings.
pub trait Greeter {
    /// Key material of a sub-session.
    type State;
    /// Running greeting type.
    type Greeting: Greeting<State = Self::State>;

    /// Recognise a membership-operation packet without processing it.
    ///
    /// Returns `None` for anything that is not an initial or final packet.
    fn partial_decode(&self, packet: &[u8], sender: &MemberId) -> Option<OpPacket>;

    /// Start a greeting from an accepted initial packet.
    ///
    /// `prev_state` is the key material of the current sub-session, if any.
    ///
    /// # Errors
    ///
    /// [`GreetError`] if the packet cannot start a greeting for `owner`.
    fn decode(
        &mut self,
        owner: &MemberId,
        prev_state: Option<&Self::State>,
        prev_members: &MemberSet,
        packet: &[u8],
        sender: &MemberId,
    ) -> Result<Self::Greeting, GreetError>;

    /// Produce the initial packet of a proposal.
    ///
    /// # Errors
    ///
    /// [`GreetError::Proposal`] if the proposal cannot be made.
    fn encode(
        &mut self,
        prev_state: Option<&Self::State>,
        prev_members: &MemberSet,
        members: &MemberSet,
        metadata: GreetingMetadata,
    ) -> Result<Bytes, GreetError>;
}
