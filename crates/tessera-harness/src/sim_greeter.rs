//! Simulated greeting: a two-packet membership operation.
//!
//! The proposer broadcasts an initial packet; once the server has relayed it
//! back (so everyone saw it in the same order) the proposer broadcasts the
//! final packet. The new sub-session's id and key derive from the initial
//! packet, so everyone who accepted it ends up with the same sub-session.
//!
//! ```text
//!   proposer                 server                   members
//!      │── Initial ────────────>│── Initial ───────────────>│
//!      │<───────────────────────│                           │
//!      │── Final ──────────────>│── Final ─────────────────>│ complete
//!      │<───────────────────────│ complete                  │
//! ```
//!
//! Packets are `"GRT1"` followed by a CBOR [`GreetPacket`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tessera_core::{
    MemberSet,
    greeter::{
        GreetError, GreetOutcome, GreetSend, Greeter, Greeting, GreetingMetadata, OpKind, OpPacket,
    },
};
use tessera_proto::{MemberId, MessageId, PacketId, SubSessionId};

use crate::sim_security::SimKey;

/// Magic prefix of every simulated greeting packet.
pub const GREET_MAGIC: &[u8; 4] = b"GRT1";

/// Wire form of a greeting packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GreetPacket {
    /// Proposal of a new membership
    Initial {
        /// Final packet of the previous operation
        prev_pf: Option<PacketId>,
        /// Channel membership after the previous operation
        prev_ch: Vec<MemberId>,
        /// Proposer
        author: MemberId,
        /// Proposer's transcript frontier
        parents: Vec<MessageId>,
        /// Membership before the operation
        prev_members: Vec<MemberId>,
        /// Proposed membership
        members: Vec<MemberId>,
    },
    /// Completion of the operation started by `initial`
    Final {
        /// Initial packet id
        initial: PacketId,
    },
}

impl GreetPacket {
    /// Encode with the magic prefix.
    ///
    /// # Errors
    ///
    /// [`GreetError::Proposal`] if CBOR encoding fails.
    pub fn encode(&self) -> Result<Bytes, GreetError> {
        let mut encoded = Vec::new();
        ciborium::ser::into_writer(self, &mut encoded)
            .map_err(|e| GreetError::Proposal(e.to_string()))?;
        let mut out = BytesMut::with_capacity(GREET_MAGIC.len() + encoded.len());
        out.put_slice(GREET_MAGIC);
        out.put_slice(&encoded);
        Ok(out.freeze())
    }

    /// Decode a packet. `Ok(None)` if it is not a greeting packet at all.
    ///
    /// # Errors
    ///
    /// [`GreetError::Malformed`] if it carries the magic but does not decode.
    pub fn decode(packet: &[u8]) -> Result<Option<Self>, GreetError> {
        let Some(encoded) = packet.strip_prefix(GREET_MAGIC.as_slice()) else {
            return Ok(None);
        };
        ciborium::de::from_reader(encoded)
            .map(Some)
            .map_err(|e| GreetError::Malformed(e.to_string()))
    }
}

/// Sub-session id and key of the greeting started by `initial`.
pub fn derive_outcome(initial: PacketId) -> GreetOutcome<SimKey> {
    let mut seed = b"sub-session".to_vec();
    seed.extend_from_slice(initial.as_bytes());
    GreetOutcome {
        sub_session_id: SubSessionId::digest(&seed),
        state: SimKey::derive(initial.as_bytes()),
    }
}

/// Stateless greeter producing [`SimGreeting`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimGreeter;

impl Greeter for SimGreeter {
    type State = SimKey;
    type Greeting = SimGreeting;

    fn partial_decode(&self, packet: &[u8], sender: &MemberId) -> Option<OpPacket> {
        let decoded = match GreetPacket::decode(packet) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return None,
            Err(err) => {
                tracing::debug!(sender = %sender, error = %err, "undecodable greeting packet");
                return None;
            },
        };
        let kind = match decoded {
            GreetPacket::Initial { prev_pf, prev_ch, author, parents, members, .. } => {
                OpKind::Initial {
                    metadata: GreetingMetadata {
                        prev_pf,
                        prev_ch: prev_ch.into_iter().collect(),
                        author,
                        parents: parents.into_iter().collect(),
                    },
                    members: members.into_iter().collect(),
                }
            },
            GreetPacket::Final { initial } => OpKind::Final { initial },
        };
        Some(OpPacket { id: PacketId::digest(packet), sender: sender.clone(), kind })
    }

    fn decode(
        &mut self,
        owner: &MemberId,
        _prev_state: Option<&SimKey>,
        _prev_members: &MemberSet,
        packet: &[u8],
        sender: &MemberId,
    ) -> Result<SimGreeting, GreetError> {
        let Some(GreetPacket::Initial {
            prev_pf,
            prev_ch,
            author,
            parents,
            prev_members,
            members,
        }) = GreetPacket::decode(packet)?
        else {
            return Err(GreetError::Unexpected("not an initial packet".into()));
        };
        if &author != sender {
            return Err(GreetError::Malformed(format!(
                "proposal by {author} relayed from {sender}"
            )));
        }

        Ok(SimGreeting {
            initial: PacketId::digest(packet),
            proposer: &author == owner,
            members: members.into_iter().collect(),
            prev_members: prev_members.into_iter().collect(),
            metadata: GreetingMetadata {
                prev_pf,
                prev_ch: prev_ch.into_iter().collect(),
                author,
                parents: parents.into_iter().collect(),
            },
            outcome: None,
            done: false,
        })
    }

    fn encode(
        &mut self,
        _prev_state: Option<&SimKey>,
        prev_members: &MemberSet,
        members: &MemberSet,
        metadata: GreetingMetadata,
    ) -> Result<Bytes, GreetError> {
        GreetPacket::Initial {
            prev_pf: metadata.prev_pf,
            prev_ch: metadata.prev_ch.iter().cloned().collect(),
            author: metadata.author,
            parents: metadata.parents.iter().copied().collect(),
            prev_members: prev_members.iter().cloned().collect(),
            members: members.iter().cloned().collect(),
        }
        .encode()
    }
}

/// One running simulated greeting.
#[derive(Debug)]
pub struct SimGreeting {
    initial: PacketId,
    proposer: bool,
    members: MemberSet,
    prev_members: MemberSet,
    metadata: GreetingMetadata,
    outcome: Option<GreetOutcome<SimKey>>,
    done: bool,
}

impl Greeting for SimGreeting {
    type State = SimKey;

    fn initial_id(&self) -> PacketId {
        self.initial
    }

    fn members(&self) -> &MemberSet {
        &self.members
    }

    fn prev_members(&self) -> &MemberSet {
        &self.prev_members
    }

    fn metadata(&self) -> &GreetingMetadata {
        &self.metadata
    }

    fn metadata_is_authenticated(&self) -> bool {
        true
    }

    fn recv(
        &mut self,
        packet: &[u8],
        _sender: &MemberId,
    ) -> Result<Option<Vec<GreetSend>>, GreetError> {
        let Some(decoded) = GreetPacket::decode(packet)? else {
            return Ok(None);
        };
        match decoded {
            GreetPacket::Initial { .. } if PacketId::digest(packet) == self.initial => {
                if !self.proposer {
                    return Ok(Some(Vec::new()));
                }
                let packet = GreetPacket::Final { initial: self.initial }.encode()?;
                Ok(Some(vec![GreetSend {
                    packet,
                    recipients: self.members.union(&self.prev_members),
                }]))
            },
            GreetPacket::Final { initial } if initial == self.initial => {
                if self.done {
                    return Err(GreetError::Unexpected("greeting already complete".into()));
                }
                self.done = true;
                self.outcome = Some(derive_outcome(self.initial));
                Ok(Some(Vec::new()))
            },
            _ => Ok(None),
        }
    }

    fn take_outcome(&mut self) -> Option<GreetOutcome<SimKey>> {
        self.outcome.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(names: &[&str]) -> MemberSet {
        names.iter().map(|name| MemberId::from(*name)).collect()
    }

    fn proposal(author: &str) -> Bytes {
        SimGreeter
            .encode(
                None,
                &group(&[author]),
                &group(&[author, "bob"]),
                GreetingMetadata {
                    prev_pf: None,
                    prev_ch: group(&[author]),
                    author: MemberId::from(author),
                    parents: Default::default(),
                },
            )
            .unwrap()
    }

    #[test]
    fn partial_decode_recognises_only_greeting_packets() {
        let packet = proposal("alice");
        let op = SimGreeter.partial_decode(&packet, &MemberId::from("alice")).unwrap();
        assert!(op.is_initial());
        assert_eq!(op.id, PacketId::digest(&packet));

        let alice = MemberId::from("alice");
        assert!(SimGreeter.partial_decode(b"MSG1 something else", &alice).is_none());
        assert!(SimGreeter.partial_decode(b"GRT1 garbage", &alice).is_none());
    }

    #[test]
    fn proposer_finalizes_and_everyone_derives_the_same_outcome() {
        let packet = proposal("alice");
        let alice = MemberId::from("alice");
        let bob = MemberId::from("bob");

        let mut proposer =
            SimGreeter.decode(&alice, None, &group(&["alice"]), &packet, &alice).unwrap();
        let mut joiner = SimGreeter.decode(&bob, None, &group(&["bob"]), &packet, &alice).unwrap();
        assert_eq!(joiner.prev_members(), &group(&["alice"]));

        let sends = proposer.recv(&packet, &alice).unwrap().unwrap();
        assert_eq!(sends.len(), 1);
        assert!(joiner.recv(&packet, &alice).unwrap().unwrap().is_empty());

        let fin = &sends[0].packet;
        let op = SimGreeter.partial_decode(fin, &alice).unwrap();
        assert_eq!(op.kind, OpKind::Final { initial: PacketId::digest(&packet) });

        proposer.recv(fin, &alice).unwrap();
        joiner.recv(fin, &alice).unwrap();
        let a = proposer.take_outcome().unwrap();
        let b = joiner.take_outcome().unwrap();
        assert_eq!(a, b);
        assert!(proposer.take_outcome().is_none());
    }

    #[test]
    fn relayed_proposals_are_rejected() {
        let packet = proposal("alice");
        let bob = MemberId::from("bob");
        let err = SimGreeter
            .decode(&bob, None, &group(&["bob"]), &packet, &MemberId::from("carol"))
            .unwrap_err();
        assert!(matches!(err, GreetError::Malformed(_)));
    }
}
