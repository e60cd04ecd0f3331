//! Simulated channel server.
//!
//! The server owns channel membership and relays every packet to every
//! current member, the sender included, in one global order. Deliveries take
//! a fixed latency. A held member stops receiving until released; its
//! deliveries queue up in order, as behind a slow link.

use std::{
    collections::{BTreeSet, VecDeque},
    time::{Duration, Instant},
};

use tessera_core::{
    MemberSet,
    channel::{ChannelAction, ChannelInput},
};
use tessera_proto::MemberId;

#[derive(Debug)]
struct Delivery {
    at: Instant,
    to: MemberId,
    input: ChannelInput,
}

/// Channel server with FIFO broadcast.
#[derive(Debug)]
pub struct SimServer {
    latency: Duration,
    channel: BTreeSet<MemberId>,
    held: BTreeSet<MemberId>,
    queue: VecDeque<Delivery>,
    relayed: usize,
}

impl SimServer {
    /// Create an empty channel whose deliveries take `latency`.
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            channel: BTreeSet::new(),
            held: BTreeSet::new(),
            queue: VecDeque::new(),
            relayed: 0,
        }
    }

    /// Current channel membership.
    pub fn members(&self) -> MemberSet {
        self.channel.iter().cloned().collect()
    }

    /// Number of packets relayed so far.
    pub fn relayed(&self) -> usize {
        self.relayed
    }

    /// True if nothing is waiting for delivery.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    fn push(&mut self, to: MemberId, input: ChannelInput, now: Instant) {
        self.queue.push_back(Delivery { at: now + self.latency, to, input });
    }

    /// Add `member` to the channel.
    pub fn enter(&mut self, member: MemberId, now: Instant) {
        if !self.channel.insert(member.clone()) {
            return;
        }
        tracing::debug!(member = %member, "entered channel");
        let members = self.members();
        for other in members.without(&member).iter() {
            let entered = MemberSet::new().with(member.clone());
            self.push(other.clone(), ChannelInput::Enter(entered), now);
        }
        self.push(member, ChannelInput::SelfEnter { members }, now);
    }

    /// Remove `member` from the channel.
    pub fn leave(&mut self, member: &MemberId, now: Instant) {
        if !self.channel.remove(member) {
            return;
        }
        tracing::debug!(member = %member, "left channel");
        self.push(member.clone(), ChannelInput::SelfLeave, now);
        for other in self.members().iter() {
            let left = MemberSet::new().with(member.clone());
            self.push(other.clone(), ChannelInput::Leave(left), now);
        }
    }

    /// Execute a channel request made by `from`.
    pub fn submit(&mut self, from: &MemberId, action: ChannelAction, now: Instant) {
        match action {
            ChannelAction::Send { packet, .. } => {
                if !self.channel.contains(from) {
                    tracing::debug!(sender = %from, "dropped packet from outside the channel");
                    return;
                }
                self.relayed += 1;
                for member in self.members().iter() {
                    self.push(
                        member.clone(),
                        ChannelInput::Packet { packet: packet.clone(), sender: from.clone() },
                        now,
                    );
                }
            },
            ChannelAction::Kick(members) => {
                if !self.channel.contains(from) {
                    return;
                }
                for member in members.iter() {
                    self.leave(member, now);
                }
            },
            ChannelAction::LeaveSelf => self.leave(from, now),
        }
    }

    /// Stop delivering to `member` until released.
    pub fn hold(&mut self, member: MemberId) {
        self.held.insert(member);
    }

    /// Resume delivering to `member`. Queued deliveries that are already due
    /// arrive at once.
    pub fn release(&mut self, member: &MemberId) {
        self.held.remove(member);
    }

    /// When the next delivery is due.
    pub fn next_delivery(&self) -> Option<Instant> {
        self.queue
            .iter()
            .find(|delivery| !self.held.contains(&delivery.to))
            .map(|delivery| delivery.at)
    }

    /// Take the next delivery due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(MemberId, ChannelInput)> {
        let index = self
            .queue
            .iter()
            .position(|delivery| !self.held.contains(&delivery.to) && delivery.at <= now)?;
        self.queue.remove(index).map(|delivery| (delivery.to, delivery.input))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn drain(server: &mut SimServer, now: Instant) -> Vec<(MemberId, ChannelInput)> {
        std::iter::from_fn(|| server.pop_due(now)).collect()
    }

    #[test]
    fn broadcasts_to_everyone_including_sender() {
        let start = Instant::now();
        let latency = Duration::from_millis(50);
        let mut server = SimServer::new(latency);
        let alice = MemberId::from("alice");
        let bob = MemberId::from("bob");

        server.enter(alice.clone(), start);
        server.enter(bob.clone(), start);
        drain(&mut server, start + latency);

        server.submit(
            &alice,
            ChannelAction::Send { packet: Bytes::from_static(b"p"), recipients: MemberSet::new() },
            start + latency,
        );
        assert!(server.pop_due(start + latency).is_none());

        let delivered = drain(&mut server, start + latency * 2);
        let receivers: Vec<_> = delivered.iter().map(|(to, _)| to.clone()).collect();
        assert_eq!(receivers, vec![alice, bob]);
        assert_eq!(server.relayed(), 1);
    }

    #[test]
    fn held_members_receive_in_order_after_release() {
        let start = Instant::now();
        let latency = Duration::from_millis(50);
        let mut server = SimServer::new(latency);
        let alice = MemberId::from("alice");
        let bob = MemberId::from("bob");
        server.enter(alice.clone(), start);
        server.enter(bob.clone(), start);
        server.hold(bob.clone());

        for packet in [&b"one"[..], &b"two"[..]] {
            server.submit(
                &alice,
                ChannelAction::Send {
                    packet: Bytes::copy_from_slice(packet),
                    recipients: MemberSet::new(),
                },
                start,
            );
        }
        let later = start + latency * 10;
        assert!(drain(&mut server, later).iter().all(|(to, _)| to == &alice));

        server.release(&bob);
        let packets: Vec<_> = drain(&mut server, later)
            .into_iter()
            .filter_map(|(_, input)| match input {
                ChannelInput::Packet { packet, .. } => Some(packet),
                _ => None,
            })
            .collect();
        assert_eq!(packets, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }

    #[test]
    fn kick_notifies_everyone() {
        let start = Instant::now();
        let mut server = SimServer::new(Duration::ZERO);
        let alice = MemberId::from("alice");
        let bob = MemberId::from("bob");
        server.enter(alice.clone(), start);
        server.enter(bob.clone(), start);
        drain(&mut server, start);

        server.submit(&alice, ChannelAction::Kick(MemberSet::new().with(bob.clone())), start);
        let delivered = drain(&mut server, start);
        assert!(delivered.contains(&(bob.clone(), ChannelInput::SelfLeave)));
        assert!(delivered.contains(&(alice, ChannelInput::Leave(MemberSet::new().with(bob)))));
    }
}
