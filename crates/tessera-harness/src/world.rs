//! Deterministic multi-member world.
//!
//! The World wires a set of [`HybridSession`]s to a [`SimServer`] and drives
//! them with a virtual clock: it jumps from one delivery or deadline to the
//! next, hands inputs to the sessions and executes the channel actions they
//! return. Events are recorded per member for tests and oracles to inspect.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tessera_core::{
    HybridError, MemberSet,
    channel::{ChannelAction, ChannelInput},
    env::Environment,
    flow::{DefaultFlowControl, FlowConfig, SharedFlowControl},
    hybrid::{HybridAction, HybridConfig, HybridEvent, HybridSession, OperationId},
};
use tessera_proto::{MemberId, SessionId};

use crate::{SimEnv, SimGreeter, SimSecurityFactory, SimServer};

/// Session type run by every simulated member.
pub type SimSession = HybridSession<SimGreeter, SimSecurityFactory>;

/// Upper bound on loop iterations of one [`World::run_until`].
const MAX_STEPS: usize = 100_000;

/// World configuration.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// RNG seed
    pub seed: u64,
    /// Time the server takes to deliver anything
    pub network_latency: Duration,
    /// Broadcast latency the sessions assume
    pub broadcast_latency: Duration,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            network_latency: Duration::from_millis(50),
            broadcast_latency: Duration::from_millis(100),
        }
    }
}

/// One simulated member.
pub struct Member {
    session: SimSession,
    events: Vec<HybridEvent>,
}

impl Member {
    /// The member's session.
    pub fn session(&self) -> &SimSession {
        &self.session
    }

    /// Every event the member's session reported, in order.
    pub fn events(&self) -> &[HybridEvent] {
        &self.events
    }
}

/// Members, a channel server and a virtual clock.
pub struct World {
    env: SimEnv,
    now: Instant,
    flow: SharedFlowControl,
    server: SimServer,
    members: BTreeMap<MemberId, Member>,
}

impl World {
    /// Create a world whose clock starts now.
    pub fn new(config: WorldConfig) -> Self {
        Self::starting_at(Instant::now(), config)
    }

    /// Create a world whose clock starts at `start`.
    pub fn starting_at(start: Instant, config: WorldConfig) -> Self {
        let flow: SharedFlowControl = Arc::new(DefaultFlowControl::new(FlowConfig {
            broadcast_latency: config.broadcast_latency,
            ..FlowConfig::default()
        }));
        Self {
            env: SimEnv::with_seed(config.seed),
            now: start,
            flow,
            server: SimServer::new(config.network_latency),
            members: BTreeMap::new(),
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Create a member with a fresh session, outside the channel.
    pub fn add_member(&mut self, name: &str) -> MemberId {
        let id = MemberId::from(name);
        let session = HybridSession::new(
            id.clone(),
            SessionId::new(self.env.for_member(&id).random_u128()),
            SimGreeter,
            SimSecurityFactory,
            Arc::clone(&self.flow),
            HybridConfig::default(),
        );
        self.members.insert(id.clone(), Member { session, events: Vec::new() });
        id
    }

    /// Member `name`.
    ///
    /// # Panics
    ///
    /// If no such member was added.
    pub fn member(&self, name: &str) -> &Member {
        self.members.get(&MemberId::from(name)).unwrap_or_else(|| panic!("no member {name}"))
    }

    fn member_mut(&mut self, name: &str) -> &mut Member {
        self.members.get_mut(&MemberId::from(name)).unwrap_or_else(|| panic!("no member {name}"))
    }

    /// Session of member `name`.
    pub fn session(&self, name: &str) -> &SimSession {
        self.member(name).session()
    }

    /// All members.
    pub fn members(&self) -> impl Iterator<Item = (&MemberId, &Member)> {
        self.members.iter()
    }

    /// The server.
    pub fn server(&self) -> &SimServer {
        &self.server
    }

    /// `name` enters the channel.
    pub fn enter_channel(&mut self, name: &str) {
        self.server.enter(MemberId::from(name), self.now);
    }

    /// `name` drops off the channel without parting.
    pub fn disconnect(&mut self, name: &str) {
        self.server.leave(&MemberId::from(name), self.now);
    }

    /// Stop delivering to `name` until released.
    pub fn hold(&mut self, name: &str) {
        self.server.hold(MemberId::from(name));
    }

    /// Resume delivering to `name`.
    pub fn release(&mut self, name: &str) {
        self.server.release(&MemberId::from(name));
    }

    /// `name` sends application data.
    ///
    /// # Errors
    ///
    /// Whatever the session refused with.
    pub fn send(&mut self, name: &str, data: &[u8]) -> Result<(), HybridError> {
        let now = self.now;
        let actions = self.member_mut(name).session.send_data(Bytes::copy_from_slice(data), now)?;
        self.apply(&MemberId::from(name), actions);
        Ok(())
    }

    /// `name` proposes a membership change.
    ///
    /// # Errors
    ///
    /// Whatever the session refused with.
    pub fn change_membership(
        &mut self,
        name: &str,
        include: &[&str],
        exclude: &[&str],
    ) -> Result<OperationId, HybridError> {
        let include = names(include);
        let exclude = names(exclude);
        let (id, actions) = self.member_mut(name).session.change_membership(include, exclude)?;
        self.apply(&MemberId::from(name), actions);
        Ok(id)
    }

    /// `name` parts the session.
    ///
    /// # Errors
    ///
    /// Whatever the session refused with.
    pub fn part(&mut self, name: &str) -> Result<OperationId, HybridError> {
        let now = self.now;
        let (id, actions) = self.member_mut(name).session.part(now)?;
        self.apply(&MemberId::from(name), actions);
        Ok(id)
    }

    /// Outcome of operation `op` of `name`, once completed.
    pub fn outcome(&self, name: &str, op: OperationId) -> Option<Result<(), HybridError>> {
        self.member(name).events.iter().find_map(|event| match event {
            HybridEvent::OperationCompleted { id, result } if *id == op => Some(result.clone()),
            _ => None,
        })
    }

    /// Payloads `name` accepted, in acceptance order.
    pub fn payloads(&self, name: &str) -> Vec<Bytes> {
        self.session(name).messages().iter().map(|entry| entry.payload.clone()).collect()
    }

    /// Advance the clock by `duration`, processing everything due.
    pub fn run_for(&mut self, duration: Duration) {
        self.run_until(self.now + duration);
    }

    /// Advance the clock to `until`, processing everything due.
    ///
    /// # Panics
    ///
    /// If the sessions keep producing work without the clock advancing.
    pub fn run_until(&mut self, until: Instant) {
        let mut steps = 0;
        loop {
            let next =
                [self.server.next_delivery(), self.next_deadline()].into_iter().flatten().min();
            let Some(next) = next.filter(|at| *at <= until) else { break };
            self.now = self.now.max(next);

            while let Some((to, input)) = self.server.pop_due(self.now) {
                self.deliver(&to, input);
            }

            let now = self.now;
            let due: Vec<MemberId> = self
                .members
                .iter()
                .filter(|(_, member)| member.session.next_deadline().is_some_and(|at| at <= now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in due {
                let Some(member) = self.members.get_mut(&id) else { continue };
                let actions = member.session.tick(now);
                self.apply(&id, actions);
            }

            steps += 1;
            assert!(
                steps < MAX_STEPS,
                "simulation did not settle {:?} before {:?}",
                until.saturating_duration_since(now),
                until
            );
        }
        self.now = self.now.max(until);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.members.values().filter_map(|member| member.session.next_deadline()).min()
    }

    fn deliver(&mut self, to: &MemberId, input: ChannelInput) {
        let now = self.now;
        let Some(member) = self.members.get_mut(to) else {
            tracing::debug!(member = %to, "delivery to unknown member");
            return;
        };
        let actions = member.session.handle_channel(input, now);
        self.apply(to, actions);
    }

    fn apply(&mut self, from: &MemberId, actions: Vec<HybridAction>) {
        for action in actions {
            match action {
                HybridAction::Channel(request) => {
                    if let ChannelAction::Kick(members) = &request {
                        tracing::debug!(member = %from, kick = %members, "kick requested");
                    }
                    self.server.submit(from, request, self.now);
                },
                HybridAction::Event(event) => {
                    tracing::debug!(member = %from, ?event, "session event");
                    if let Some(member) = self.members.get_mut(from) {
                        member.events.push(event);
                    }
                },
            }
        }
    }
}

fn names(list: &[&str]) -> MemberSet {
    list.iter().map(|name| MemberId::from(*name)).collect()
}
