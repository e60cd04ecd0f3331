//! The logical session across sub-session rotations.
//!
//! A [`HybridSession`] is what the application talks to. It keeps the same
//! [`SessionId`] for its whole life while the encrypted group underneath it
//! rotates: every membership change runs a greeting, and every completed
//! greeting replaces the current [`SessionBase`] with a new one.
//!
//! # Architecture: Action-Based State Machine
//!
//! Three stimuli drive the session, each run to completion:
//!
//! - application calls ([`HybridSession::send_data`],
//!   [`HybridSession::change_membership`], [`HybridSession::part`])
//! - channel input ([`HybridSession::handle_channel`])
//! - deadlines ([`HybridSession::tick`])
//!
//! Each returns [`HybridAction`]s: channel requests for the driver to
//! execute and events for the application.
//!
//! # Rotation
//!
//! ```text
//!            greeting completes
//!   cur ───────────────────────> prev ── fin() ──> Parted / PartFailed
//!    ↑                                                  │
//!   new SessionBase                          kick task_leave, maybe leave
//! ```
//!
//! At most two sub-sessions are alive: the current one, and the previous one
//! draining to a consistent end. Rotating again forcibly stops a previous
//! sub-session that has not finished draining.
//!
//! # Bookkeeping
//!
//! Membership of the channel and of the encrypted group drift apart: people
//! leave the channel without being excluded, excluded people linger in the
//! channel. Two task sets reconcile them:
//!
//! - `task_exclude`: group members to exclude cryptographically (they left
//!   the channel, or announced they are leaving)
//! - `task_leave`: excluded members still in the channel, kicked once the
//!   previous sub-session has finished
//!
//! Tasks are handled only while no own operation, greeting or own proposal
//! is in flight.
//!
//! # Invariants
//!
//! - **Disjoint Tasks**: `task_exclude ∩ task_leave = ∅`
//! - **One Own Operation**: at most one application-requested operation runs;
//!   it completes exactly once through [`HybridEvent::OperationCompleted`]

use std::{
    collections::BTreeSet,
    fmt,
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use tessera_proto::{MemberId, MessageBody, MessageId, PacketId, SessionId, SubSessionId};

use crate::{
    channel::{ChannelAction, ChannelInput},
    constants::LEAVE_INTENT_CLOSES,
    error::{HybridError, SessionError},
    flow::SharedFlowControl,
    greeter::{
        GreetError, GreetOutcome, GreetSend, Greeter, Greeting, GreetingMetadata, OpKind, OpPacket,
    },
    message::MessageSet,
    message_log::{LogEntry, MessageLog},
    presence::Presence,
    security::SecurityFactory,
    server_order::{OpDecision, ServerOrder},
    session::{SessionAction, SessionBase, SessionConfig, SessionEvent, SessionState},
    set::{MemberSet, SetDiff},
    trial_buffer::{DropReason, OverflowPolicy, TrialBuffer, TrialTarget},
};

/// Configuration of a [`HybridSession`].
#[derive(Debug, Clone)]
pub struct HybridConfig {
    /// Configuration of every sub-session
    pub session: SessionConfig,
    /// What the decrypt buffer does when over capacity
    pub decrypt_overflow: OverflowPolicy,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self { session: SessionConfig::default(), decrypt_overflow: OverflowPolicy::Drop }
    }
}

/// Handle of an application-requested operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Events reported to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HybridEvent {
    /// A payload was accepted
    MessageAccepted {
        /// Sub-session it was sent in
        sub_session: SubSessionId,
        /// Message id
        id: MessageId,
        /// Author
        author: MemberId,
        /// Application data
        payload: Bytes,
    },
    /// Everyone acknowledged a payload
    MessageFullyAcked {
        /// Message id
        id: MessageId,
    },
    /// A payload missed its final full-ack deadline
    NotFullyAcked {
        /// Message id
        id: MessageId,
    },
    /// An authenticated message never got its parents
    NotAccepted {
        /// Sub-session it was sent in
        sub_session: SubSessionId,
        /// Author
        author: MemberId,
        /// Missing parents (some of them)
        parents: MessageSet,
    },
    /// A packet could not be decrypted by any sub-session in time
    NotDecrypted {
        /// Channel-level sender
        sender: MemberId,
        /// Packet size in bytes
        size: usize,
    },
    /// The session state changed
    StateChanged {
        /// Previous state
        old: SessionState,
        /// New state
        new: SessionState,
    },
    /// Membership of the encrypted group changed
    Members {
        /// Members before and after
        remain: MemberSet,
        /// New members
        added: MemberSet,
        /// Removed members
        removed: MemberSet,
    },
    /// A sub-session finished parting
    FinComplete {
        /// The sub-session
        sub_session: SubSessionId,
        /// Whether its transcript ended consistent
        consistent: bool,
    },
    /// An own operation finished
    OperationCompleted {
        /// Operation handle
        id: OperationId,
        /// Outcome
        result: Result<(), HybridError>,
    },
}

/// Actions returned by the session state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HybridAction {
    /// Request to the channel
    Channel(ChannelAction),
    /// Event for the application
    Event(HybridEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OperationRequest {
    Membership { include: MemberSet, exclude: MemberSet },
    Part,
}

#[derive(Debug)]
struct OwnOperation {
    id: OperationId,
    request: OperationRequest,
    /// Initial packet of the proposal carrying out this operation
    proposal: Option<PacketId>,
}

#[derive(Debug, Clone, Copy)]
struct OwnProposal {
    packet: PacketId,
    prev_pf: Option<PacketId>,
}

struct SubSession<S: crate::security::MessageSecurity, St> {
    session: SessionBase<S>,
    greet_state: St,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Cur,
    Prev,
}

/// A packet no sub-session could decrypt yet.
#[derive(Debug)]
struct Undecrypted {
    id: PacketId,
    packet: Bytes,
    sender: MemberId,
}

/// A group session with a linear order on its membership operations.
pub struct HybridSession<G, F>
where
    G: Greeter,
    F: SecurityFactory<G::State>,
{
    owner: MemberId,
    own_set: MemberSet,
    session_id: SessionId,
    config: HybridConfig,
    flow: SharedFlowControl,
    greeter: G,
    factory: F,

    cur: Option<SubSession<F::Security, G::State>>,
    prev: Option<SubSession<F::Security, G::State>>,
    dropped_inconsistent: bool,

    channel_members: Option<MemberSet>,
    server_order: ServerOrder,
    greeting: Option<G::Greeting>,
    decrypt: TrialBuffer<PacketId, Undecrypted>,
    messages: MessageLog,
    presence: Presence,

    task_exclude: BTreeSet<MemberId>,
    task_leave: BTreeSet<MemberId>,
    own_proposal: Option<OwnProposal>,
    own_op: Option<OwnOperation>,
    next_op: u64,
}

impl<G, F> fmt::Debug for HybridSession<G, F>
where
    G: Greeter,
    F: SecurityFactory<G::State>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridSession")
            .field("owner", &self.owner)
            .field("session_id", &self.session_id)
            .field("cur", &self.cur.as_ref().map(|sub| &sub.session))
            .field("prev", &self.prev.as_ref().map(|sub| &sub.session))
            .field("channel_members", &self.channel_members)
            .field("server_order", &self.server_order)
            .field("greeting", &self.greeting.is_some())
            .field("task_exclude", &self.task_exclude)
            .field("task_leave", &self.task_leave)
            .field("own_op", &self.own_op)
            .finish()
    }
}

impl<G, F> HybridSession<G, F>
where
    G: Greeter,
    F: SecurityFactory<G::State>,
{
    /// Create a session for `owner`, outside any channel and sub-session.
    pub fn new(
        owner: MemberId,
        session_id: SessionId,
        greeter: G,
        factory: F,
        flow: SharedFlowControl,
        config: HybridConfig,
    ) -> Self {
        let decrypt = TrialBuffer::new("decrypt", config.decrypt_overflow);
        Self {
            own_set: MemberSet::new().with(owner.clone()),
            owner,
            session_id,
            config,
            flow,
            greeter,
            factory,
            cur: None,
            prev: None,
            dropped_inconsistent: false,
            channel_members: None,
            server_order: ServerOrder::new(),
            greeting: None,
            decrypt,
            messages: MessageLog::new(),
            presence: Presence::new(),
            task_exclude: BTreeSet::new(),
            task_leave: BTreeSet::new(),
            own_proposal: None,
            own_op: None,
            next_op: 0,
        }
    }

    /// Stable session id.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Our member id.
    #[must_use]
    pub fn owner(&self) -> &MemberId {
        &self.owner
    }

    /// Accepted payloads of every sub-session so far.
    #[must_use]
    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    /// Presence of the members we heard from.
    #[must_use]
    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// State of the current sub-session; `Parted` without one.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.cur.as_ref().map_or(SessionState::Parted, |sub| sub.session.state())
    }

    /// Members of the current sub-session; just us without one.
    #[must_use]
    pub fn cur_members(&self) -> MemberSet {
        self.cur.as_ref().map_or_else(|| self.own_set.clone(), |sub| sub.session.members().clone())
    }

    /// The current sub-session.
    #[must_use]
    pub fn cur_session(&self) -> Option<&SessionBase<F::Security>> {
        self.cur.as_ref().map(|sub| &sub.session)
    }

    /// The previous sub-session, possibly still draining.
    #[must_use]
    pub fn prev_session(&self) -> Option<&SessionBase<F::Security>> {
        self.prev.as_ref().map(|sub| &sub.session)
    }

    /// Channel membership, if we are in the channel.
    #[must_use]
    pub fn channel_members(&self) -> Option<&MemberSet> {
        self.channel_members.as_ref()
    }

    /// True once we know the channel's operation order.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.server_order.is_synced()
    }

    /// True if no sub-session, alive or dropped, ended with unacknowledged
    /// payloads.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        !self.dropped_inconsistent
            && self.prev.as_ref().is_none_or(|sub| sub.session.is_consistent())
            && self.cur.as_ref().is_none_or(|sub| sub.session.is_consistent())
    }

    /// Earliest time at which [`HybridSession::tick`] has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.decrypt.next_expiry(self.flow.broadcast_latency()),
            self.cur.as_ref().and_then(|sub| sub.session.next_deadline()),
            self.prev.as_ref().and_then(|sub| sub.session.next_deadline()),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn sub_mut(&mut self, slot: Slot) -> Option<&mut SubSession<F::Security, G::State>> {
        match slot {
            Slot::Cur => self.cur.as_mut(),
            Slot::Prev => self.prev.as_mut(),
        }
    }

    fn sub(&self, slot: Slot) -> Option<&SubSession<F::Security, G::State>> {
        match slot {
            Slot::Cur => self.cur.as_ref(),
            Slot::Prev => self.prev.as_ref(),
        }
    }

    fn note_state(&self, before: SessionState, out: &mut Vec<HybridAction>) {
        let after = self.state();
        if before != after {
            tracing::info!(
                owner = %self.owner,
                old = ?before,
                new = ?after,
                "session state changed"
            );
            out.push(HybridAction::Event(HybridEvent::StateChanged { old: before, new: after }));
        }
    }

    /// Send application data to the current sub-session. Empty data sends a
    /// manual acknowledgement.
    ///
    /// # Errors
    ///
    /// - `OperationInProgress` while parting
    /// - `NoSession` without a current sub-session
    /// - `Session` if the sub-session refused
    pub fn send_data(
        &mut self,
        contents: Bytes,
        now: Instant,
    ) -> Result<Vec<HybridAction>, HybridError> {
        if self.own_op.as_ref().is_some_and(|op| op.request == OperationRequest::Part) {
            return Err(HybridError::OperationInProgress);
        }
        let before = self.state();
        let cur = self.cur.as_mut().ok_or(HybridError::NoSession)?;
        let actions = cur.session.send_data(contents, now)?;

        let mut out = Vec::new();
        self.absorb(Slot::Cur, actions, &mut out);
        self.note_state(before, &mut out);
        Ok(out)
    }

    /// Propose adding `include` and removing `exclude`.
    ///
    /// Completes through [`HybridEvent::OperationCompleted`] once the
    /// greeting finishes, or fails if the proposal loses the ordering race.
    /// Repeating the running request returns its id again.
    ///
    /// # Errors
    ///
    /// - `OperationInProgress` if a different operation or proposal is running
    /// - `NotSynced`, `NotInChannel`, `NoChange`, `InvalidChange` if the
    ///   proposal cannot be made now
    /// - `Greeting` if the greeter refused
    pub fn change_membership(
        &mut self,
        include: MemberSet,
        exclude: MemberSet,
    ) -> Result<(OperationId, Vec<HybridAction>), HybridError> {
        let request =
            OperationRequest::Membership { include: include.clone(), exclude: exclude.clone() };
        self.run_own_operation(request, |session, out| {
            if session.own_proposal.is_some() {
                return Err(HybridError::OperationInProgress);
            }
            session.propose(include, exclude, out).map(Some)
        })
    }

    /// Leave the session.
    ///
    /// With others present, announce the intent to leave by sending two
    /// closing consistency messages in a row; the others then exclude us and
    /// kick us from the channel. Alone, just leave the channel. Completes when
    /// we have left the channel.
    ///
    /// # Errors
    ///
    /// - `OperationInProgress` if a different operation is running
    /// - `NoSession` outside the channel
    /// - `Session` if the sub-session refused to send
    pub fn part(&mut self, now: Instant) -> Result<(OperationId, Vec<HybridAction>), HybridError> {
        self.run_own_operation(OperationRequest::Part, |session, out| {
            if session.channel_members.is_none() {
                return Err(HybridError::NoSession);
            }
            let Some(cur) = session.cur.as_mut() else {
                tracing::info!(owner = %session.owner, "parting alone, leaving channel");
                out.push(HybridAction::Channel(ChannelAction::LeaveSelf));
                return Ok(None);
            };

            let mut actions = Vec::new();
            for _ in 0..LEAVE_INTENT_CLOSES {
                let close = MessageBody::Consistency { close: true };
                actions.extend(cur.session.send_object(close, now)?);
            }
            tracing::info!(
                owner = %session.owner,
                sub_session = %cur.session.sub_session_id(),
                "sent leave intent"
            );
            session.absorb(Slot::Cur, actions, out);
            Ok(None)
        })
    }

    fn run_own_operation<R>(
        &mut self,
        request: OperationRequest,
        run: R,
    ) -> Result<(OperationId, Vec<HybridAction>), HybridError>
    where
        R: FnOnce(&mut Self, &mut Vec<HybridAction>) -> Result<Option<PacketId>, HybridError>,
    {
        if let Some(op) = &self.own_op {
            if op.request == request {
                return Ok((op.id, Vec::new()));
            }
            return Err(HybridError::OperationInProgress);
        }

        let before = self.state();
        let mut out = Vec::new();
        let proposal = run(self, &mut out)?;

        let id = OperationId(self.next_op);
        self.next_op += 1;
        tracing::info!(owner = %self.owner, op = %id, ?request, "started own operation");
        self.own_op = Some(OwnOperation { id, request, proposal });

        self.note_state(before, &mut out);
        Ok((id, out))
    }

    fn complete_own_op(&mut self, result: Result<(), HybridError>, out: &mut Vec<HybridAction>) {
        let Some(op) = self.own_op.take() else { return };
        tracing::info!(owner = %self.owner, op = %op.id, ?result, "own operation completed");
        out.push(HybridAction::Event(HybridEvent::OperationCompleted { id: op.id, result }));
    }

    /// Fail the own operation carried out by `proposal`, if any.
    fn fail_own_proposal(
        &mut self,
        proposal: PacketId,
        err: HybridError,
        out: &mut Vec<HybridAction>,
    ) {
        if self.own_op.as_ref().is_some_and(|op| op.proposal == Some(proposal)) {
            self.complete_own_op(Err(err), out);
        } else {
            tracing::info!(
                owner = %self.owner,
                packet = %proposal,
                error = %err,
                "task proposal failed"
            );
        }
        self.maybe_handle_tasks(out);
    }

    /// Broadcast the initial packet of a membership change.
    fn propose(
        &mut self,
        include: MemberSet,
        exclude: MemberSet,
        out: &mut Vec<HybridAction>,
    ) -> Result<PacketId, HybridError> {
        debug_assert!(self.own_proposal.is_none());
        if !self.server_order.is_synced() {
            return Err(HybridError::NotSynced);
        }
        let Some(channel) = &self.channel_members else {
            return Err(HybridError::NotSynced);
        };

        let cur_members = self.cur_members();
        let members =
            cur_members.patch(&SetDiff { added: include.clone(), removed: exclude.clone() })?;
        if members == cur_members {
            return Err(HybridError::NoChange);
        }
        // Ordering needs everyone in the channel when the server relays the
        // packet; checking now catches the obvious failures early.
        let missing = members.subtract(channel);
        if !missing.is_empty() {
            return Err(HybridError::NotInChannel { missing });
        }

        let prev_pf = self.server_order.prev_pf();
        let metadata = GreetingMetadata {
            prev_pf,
            prev_ch: self.server_order.prev_ch().clone(),
            author: self.owner.clone(),
            parents: self
                .cur
                .as_ref()
                .map(|sub| sub.session.transcript().max())
                .unwrap_or_default(),
        };
        let prev_state = self.cur.as_ref().map(|sub| &sub.greet_state);
        let packet = self.greeter.encode(prev_state, &cur_members, &members, metadata)?;
        let id = PacketId::digest(&packet);

        self.own_proposal = Some(OwnProposal { packet: id, prev_pf });
        tracing::info!(
            owner = %self.owner,
            packet = %id,
            include = %include,
            exclude = %exclude,
            "proposed membership change"
        );
        out.push(HybridAction::Channel(ChannelAction::Send {
            packet,
            recipients: cur_members.union(&include),
        }));
        Ok(id)
    }

    /// Process input from the channel.
    pub fn handle_channel(&mut self, input: ChannelInput, now: Instant) -> Vec<HybridAction> {
        let before = self.state();
        let mut out = Vec::new();
        match input {
            ChannelInput::Packet { packet, sender } => {
                self.handle_packet(packet, sender, now, &mut out);
            },
            ChannelInput::SelfEnter { members } => self.handle_self_enter(members),
            ChannelInput::SelfLeave => self.handle_self_leave(now, &mut out),
            ChannelInput::Enter(others) => self.handle_others_enter(others, &mut out),
            ChannelInput::Leave(others) => self.handle_others_leave(others, &mut out),
        }
        self.note_state(before, &mut out);
        out
    }

    /// Run everything due at `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<HybridAction> {
        let before = self.state();
        let mut out = Vec::new();

        let ttl = self.flow.broadcast_latency();
        let mut buffer = self.take_decrypt_buffer();
        buffer.expire(now, ttl, &mut DecryptTarget { hybrid: self, now, actions: &mut out });
        self.decrypt = buffer;

        for slot in [Slot::Prev, Slot::Cur] {
            let Some(sub) = self.sub_mut(slot) else { continue };
            let actions = sub.session.tick(now);
            self.absorb(slot, actions, &mut out);
        }

        self.note_state(before, &mut out);
        out
    }

    fn handle_self_enter(&mut self, members: MemberSet) {
        debug_assert!(members.contains(&self.owner));
        tracing::info!(owner = %self.owner, channel = %members, "entered channel");
        if members.len() == 1 && !self.server_order.is_synced() {
            self.server_order.sync_new(&members);
        }
        // Otherwise wait for someone to include us.
        self.channel_members = Some(members);
    }

    fn handle_self_leave(&mut self, now: Instant, out: &mut Vec<HybridAction>) {
        tracing::info!(owner = %self.owner, "left channel");
        self.channel_members = None;
        self.server_order.clear();
        self.task_exclude.clear();
        self.task_leave.clear();
        self.presence.clear();
        self.greeting = None;
        self.own_proposal = None;

        self.change_sub_session(None, now, out);

        let mut buffer = self.take_decrypt_buffer();
        buffer.clear(&mut DecryptTarget { hybrid: self, now, actions: out });

        if let Some(op) = &self.own_op {
            let result = match op.request {
                OperationRequest::Part => Ok(()),
                OperationRequest::Membership { .. } => Err(HybridError::NoSession),
            };
            self.complete_own_op(result, out);
        }
    }

    fn handle_others_enter(&mut self, others: MemberSet, out: &mut Vec<HybridAction>) {
        let awaiting_kick: MemberSet =
            others.iter().filter(|member| self.task_leave.contains(*member)).cloned().collect();
        if !awaiting_kick.is_empty() {
            tracing::warn!(
                owner = %self.owner,
                members = %awaiting_kick,
                "ignored enter of members still in the channel"
            );
        }
        let others = others.subtract(&awaiting_kick);
        if others.is_empty() {
            return;
        }
        self.channel_members = self.channel_members.as_ref().map(|channel| channel.union(&others));

        let pending: MemberSet = self.task_exclude.iter().cloned().collect();
        let kick = others.intersect(&pending);
        let unexpected = others.subtract(&kick);
        if !kick.is_empty() {
            // Not excluded cryptographically yet, so they cannot come back.
            tracing::info!(owner = %self.owner, members = %kick, "kicking re-entering members");
            out.push(HybridAction::Channel(ChannelAction::Kick(kick)));
        }
        if !unexpected.is_empty() {
            tracing::info!(
                owner = %self.owner,
                members = %unexpected,
                "unexpected members entered the channel"
            );
        }
    }

    fn handle_others_leave(&mut self, others: MemberSet, out: &mut Vec<HybridAction>) {
        self.channel_members =
            self.channel_members.as_ref().map(|channel| channel.subtract(&others));
        for member in &others {
            self.task_leave.remove(member);
        }

        let to_exclude = self.cur_members().intersect(&others);
        if !to_exclude.is_empty() {
            tracing::info!(
                owner = %self.owner,
                members = %to_exclude,
                "added to task_exclude: left the channel"
            );
            self.task_exclude.extend(to_exclude.iter().cloned());
            self.maybe_handle_tasks(out);
        }
    }

    fn maybe_handle_tasks(&mut self, out: &mut Vec<HybridAction>) {
        debug_assert!(self.task_exclude.is_disjoint(&self.task_leave));

        if let Some(op) = &self.own_op {
            tracing::info!(owner = %self.owner, op = %op.id, "tasks wait for own operation");
        } else if let Some(greeting) = &self.greeting {
            tracing::info!(
                owner = %self.owner,
                members = %greeting.members(),
                "tasks wait for ongoing greeting"
            );
        } else if let Some(proposal) = &self.own_proposal {
            tracing::info!(
                owner = %self.owner,
                packet = %proposal.packet,
                "tasks wait for own proposal"
            );
        } else {
            // task_leave is handled when the previous sub-session finishes.
            let pending: MemberSet = self.task_exclude.iter().cloned().collect();
            let exclude = pending.intersect(&self.cur_members());
            if exclude.is_empty() {
                return;
            }
            if let Err(err) = self.propose(MemberSet::new(), exclude, out) {
                tracing::info!(owner = %self.owner, error = %err, "cannot handle tasks yet");
            }
            return;
        }

        tracing::info!(
            owner = %self.owner,
            exclude = ?self.task_exclude,
            leave = ?self.task_leave,
            "remaining tasks"
        );
    }

    fn handle_packet(
        &mut self,
        packet: Bytes,
        sender: MemberId,
        now: Instant,
        out: &mut Vec<HybridAction>,
    ) {
        if let Some(op) = self.greeter.partial_decode(&packet, &sender) {
            self.recv_greet(op, &packet, &sender, now, out);
            return;
        }

        if self.server_order.is_synced() && self.server_order.has_ongoing_op() {
            if let Some(greeting) = self.greeting.as_mut() {
                match greeting.recv(&packet, &sender) {
                    Ok(Some(sends)) => {
                        push_greet_sends(sends, out);
                        return;
                    },
                    Ok(None) => {},
                    Err(err) => {
                        tracing::warn!(
                            owner = %self.owner,
                            sender = %sender,
                            error = %err,
                            "bad greeting packet"
                        );
                        return;
                    },
                }
            }
        }

        self.try_decrypt(packet, sender, now, out);
    }

    /// Feed a membership packet through the server order and the greeting.
    ///
    /// Once synced, an initial packet proposed by someone outside our current
    /// membership is dropped before the server order sees it. It neither
    /// advances the order nor reaches the decrypt path, so every synced member
    /// stays at the same place in the order regardless of who tried to propose.
    fn recv_greet(
        &mut self,
        op: OpPacket,
        packet: &Bytes,
        sender: &MemberId,
        now: Instant,
        out: &mut Vec<HybridAction>,
    ) {
        let Some(channel) = self.channel_members.clone() else {
            tracing::debug!(
                owner = %self.owner,
                packet = %op.id,
                "ignored greeting outside channel"
            );
            return;
        };
        if let OpKind::Initial { metadata, .. } = &op.kind {
            if self.server_order.is_synced() && !self.cur_members().contains(&metadata.author) {
                tracing::info!(
                    owner = %self.owner,
                    author = %metadata.author,
                    "ignored membership proposal from outside the group"
                );
                return;
            }
        }

        match self.server_order.try_op_packet(&self.owner, &op, &channel) {
            OpDecision::AcceptedInitial { packet: initial, prev_pf } => {
                debug_assert!(self.greeting.is_none());
                let cur_members = self.cur_members();
                let prev_state = self.cur.as_ref().map(|sub| &sub.greet_state);
                match self.greeter.decode(&self.owner, prev_state, &cur_members, packet, sender) {
                    Ok(greeting) => {
                        self.set_greeting(greeting, now, out);
                        self.maybe_finish_own_proposal(initial, prev_pf, None, out);
                    },
                    Err(err) => {
                        tracing::warn!(
                            owner = %self.owner,
                            packet = %initial,
                            error = %err,
                            "accepted membership proposal cannot be decoded"
                        );
                        self.maybe_finish_own_proposal(initial, prev_pf, Some(err), out);
                    },
                }
            },
            OpDecision::AcceptedFinal { packet: fin, prev_pi } => {
                tracing::debug!(
                    owner = %self.owner,
                    packet = %fin,
                    initial = %prev_pi,
                    "operation finished"
                );
            },
            OpDecision::Rejected(reason) => {
                tracing::info!(
                    owner = %self.owner,
                    packet = %op.id,
                    %reason,
                    "membership packet rejected"
                );
                if self.own_proposal.is_some_and(|own| own.packet == op.id) {
                    self.own_proposal = None;
                    self.fail_own_proposal(
                        op.id,
                        HybridError::ProposalRejected { packet: op.id },
                        out,
                    );
                }
                return;
            },
        }

        if let Some(greeting) = self.greeting.as_mut() {
            match greeting.recv(packet, sender) {
                Ok(Some(sends)) => push_greet_sends(sends, out),
                Ok(None) => {
                    tracing::warn!(
                        owner = %self.owner,
                        packet = %op.id,
                        "accepted packet not part of greeting"
                    );
                },
                Err(err) => {
                    tracing::warn!(
                        owner = %self.owner,
                        packet = %op.id,
                        error = %err,
                        "greeting rejected packet"
                    );
                },
            }
        }

        if !self.server_order.has_ongoing_op() {
            self.complete_greeting(now, out);
        }
    }

    fn set_greeting(&mut self, greeting: G::Greeting, now: Instant, out: &mut Vec<HybridAction>) {
        tracing::info!(
            owner = %self.owner,
            packet = %greeting.initial_id(),
            members = %greeting.members(),
            "greeting started"
        );
        self.greeting = Some(greeting);

        // Drive the current sub-session towards consistency in case it is
        // about to be rotated out.
        let Some(cur) = self.cur.as_mut() else { return };
        if cur.session.state() != SessionState::Joined {
            return;
        }
        match cur.session.send_object(MessageBody::Consistency { close: false }, now) {
            Ok(actions) => self.absorb(Slot::Cur, actions, out),
            Err(err) => {
                tracing::warn!(owner = %self.owner, error = %err, "failed to request consistency");
            },
        }
    }

    fn maybe_finish_own_proposal(
        &mut self,
        initial: PacketId,
        prev_pf: Option<PacketId>,
        decode_error: Option<GreetError>,
        out: &mut Vec<HybridAction>,
    ) {
        let Some(own) = self.own_proposal else { return };
        if own.packet == initial {
            debug_assert_eq!(own.prev_pf, prev_pf);
            self.own_proposal = None;
            tracing::info!(owner = %self.owner, packet = %initial, "own proposal accepted");
            if let Some(err) = decode_error {
                self.fail_own_proposal(initial, HybridError::Greeting(err), out);
            }
        } else if own.prev_pf == prev_pf {
            self.own_proposal = None;
            self.fail_own_proposal(
                own.packet,
                HybridError::ProposalRejected { packet: own.packet },
                out,
            );
        }
    }

    fn complete_greeting(&mut self, now: Instant, out: &mut Vec<HybridAction>) {
        let Some(mut greeting) = self.greeting.take() else { return };
        let initial = greeting.initial_id();
        match greeting.take_outcome() {
            Some(outcome) => self.on_greeting_complete(&greeting, outcome, now, out),
            None => {
                tracing::warn!(
                    owner = %self.owner,
                    packet = %initial,
                    "greeting finished without outcome"
                );
                if self.own_op.as_ref().is_some_and(|op| op.proposal == Some(initial)) {
                    let err = GreetError::Unexpected("greeting finished without outcome".into());
                    self.complete_own_op(Err(HybridError::Greeting(err)), out);
                }
            },
        }
        self.maybe_handle_tasks(out);
    }

    fn on_greeting_complete(
        &mut self,
        greeting: &G::Greeting,
        outcome: GreetOutcome<G::State>,
        now: Instant,
        out: &mut Vec<HybridAction>,
    ) {
        let members = greeting.members().clone();
        if !members.contains(&self.owner) {
            // Wait for someone to kick us.
            tracing::info!(owner = %self.owner, "ignored completed greeting that excludes us");
            return;
        }

        if greeting.metadata_is_authenticated() {
            let prev_pf = greeting.metadata().prev_pf;
            if let Err(err) = self.server_order.set_metadata_authenticated(prev_pf) {
                tracing::warn!(
                    owner = %self.owner,
                    error = %err,
                    "greeting contradicts adopted order"
                );
            }
        }

        let diff = greeting.prev_members().diff(&members);
        for member in &diff.removed {
            self.task_exclude.remove(member);
        }
        if let Some(channel) = &self.channel_members {
            let to_leave = channel.intersect(&diff.removed);
            if !to_leave.is_empty() {
                tracing::info!(
                    owner = %self.owner,
                    members = %to_leave,
                    "added to task_leave: excluded from the session"
                );
                self.task_leave.extend(to_leave.iter().cloned());
            }
        }

        self.change_sub_session(Some((members, outcome)), now, out);

        if self.own_op.as_ref().is_some_and(|op| op.proposal == Some(greeting.initial_id())) {
            self.complete_own_op(Ok(()), out);
        }
    }

    /// Rotate sub-sessions. `None` means we left the channel.
    fn change_sub_session(
        &mut self,
        next: Option<(MemberSet, GreetOutcome<G::State>)>,
        now: Instant,
        out: &mut Vec<HybridAction>,
    ) {
        let leaving = next.is_none();

        if let Some(mut prev) = self.prev.take() {
            prev.session.stop(now);
            if !prev.session.is_consistent() {
                tracing::warn!(
                    owner = %self.owner,
                    sub_session = %prev.session.sub_session_id(),
                    "dropped inconsistent sub-session"
                );
                self.dropped_inconsistent = true;
            }
        }

        // Absorbed after the rotation: fin handling looks at the new cur.
        let mut fin_actions = Vec::new();
        if let Some(mut cur) = self.cur.take() {
            if leaving {
                cur.session.stop(now);
            } else if cur.session.state() == SessionState::Joined {
                match cur.session.fin(now) {
                    Ok(actions) => fin_actions = actions,
                    Err(err) => {
                        tracing::warn!(
                            owner = %self.owner,
                            error = %err,
                            "failed to part sub-session"
                        );
                    },
                }
            }
            self.prev = Some(cur);
        }

        let prev_sub = self.prev.as_ref().map(|sub| sub.session.sub_session_id());
        // A group of one is no group: keep no sub-session.
        match next.filter(|(members, _)| members.len() > 1) {
            Some((members, GreetOutcome { sub_session_id, state })) => {
                let security = self.factory.create(&self.owner, sub_session_id, &members, &state);
                let session = SessionBase::new(
                    self.owner.clone(),
                    sub_session_id,
                    members,
                    security,
                    Arc::clone(&self.flow),
                    self.config.session.clone(),
                );
                tracing::info!(
                    owner = %self.owner,
                    prev = ?prev_sub,
                    next = %sub_session_id,
                    members = %session.members(),
                    "changed sub-session"
                );
                self.cur = Some(SubSession { session, greet_state: state });
                self.retry_decrypt(now, out);
            },
            None => {
                tracing::info!(
                    owner = %self.owner,
                    prev = ?prev_sub,
                    "changed sub-session to none"
                );
            },
        }

        let old = self
            .prev
            .as_ref()
            .map_or_else(|| self.own_set.clone(), |sub| sub.session.members().clone());
        let new = self.cur_members();
        let SetDiff { added, removed } = old.diff(&new);
        if !added.is_empty() || !removed.is_empty() {
            out.push(HybridAction::Event(HybridEvent::Members {
                remain: old.intersect(&new),
                added,
                removed,
            }));
        }

        self.absorb(Slot::Prev, fin_actions, out);
    }

    fn on_prev_session_fin(&mut self, out: &mut Vec<HybridAction>) {
        let Some(channel) = &self.channel_members else { return };

        let task_leave: MemberSet = self.task_leave.iter().cloned().collect();
        let pending = channel.intersect(&task_leave);
        if !pending.is_empty() {
            tracing::info!(owner = %self.owner, members = %pending, "requested channel kick");
            out.push(HybridAction::Channel(ChannelAction::Kick(pending)));
        }

        if self.cur.is_none() {
            tracing::info!(owner = %self.owner, "requested channel leave");
            out.push(HybridAction::Channel(ChannelAction::LeaveSelf));
        }
    }

    /// Someone who sends two closing messages in a row wants to leave.
    fn on_maybe_leave_intent(
        &mut self,
        slot: Slot,
        id: MessageId,
        out: &mut Vec<HybridAction>,
    ) {
        let author = {
            let Some(sub) = self.sub(slot) else { return };
            let transcript = sub.session.transcript();
            let Some(message) = transcript.get(&id) else { return };
            if !message.body.is_close() || message.author == self.owner {
                return;
            }
            let Some(parent) = message.parents.single().and_then(|parent| transcript.get(parent))
            else {
                return;
            };
            if !parent.body.is_close() || parent.author != message.author {
                return;
            }
            message.author.clone()
        };

        if self.cur_members().contains(&author) && !self.task_exclude.contains(&author) {
            tracing::info!(
                owner = %self.owner,
                member = %author,
                "added to task_exclude: leave intent"
            );
            self.task_exclude.insert(author);
            self.maybe_handle_tasks(out);
        }
    }

    /// Turn sub-session actions into session actions.
    fn absorb(
        &mut self,
        slot: Slot,
        actions: Vec<SessionAction>,
        out: &mut Vec<HybridAction>,
    ) {
        for action in actions {
            match action {
                SessionAction::Send { ciphertext, recipients } => {
                    out.push(HybridAction::Channel(ChannelAction::Send {
                        packet: ciphertext,
                        recipients,
                    }));
                },
                SessionAction::Event(event) => self.on_session_event(slot, event, out),
            }
        }
    }

    fn on_session_event(
        &mut self,
        slot: Slot,
        event: SessionEvent,
        out: &mut Vec<HybridAction>,
    ) {
        let Some(sub_session) = self.sub(slot).map(|sub| sub.session.sub_session_id()) else {
            return;
        };
        match event {
            SessionEvent::MsgAccepted { id } => {
                let entry = self.sub(slot).and_then(|sub| {
                    let message = sub.session.transcript().get(&id)?;
                    let MessageBody::Payload(payload) = &message.body else { return None };
                    Some(LogEntry {
                        sub_session,
                        id,
                        author: message.author.clone(),
                        parents: message.parents.clone(),
                        payload: payload.clone(),
                    })
                });
                if let Some((author, known, expire_after)) =
                    self.sub(slot).and_then(|sub| sub.session.freshness(&id))
                {
                    self.presence.renew(&author, known, expire_after);
                }
                if let Some(entry) = entry {
                    let event = HybridEvent::MessageAccepted {
                        sub_session,
                        id,
                        author: entry.author.clone(),
                        payload: entry.payload.clone(),
                    };
                    if self.messages.push(entry) {
                        out.push(HybridAction::Event(event));
                    }
                }
                self.on_maybe_leave_intent(slot, id, out);
            },
            SessionEvent::MsgFullyAcked { id } => {
                let closed = self.sub(slot).and_then(|sub| {
                    let message = sub.session.transcript().get(&id)?;
                    if !message.body.is_close() {
                        return None;
                    }
                    sub.session.freshness(&id).map(|(author, known, _)| (author, known))
                });
                if let Some((author, known)) = closed {
                    tracing::debug!(
                        owner = %self.owner,
                        member = %author,
                        "member absent: close fully acked"
                    );
                    self.presence.absent(&author, known);
                }
                if self.messages.contains(&id) {
                    out.push(HybridAction::Event(HybridEvent::MessageFullyAcked { id }));
                }
            },
            SessionEvent::NotFullyAcked { id } => {
                if self.messages.contains(&id) {
                    out.push(HybridAction::Event(HybridEvent::NotFullyAcked { id }));
                }
            },
            SessionEvent::NotAccepted { author, parents } => {
                out.push(HybridAction::Event(HybridEvent::NotAccepted {
                    sub_session,
                    author,
                    parents,
                }));
            },
            // Reported as the session state by note_state.
            SessionEvent::StateChanged { .. } => {},
            SessionEvent::Fin { consistent, .. } => {
                out.push(HybridAction::Event(HybridEvent::FinComplete { sub_session, consistent }));
                if slot == Slot::Prev {
                    self.on_prev_session_fin(out);
                }
            },
        }
    }

    fn take_decrypt_buffer(&mut self) -> TrialBuffer<PacketId, Undecrypted> {
        std::mem::replace(
            &mut self.decrypt,
            TrialBuffer::new("decrypt", self.config.decrypt_overflow),
        )
    }

    fn try_decrypt(
        &mut self,
        packet: Bytes,
        sender: MemberId,
        now: Instant,
        out: &mut Vec<HybridAction>,
    ) {
        let item = Undecrypted { id: PacketId::digest(&packet), packet, sender };
        let mut buffer = self.take_decrypt_buffer();
        buffer.trial(item, now, &mut DecryptTarget { hybrid: self, now, actions: out });
        self.decrypt = buffer;
    }

    fn retry_decrypt(&mut self, now: Instant, out: &mut Vec<HybridAction>) {
        let mut buffer = self.take_decrypt_buffer();
        buffer.retry(&mut DecryptTarget { hybrid: self, now, actions: out });
        self.decrypt = buffer;
    }

    /// Offer a packet to the current, then the previous sub-session.
    fn deliver(&mut self, item: &Undecrypted, now: Instant, out: &mut Vec<HybridAction>) -> bool {
        for slot in [Slot::Cur, Slot::Prev] {
            let result = match self.sub_mut(slot) {
                Some(sub) if !sub.session.is_stopped() => {
                    sub.session.recv(&item.packet, &item.sender, now)
                },
                _ => continue,
            };
            match result {
                Ok(actions) => {
                    self.absorb(slot, actions, out);
                    return true;
                },
                Err(SessionError::Authentication(_)) => {},
                Err(err) => {
                    tracing::warn!(
                        owner = %self.owner,
                        sender = %item.sender,
                        error = %err,
                        "sub-session refused packet"
                    );
                },
            }
        }
        false
    }
}

fn push_greet_sends(sends: Vec<GreetSend>, out: &mut Vec<HybridAction>) {
    out.extend(sends.into_iter().map(|send| {
        let GreetSend { packet, recipients } = send;
        HybridAction::Channel(ChannelAction::Send { packet, recipients })
    }));
}

/// Decryption of buffered packets by the live sub-sessions.
struct DecryptTarget<'a, G, F>
where
    G: Greeter,
    F: SecurityFactory<G::State>,
{
    hybrid: &'a mut HybridSession<G, F>,
    now: Instant,
    actions: &'a mut Vec<HybridAction>,
}

impl<G, F> TrialTarget for DecryptTarget<'_, G, F>
where
    G: Greeter,
    F: SecurityFactory<G::State>,
{
    type Item = Undecrypted;
    type Key = PacketId;

    fn identity(&self, item: &Undecrypted) -> PacketId {
        item.id
    }

    fn max_capacity(&self) -> usize {
        self.hybrid.flow.asynchronity(self.hybrid.cur_members().len())
    }

    fn try_accept(&mut self, _pending: bool, item: Undecrypted) -> Result<(), Undecrypted> {
        if self.hybrid.deliver(&item, self.now, self.actions) { Ok(()) } else { Err(item) }
    }

    fn on_drop(&mut self, item: Undecrypted, reason: DropReason) {
        if reason == DropReason::Expired {
            tracing::debug!(
                owner = %self.hybrid.owner,
                sender = %item.sender,
                packet = %item.id,
                "packet not decrypted before expiry"
            );
            self.actions.push(HybridAction::Event(HybridEvent::NotDecrypted {
                sender: item.sender,
                size: item.packet.len(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashMap, rc::Rc, time::Duration};

    use super::*;
    use crate::{
        flow::{DefaultFlowControl, FlowConfig},
        session::tests::{MockSecurity, SharedLedger},
    };

    /// Greeter that recognises the proposals it encoded and cannot run any.
    #[derive(Default)]
    struct StubGreeter {
        known: Rc<RefCell<HashMap<Bytes, OpPacket>>>,
    }

    struct StubGreeting {
        initial: PacketId,
        members: MemberSet,
        metadata: GreetingMetadata,
    }

    impl Greeting for StubGreeting {
        type State = ();

        fn initial_id(&self) -> PacketId {
            self.initial
        }

        fn members(&self) -> &MemberSet {
            &self.members
        }

        fn prev_members(&self) -> &MemberSet {
            &self.members
        }

        fn metadata(&self) -> &GreetingMetadata {
            &self.metadata
        }

        fn metadata_is_authenticated(&self) -> bool {
            false
        }

        fn recv(&mut self, _: &[u8], _: &MemberId) -> Result<Option<Vec<GreetSend>>, GreetError> {
            Ok(None)
        }

        fn take_outcome(&mut self) -> Option<GreetOutcome<()>> {
            None
        }
    }

    impl Greeter for StubGreeter {
        type State = ();
        type Greeting = StubGreeting;

        fn partial_decode(&self, packet: &[u8], _sender: &MemberId) -> Option<OpPacket> {
            self.known.borrow().get(packet).cloned()
        }

        fn decode(
            &mut self,
            _owner: &MemberId,
            _prev_state: Option<&()>,
            _prev_members: &MemberSet,
            _packet: &[u8],
            _sender: &MemberId,
        ) -> Result<StubGreeting, GreetError> {
            Err(GreetError::Malformed("stub".into()))
        }

        fn encode(
            &mut self,
            _prev_state: Option<&()>,
            _prev_members: &MemberSet,
            members: &MemberSet,
            metadata: GreetingMetadata,
        ) -> Result<Bytes, GreetError> {
            let mut known = self.known.borrow_mut();
            let packet = Bytes::from(format!("proposal-{}", known.len()));
            let op = OpPacket {
                id: PacketId::digest(&packet),
                sender: metadata.author.clone(),
                kind: OpKind::Initial { metadata, members: members.clone() },
            };
            known.insert(packet.clone(), op);
            Ok(packet)
        }
    }

    struct StubFactory {
        ledger: SharedLedger,
    }

    impl SecurityFactory<()> for StubFactory {
        type Security = MockSecurity;

        fn create(&mut self, _: &MemberId, _: SubSessionId, _: &MemberSet, _: &()) -> MockSecurity {
            MockSecurity { ledger: Rc::clone(&self.ledger), replay: None }
        }
    }

    type Stub = HybridSession<StubGreeter, StubFactory>;

    fn group(names: &[&str]) -> MemberSet {
        names.iter().map(|name| MemberId::from(*name)).collect()
    }

    fn alice() -> Stub {
        HybridSession::new(
            MemberId::from("alice"),
            SessionId::new(7),
            StubGreeter::default(),
            StubFactory { ledger: SharedLedger::default() },
            Arc::new(DefaultFlowControl::new(FlowConfig {
                broadcast_latency: Duration::from_secs(1),
                ..FlowConfig::default()
            })),
            HybridConfig::default(),
        )
    }

    fn sent_packets(actions: &[HybridAction]) -> Vec<Bytes> {
        actions
            .iter()
            .filter_map(|action| match action {
                HybridAction::Channel(ChannelAction::Send { packet, .. }) => Some(packet.clone()),
                _ => None,
            })
            .collect()
    }

    fn completed(actions: &[HybridAction]) -> Vec<(OperationId, Result<(), HybridError>)> {
        actions
            .iter()
            .filter_map(|action| match action {
                HybridAction::Event(HybridEvent::OperationCompleted { id, result }) => {
                    Some((*id, result.clone()))
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fresh_session_is_parted_and_alone() {
        let session = alice();
        assert_eq!(session.state(), SessionState::Parted);
        assert_eq!(session.cur_members(), group(&["alice"]));
        assert!(session.is_consistent());
        assert!(session.next_deadline().is_none());
    }

    #[test]
    fn send_without_sub_session_fails() {
        let now = Instant::now();
        let mut session = alice();
        assert_eq!(
            session.send_data(Bytes::from_static(b"hi"), now),
            Err(HybridError::NoSession)
        );
    }

    #[test]
    fn proposals_need_sync_and_channel_presence() {
        let now = Instant::now();
        let mut session = alice();

        let err = session.change_membership(group(&["bob"]), MemberSet::new()).unwrap_err();
        assert_eq!(err, HybridError::NotSynced);

        session.handle_channel(ChannelInput::SelfEnter { members: group(&["alice"]) }, now);
        assert!(session.is_synced());

        let err = session.change_membership(group(&["bob"]), MemberSet::new()).unwrap_err();
        assert_eq!(err, HybridError::NotInChannel { missing: group(&["bob"]) });

        let err = session.change_membership(MemberSet::new(), MemberSet::new()).unwrap_err();
        assert_eq!(err, HybridError::NoChange);
    }

    #[test]
    fn repeated_request_returns_same_operation() {
        let now = Instant::now();
        let mut session = alice();
        session.handle_channel(ChannelInput::SelfEnter { members: group(&["alice"]) }, now);
        session.handle_channel(ChannelInput::Enter(group(&["bob", "carol"])), now);

        let (id, actions) =
            session.change_membership(group(&["bob"]), MemberSet::new()).unwrap();
        assert_eq!(sent_packets(&actions).len(), 1);

        let (again, actions) =
            session.change_membership(group(&["bob"]), MemberSet::new()).unwrap();
        assert_eq!(again, id);
        assert!(actions.is_empty());

        let err = session.change_membership(group(&["carol"]), MemberSet::new()).unwrap_err();
        assert_eq!(err, HybridError::OperationInProgress);
    }

    #[test]
    fn own_proposal_rejected_by_order_fails_operation() {
        let now = Instant::now();
        let mut session = alice();
        session.handle_channel(ChannelInput::SelfEnter { members: group(&["alice"]) }, now);
        session.handle_channel(ChannelInput::Enter(group(&["bob"])), now);

        let (id, actions) =
            session.change_membership(group(&["bob"]), MemberSet::new()).unwrap();
        let proposal = sent_packets(&actions).remove(0);

        // Bob leaves before the server relays the proposal back.
        session.handle_channel(ChannelInput::Leave(group(&["bob"])), now);
        let actions = session.handle_channel(
            ChannelInput::Packet { packet: proposal.clone(), sender: MemberId::from("alice") },
            now,
        );

        assert_eq!(
            completed(&actions),
            vec![(id, Err(HybridError::ProposalRejected { packet: PacketId::digest(&proposal) }))]
        );
        assert!(session.change_membership(group(&["bob"]), MemberSet::new()).is_err());
    }

    #[test]
    fn accepted_but_undecodable_proposal_fails_operation() {
        let now = Instant::now();
        let mut session = alice();
        session.handle_channel(ChannelInput::SelfEnter { members: group(&["alice"]) }, now);
        session.handle_channel(ChannelInput::Enter(group(&["bob"])), now);

        let (id, actions) =
            session.change_membership(group(&["bob"]), MemberSet::new()).unwrap();
        let proposal = sent_packets(&actions).remove(0);
        let actions = session.handle_channel(
            ChannelInput::Packet { packet: proposal, sender: MemberId::from("alice") },
            now,
        );

        let done = completed(&actions);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0, id);
        assert!(matches!(done[0].1, Err(HybridError::Greeting(GreetError::Malformed(_)))));
    }

    #[test]
    fn parting_alone_leaves_the_channel() {
        let now = Instant::now();
        let mut session = alice();
        assert_eq!(session.part(now).unwrap_err(), HybridError::NoSession);

        session.handle_channel(ChannelInput::SelfEnter { members: group(&["alice"]) }, now);
        let (id, actions) = session.part(now).unwrap();
        assert_eq!(actions, vec![HybridAction::Channel(ChannelAction::LeaveSelf)]);
        assert_eq!(
            session.send_data(Bytes::from_static(b"x"), now),
            Err(HybridError::OperationInProgress)
        );

        let actions = session.handle_channel(ChannelInput::SelfLeave, now);
        assert_eq!(completed(&actions), vec![(id, Ok(()))]);
        assert!(session.channel_members().is_none());
        assert!(!session.is_synced());
    }

    #[test]
    fn reentry_of_member_awaiting_kick_is_ignored() {
        let now = Instant::now();
        let mut session = alice();
        session.handle_channel(ChannelInput::SelfEnter { members: group(&["alice"]) }, now);
        session.task_leave.insert(MemberId::from("bob"));

        let actions = session.handle_channel(ChannelInput::Enter(group(&["bob"])), now);
        assert!(actions.is_empty());
        assert_eq!(session.channel_members(), Some(&group(&["alice"])));
        assert!(session.task_leave.contains(&MemberId::from("bob")));

        session.handle_channel(ChannelInput::Enter(group(&["bob", "carol"])), now);
        assert_eq!(session.channel_members(), Some(&group(&["alice", "carol"])));
    }

    #[test]
    fn undecryptable_packets_expire_as_not_decrypted() {
        let now = Instant::now();
        let mut session = alice();
        session.handle_channel(ChannelInput::SelfEnter { members: group(&["alice"]) }, now);

        let actions = session.handle_channel(
            ChannelInput::Packet {
                packet: Bytes::from_static(b"for another sub-session"),
                sender: MemberId::from("bob"),
            },
            now,
        );
        assert!(actions.is_empty());

        let deadline = session.next_deadline().unwrap();
        assert_eq!(deadline, now + Duration::from_secs(1));
        assert_eq!(
            session.tick(deadline),
            vec![HybridAction::Event(HybridEvent::NotDecrypted {
                sender: MemberId::from("bob"),
                size: 23,
            })]
        );
        assert!(session.next_deadline().is_none());
    }
}
