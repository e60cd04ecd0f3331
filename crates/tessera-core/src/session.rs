//! One fixed-membership sub-session.
//!
//! A [`SessionBase`] ties together a [`Transcript`], a
//! [`ConsistencyMonitor`] and the [`MessageSecurity`] of one sub-session.
//! Its membership never changes: membership change is implemented by the
//! [`HybridSession`](crate::hybrid::HybridSession) creating a new
//! `SessionBase` and parting from the old one.
//!
//! # Architecture: Action-Based State Machine
//!
//! - Methods accept time as parameter
//! - Methods return `Vec<SessionAction>`: ciphertext to send and events to
//!   report
//! - Timers are deadlines: [`SessionBase::next_deadline`] says when
//!   [`SessionBase::tick`] must run next
//!
//! # State Machine
//!
//! ```text
//! ┌────────┐  fin()   ┌─────────┐  close fully acked  ┌────────┐
//! │ Joined │─────────>│ Parting │────────────────────>│ Parted │
//! └────────┘          └─────────┘                     └────────┘
//!                          │ fin timeout, payload unacked
//!                          ↓
//!                     ┌────────────┐
//!                     │ PartFailed │
//!                     └────────────┘
//! ```
//!
//! Only `Joined` permits sending a payload or a closing consistency message.
//!
//! # Sending
//!
//! Encrypt, add to the transcript, and only then commit the pending secret
//! and emit the ciphertext. A message the transcript rejects is never sent.
//!
//! # Receiving
//!
//! Decrypt and authenticate, decode, then try to accept into the transcript
//! through a [`TrialBuffer`]: a message whose parents have not arrived waits
//! until they do, or until it expires after one broadcast latency.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tessera_proto::{MemberId, MessageBody, MessageId, SubSessionId};

use crate::{
    consistency::{ConsistencyMonitor, MonitorEvent, WatchPlan},
    constants::{
        ACCEPT_BUFFER_FACTOR, ACCEPT_BUFFER_FLOOR, ACCEPT_BUFFER_PER_SQRT_MEMBER,
        EXPIRE_GRACE_RATIO, FIN_CONSISTENT_RATIO, FIN_TIMEOUT_RATIO, HEARTBEAT_RATIO,
    },
    error::SessionError,
    flow::SharedFlowControl,
    message::{Message, MessageSet},
    security::{Decrypted, MessageSecurity, PendingSecret},
    set::MemberSet,
    transcript::{Transcript, TranscriptError},
    trial_buffer::{DropReason, OverflowPolicy, TrialBuffer, TrialTarget},
};

/// Sub-session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Sending and receiving normally
    Joined,
    /// Close sent, waiting for it to be acknowledged
    Parting,
    /// Parted with a consistent transcript
    Parted,
    /// Parted with payloads left unacknowledged
    PartFailed,
}

impl SessionState {
    /// True for `Parted` and `PartFailed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Parted | Self::PartFailed)
    }
}

/// Events reported by a sub-session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Message entered the transcript
    MsgAccepted {
        /// Accepted message
        id: MessageId,
    },
    /// Every recipient acknowledged the message
    MsgFullyAcked {
        /// Acknowledged message
        id: MessageId,
    },
    /// The message missed its final full-ack deadline
    NotFullyAcked {
        /// Late message
        id: MessageId,
    },
    /// An authenticated message never got its parents and was dropped
    NotAccepted {
        /// Author of the dropped message
        author: MemberId,
        /// Parents that never arrived (some of them)
        parents: MessageSet,
    },
    /// State transition
    StateChanged {
        /// Previous state
        old: SessionState,
        /// New state
        new: SessionState,
    },
    /// Parting finished; reported before the final state change
    Fin {
        /// Our closing message
        last: MessageId,
        /// Whether the transcript was consistent at the end
        consistent: bool,
    },
}

/// Actions returned by the sub-session state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Broadcast this ciphertext
    Send {
        /// Encrypted message
        ciphertext: Bytes,
        /// Intended recipients
        recipients: MemberSet,
    },
    /// Report an event
    Event(SessionEvent),
}

/// Sub-session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Give up parting after this many broadcast latencies
    pub fin_timeout_ratio: u32,
    /// Wait this many broadcast latencies after our close is fully acked
    pub fin_consistent_ratio: u32,
    /// Presence expiry, in full-ack intervals
    pub heartbeat_ratio: u32,
    /// Extra slack given to others' presence
    pub expire_grace_ratio: f64,
    /// What the accept buffer does when over capacity
    pub accept_overflow: OverflowPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fin_timeout_ratio: FIN_TIMEOUT_RATIO,
            fin_consistent_ratio: FIN_CONSISTENT_RATIO,
            heartbeat_ratio: HEARTBEAT_RATIO,
            expire_grace_ratio: EXPIRE_GRACE_RATIO,
            accept_overflow: OverflowPolicy::Drop,
        }
    }
}

/// A decrypted message waiting for its parents.
#[derive(Debug)]
pub struct PendingMessage<T> {
    message: Message,
    secret: T,
}

#[derive(Debug, Clone, Copy)]
struct FinWait {
    close: MessageId,
    deadline: Instant,
    acked: bool,
}

/// One fixed-membership sub-session.
pub struct SessionBase<S: MessageSecurity> {
    owner: MemberId,
    sub_session_id: SubSessionId,
    members: MemberSet,
    state: SessionState,
    config: SessionConfig,
    flow: SharedFlowControl,
    security: S,
    transcript: Transcript,
    monitor: ConsistencyMonitor,
    accept: TrialBuffer<MessageId, PendingMessage<S::Secret>>,
    ctime: HashMap<MessageId, Instant>,
    ktime: HashMap<MessageId, Instant>,
    fin: Option<FinWait>,
    stopped: bool,
}

impl<S: MessageSecurity> std::fmt::Debug for SessionBase<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBase")
            .field("owner", &self.owner)
            .field("sub_session_id", &self.sub_session_id)
            .field("members", &self.members)
            .field("state", &self.state)
            .field("transcript_len", &self.transcript.len())
            .field("unacked", &self.transcript.unacked_len())
            .field("buffered", &self.accept.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl<S: MessageSecurity> SessionBase<S> {
    /// Create a joined sub-session. `members` must contain `owner`.
    pub fn new(
        owner: MemberId,
        sub_session_id: SubSessionId,
        members: MemberSet,
        security: S,
        flow: SharedFlowControl,
        config: SessionConfig,
    ) -> Self {
        debug_assert!(members.contains(&owner), "owner must be a member");
        let accept = TrialBuffer::new("accept", config.accept_overflow);
        Self {
            monitor: ConsistencyMonitor::new(owner.clone()),
            owner,
            sub_session_id,
            members,
            state: SessionState::Joined,
            config,
            flow,
            security,
            transcript: Transcript::new(),
            accept,
            ctime: HashMap::new(),
            ktime: HashMap::new(),
            fin: None,
            stopped: false,
        }
    }

    /// Our member id.
    #[must_use]
    pub fn owner(&self) -> &MemberId {
        &self.owner
    }

    /// Id of this sub-session.
    #[must_use]
    pub fn sub_session_id(&self) -> SubSessionId {
        self.sub_session_id
    }

    /// Fixed membership, including us.
    #[must_use]
    pub fn members(&self) -> &MemberSet {
        &self.members
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Read-only transcript.
    #[must_use]
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// When `id` was accepted.
    #[must_use]
    pub fn ctime(&self, id: &MessageId) -> Option<Instant> {
        self.ctime.get(id).copied()
    }

    /// When `id` became fully acknowledged.
    #[must_use]
    pub fn ktime(&self, id: &MessageId) -> Option<Instant> {
        self.ktime.get(id).copied()
    }

    /// True if we authored `id`.
    #[must_use]
    pub fn owns(&self, id: &MessageId) -> bool {
        self.transcript.get(id).is_some_and(|message| message.author == self.owner)
    }

    /// Our latest message.
    #[must_use]
    pub fn last_own_msg(&self) -> Option<MessageId> {
        self.transcript.last_by(&self.owner)
    }

    /// False for messages that need no liveness monitoring (explicit acks).
    #[must_use]
    pub fn needs_ack_monitor(&self, id: &MessageId) -> bool {
        self.transcript.get(id).is_some_and(|message| !message.body.is_explicit_ack())
    }

    /// True once the sub-session was stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// True if no payload is waiting for acknowledgement.
    ///
    /// Outstanding explicit acks and consistency messages do not count.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        !self
            .transcript
            .unacked()
            .any(|id| self.transcript.get(id).is_some_and(|message| message.body.is_payload()))
    }

    fn broadcast_latency(&self, ratio: u32) -> Duration {
        self.flow.broadcast_latency() * ratio
    }

    fn full_ack_interval(&self) -> Duration {
        self.flow.full_ack_interval(self.members.len())
    }

    fn accept_capacity(&self) -> usize {
        let n = self.members.len() as f64;
        let slots = ACCEPT_BUFFER_FACTOR
            * ACCEPT_BUFFER_FLOOR.max(n.sqrt() * ACCEPT_BUFFER_PER_SQRT_MEMBER);
        slots.ceil() as usize
    }

    /// How long others should consider us present after our last message.
    #[must_use]
    pub fn own_expiry(&self) -> Duration {
        self.full_ack_interval() * self.config.heartbeat_ratio
    }

    /// How long the author of `id` should be considered present after it.
    ///
    /// Others get slightly longer than ourselves, so we expire them no sooner
    /// than they expire themselves.
    #[must_use]
    pub fn presence_expiry(&self, id: &MessageId) -> Option<Duration> {
        let message = self.transcript.get(id)?;
        let expiry = self.own_expiry();
        if message.author == self.owner {
            Some(expiry)
        } else {
            Some(expiry.mul_f64(self.config.expire_grace_ratio))
        }
    }

    /// What accepting `id` tells us about its author's presence: the author,
    /// when they were known to be around, and how long that lasts.
    ///
    /// Known is the acceptance of our latest own message at or before `id`;
    /// `None` if the author had seen nothing from us yet.
    #[must_use]
    pub fn freshness(&self, id: &MessageId) -> Option<(MemberId, Option<Instant>, Duration)> {
        let message = self.transcript.get(id)?;
        let known = self.transcript.pre_ruid(id, &self.owner).and_then(|own| self.ctime(&own));
        Some((message.author.clone(), known, self.presence_expiry(id)?))
    }

    /// Earliest time at which [`SessionBase::tick`] has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.stopped {
            return None;
        }
        [
            self.accept.next_expiry(self.flow.broadcast_latency()),
            self.monitor.next_deadline(),
            self.fin.map(|fin| fin.deadline),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn set_state(&mut self, new: SessionState, actions: &mut Vec<SessionAction>) {
        let old = self.state;
        if old == new {
            return;
        }
        tracing::info!(
            owner = %self.owner,
            sub_session = %self.sub_session_id,
            ?old,
            ?new,
            "sub-session state changed"
        );
        self.state = new;
        actions.push(SessionAction::Event(SessionEvent::StateChanged { old, new }));
    }

    /// Send application data, or a manual acknowledgement if `contents` is
    /// empty.
    ///
    /// # Errors
    ///
    /// See [`SessionBase::send_object`].
    pub fn send_data(
        &mut self,
        contents: Bytes,
        now: Instant,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let body = if contents.is_empty() {
            MessageBody::ExplicitAck { manual: true }
        } else {
            MessageBody::Payload(contents)
        };
        self.send_object(body, now)
    }

    /// Encrypt `body`, add it to the transcript and send it.
    ///
    /// # Errors
    ///
    /// - `NotJoined` if `body` requires the joined state; nothing happens
    /// - `InvalidState` once stopped
    /// - `InvalidMessage` if the transcript rejected the message; the pending
    ///   secret is destroyed and nothing is sent
    /// - `Codec` / `Security` if encoding or encryption failed
    pub fn send_object(
        &mut self,
        body: MessageBody,
        now: Instant,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if self.stopped {
            return Err(SessionError::InvalidState { state: self.state, operation: "send" });
        }
        if body.requires_joined() && self.state != SessionState::Joined {
            return Err(SessionError::NotJoined { state: self.state });
        }

        let plaintext = body.encode()?;
        let parents = self.transcript.max();
        let recipients = self.members.without(&self.owner);
        let (ciphertext, secret) = self.security.auth_encrypt(
            &self.transcript,
            &self.owner,
            &parents,
            &recipients,
            &plaintext,
        )?;

        let id = MessageId::digest(&ciphertext);
        debug_assert_eq!(secret.message_id(), id, "secret must belong to the ciphertext");

        let message = Message {
            id,
            author: self.owner.clone(),
            parents,
            recipients: recipients.clone(),
            body,
        };
        let mut actions = Vec::new();
        if let Err(err) = self.add_message(message, now, &mut actions) {
            secret.destroy();
            tracing::warn!(
                owner = %self.owner,
                sub_session = %self.sub_session_id,
                id = %id,
                error = %err,
                "own message rejected by transcript, not sent"
            );
            return Err(SessionError::InvalidMessage(err.to_string()));
        }
        secret.commit();

        actions.push(SessionAction::Send { ciphertext, recipients });
        Ok(actions)
    }

    /// Process a ciphertext received from `sender`.
    ///
    /// Returns `Ok` with no actions for duplicates, for malformed bodies (the
    /// message authenticated, so it is consumed) and for messages still
    /// waiting for their parents.
    ///
    /// # Errors
    ///
    /// - `Authentication` if the ciphertext is not for this sub-session
    /// - `InvalidState` once stopped
    pub fn recv(
        &mut self,
        ciphertext: &[u8],
        sender: &MemberId,
        now: Instant,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if self.stopped {
            return Err(SessionError::InvalidState { state: self.state, operation: "recv" });
        }

        let id = MessageId::digest(ciphertext);
        if self.transcript.contains(&id) || self.accept.contains(&id) {
            return Ok(Vec::new());
        }

        let Decrypted { author, parents, recipients, plaintext, secret } =
            self.security.decrypt_verify(&self.transcript, ciphertext, sender)?;

        if author == self.owner {
            secret.destroy();
            tracing::warn!(
                owner = %self.owner,
                sub_session = %self.sub_session_id,
                id = %id,
                "received unknown message claiming to be our own"
            );
            return Ok(Vec::new());
        }

        let body = match MessageBody::decode(&plaintext) {
            Ok(body) => body,
            Err(err) => {
                secret.destroy();
                tracing::warn!(
                    owner = %self.owner,
                    sub_session = %self.sub_session_id,
                    id = %id,
                    author = %author,
                    error = %err,
                    "bad message from verified peer"
                );
                return Ok(Vec::new());
            },
        };

        let message = Message { id, author, parents, recipients, body };
        let mut actions = Vec::new();
        let mut buffer = self.take_accept_buffer();
        buffer.trial(
            PendingMessage { message, secret },
            now,
            &mut AcceptTarget { session: self, now, actions: &mut actions },
        );
        self.accept = buffer;
        Ok(actions)
    }

    fn take_accept_buffer(&mut self) -> TrialBuffer<MessageId, PendingMessage<S::Secret>> {
        std::mem::replace(&mut self.accept, TrialBuffer::new("accept", self.config.accept_overflow))
    }

    /// Add an authenticated message. Nothing changes on error.
    fn add_message(
        &mut self,
        message: Message,
        now: Instant,
        actions: &mut Vec<SessionAction>,
    ) -> Result<(), TranscriptError> {
        let members = message.members();
        if members != self.members {
            return Err(TranscriptError::MembershipMismatch {
                id: message.id,
                reason: format!("claims {} in sub-session of {}", members, self.members),
            });
        }

        let id = message.id;
        let owned = message.author == self.owner;
        let monitor = !message.body.is_explicit_ack();
        let fully_acked = self.transcript.add(message)?;

        self.ctime.insert(id, now);
        for acked in &fully_acked {
            self.ktime.insert(*acked, now);
        }

        let n = self.members.len();
        let plan = WatchPlan {
            full_ack: self.flow.full_ack_checkpoints(n),
            own_ack: self.flow.own_ack_intervals(owned, n),
            monitor,
        };
        self.monitor.expect(id, now, plan);

        actions.push(SessionAction::Event(SessionEvent::MsgAccepted { id }));
        for acked in fully_acked {
            if self.monitor.fully_acked(&acked) {
                self.on_fully_acked(acked, now, actions);
            }
        }
        Ok(())
    }

    fn on_fully_acked(&mut self, id: MessageId, now: Instant, actions: &mut Vec<SessionAction>) {
        actions.push(SessionAction::Event(SessionEvent::MsgFullyAcked { id }));
        let consistent_wait = self.broadcast_latency(self.config.fin_consistent_ratio);
        if let Some(fin) = self.fin.as_mut() {
            if fin.close == id && !fin.acked {
                fin.acked = true;
                fin.deadline = now + consistent_wait;
            }
        }
    }

    /// True if a payload was written after its author saw our close.
    fn violates_close(&self, message: &Message) -> bool {
        let Some(fin) = self.fin else { return false };
        message.body.is_payload()
            && message.parents.iter().any(|parent| self.transcript.is_ancestor(&fin.close, parent))
    }

    /// Start parting: send a closing consistency message and wait for it to
    /// be acknowledged.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless joined; errors of [`SessionBase::send_object`].
    pub fn fin(&mut self, now: Instant) -> Result<Vec<SessionAction>, SessionError> {
        if self.state != SessionState::Joined || self.stopped {
            return Err(SessionError::InvalidState { state: self.state, operation: "fin" });
        }

        let mut actions = self.send_object(MessageBody::Consistency { close: true }, now)?;
        let Some(close) = self.last_own_msg() else {
            return Err(SessionError::InvalidState { state: self.state, operation: "fin" });
        };
        debug_assert_eq!(self.transcript.max().single(), Some(&close));

        self.set_state(SessionState::Parting, &mut actions);
        let deadline = now + self.broadcast_latency(self.config.fin_timeout_ratio);
        self.fin = Some(FinWait { close, deadline, acked: false });

        // Alone in the sub-session, the close is acknowledged on creation.
        if self.transcript.is_fully_acked(&close) {
            let wait = self.broadcast_latency(self.config.fin_consistent_ratio);
            self.fin = Some(FinWait { close, deadline: now + wait, acked: true });
        }

        Ok(actions)
    }

    /// Run everything due at `now`: buffer expiry, monitor checkpoints,
    /// automatic acknowledgements and fin completion.
    pub fn tick(&mut self, now: Instant) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.stopped {
            return actions;
        }

        let ttl = self.flow.broadcast_latency();
        let mut buffer = self.take_accept_buffer();
        buffer.expire(now, ttl, &mut AcceptTarget { session: self, now, actions: &mut actions });
        self.accept = buffer;

        let transcript = &self.transcript;
        let events = self.monitor.tick(now, |id| transcript.unackby(id));
        for event in events {
            match event {
                MonitorEvent::FullyAcked(id) => {
                    self.ktime.entry(id).or_insert(now);
                    self.on_fully_acked(id, now, &mut actions);
                },
                MonitorEvent::NotFullyAcked(id) => {
                    tracing::debug!(
                        owner = %self.owner,
                        sub_session = %self.sub_session_id,
                        id = %id,
                        unackby = %self.transcript.unackby(&id),
                        "message not fully acked by final deadline"
                    );
                    actions.push(SessionAction::Event(SessionEvent::NotFullyAcked { id }));
                },
                MonitorEvent::UnackedByOwn(id) => self.handle_unacked_by_own(id, now, &mut actions),
            }
        }

        if let Some(fin) = self.fin {
            if now >= fin.deadline {
                self.publish_fin(fin, now, &mut actions);
            }
        }

        actions
    }

    fn handle_unacked_by_own(
        &mut self,
        id: MessageId,
        now: Instant,
        actions: &mut Vec<SessionAction>,
    ) {
        debug_assert!(!self.owns(&id));
        if self.transcript.suc_ruid(&id, &self.owner).is_some() {
            // An earlier automatic ack in this tick already covered it.
            return;
        }
        match self.send_object(MessageBody::ExplicitAck { manual: false }, now) {
            Ok(sent) => {
                debug_assert!(self.transcript.suc_ruid(&id, &self.owner).is_some());
                actions.extend(sent);
            },
            Err(err) => {
                tracing::warn!(
                    owner = %self.owner,
                    sub_session = %self.sub_session_id,
                    id = %id,
                    error = %err,
                    "failed to send automatic ack"
                );
            },
        }
    }

    fn publish_fin(&mut self, fin: FinWait, now: Instant, actions: &mut Vec<SessionAction>) {
        self.stop(now);
        let consistent = self.is_consistent();
        if !consistent {
            tracing::warn!(
                owner = %self.owner,
                sub_session = %self.sub_session_id,
                unacked = self.transcript.unacked_len(),
                "parted with unacknowledged payloads"
            );
        }
        actions.push(SessionAction::Event(SessionEvent::Fin { last: fin.close, consistent }));
        let state = if consistent { SessionState::Parted } else { SessionState::PartFailed };
        self.set_state(state, actions);
    }

    /// Stop monitoring, drop buffered messages and cancel all deadlines.
    ///
    /// Does not change the state; parting does that after stopping.
    pub fn stop(&mut self, now: Instant) {
        if self.stopped {
            return;
        }
        debug_assert!(
            self.monitor.len() == self.transcript.unacked_len()
                && self.transcript.unacked().all(|id| self.monitor.is_watching(id)),
            "monitored messages must match unacked messages"
        );
        self.monitor.stop();

        let mut discarded = Vec::new();
        let mut buffer = self.take_accept_buffer();
        buffer.clear(&mut AcceptTarget { session: self, now, actions: &mut discarded });
        debug_assert!(discarded.is_empty());

        self.fin = None;
        self.stopped = true;
    }
}

/// Acceptance of decrypted messages into the transcript.
struct AcceptTarget<'a, S: MessageSecurity> {
    session: &'a mut SessionBase<S>,
    now: Instant,
    actions: &'a mut Vec<SessionAction>,
}

impl<S: MessageSecurity> TrialTarget for AcceptTarget<'_, S> {
    type Item = PendingMessage<S::Secret>;
    type Key = MessageId;

    fn identity(&self, item: &Self::Item) -> MessageId {
        item.message.id
    }

    fn max_capacity(&self) -> usize {
        self.session.accept_capacity()
    }

    fn try_accept(&mut self, _pending: bool, item: Self::Item) -> Result<(), Self::Item> {
        let transcript = &self.session.transcript;
        if !item.message.parents.iter().all(|parent| transcript.contains(parent)) {
            return Err(item);
        }

        let PendingMessage { message, secret } = item;
        let id = message.id;
        let author = message.author.clone();

        if self.session.violates_close(&message) {
            secret.destroy();
            tracing::warn!(
                owner = %self.session.owner,
                sub_session = %self.session.sub_session_id,
                id = %id,
                author = %author,
                "payload sent after seeing our close"
            );
            return Ok(());
        }

        match self.session.add_message(message, self.now, self.actions) {
            Ok(()) => secret.commit(),
            Err(err) => {
                secret.destroy();
                tracing::warn!(
                    owner = %self.session.owner,
                    sub_session = %self.session.sub_session_id,
                    id = %id,
                    author = %author,
                    error = %err,
                    "bad message from verified peer"
                );
            },
        }
        // Accepted, possibly as invalid: never buffer it again.
        Ok(())
    }

    fn on_drop(&mut self, item: Self::Item, reason: DropReason) {
        let PendingMessage { message, secret } = item;
        secret.destroy();
        if reason == DropReason::Expired {
            tracing::debug!(
                owner = %self.session.owner,
                sub_session = %self.session.sub_session_id,
                id = %message.id,
                author = %message.author,
                "message not accepted before expiry"
            );
            self.actions.push(SessionAction::Event(SessionEvent::NotAccepted {
                author: message.author,
                parents: message.parents,
            }));
        }
    }
}
