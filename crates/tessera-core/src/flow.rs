//! Flow control: how long the protocol waits for the network.
//!
//! All timing decisions of the session layer derive from one number, the
//! broadcast latency: how long a packet takes to reach every member. From it
//! the [`FlowControl`] derives the full-ack interval (how long a message
//! takes to collect acknowledgements from everyone), the monitor checkpoints
//! and the sizes of the retry buffers.

use std::{sync::Arc, time::Duration};

use crate::constants::{
    DECRYPT_BUFFER_FLOOR, DECRYPT_BUFFER_PER_MEMBER, DEFAULT_BROADCAST_LATENCY,
    DEFAULT_MONITOR_BACKOFF,
};

/// Timing and sizing policy of a session.
pub trait FlowControl {
    /// Expected time for one broadcast to reach every member.
    fn broadcast_latency(&self) -> Duration;

    /// Expected time for a message to be acknowledged by all `members`.
    fn full_ack_interval(&self, members: usize) -> Duration;

    /// Offsets (from acceptance) at which the consistency monitor checks a
    /// message. The last one is the final deadline.
    fn full_ack_checkpoints(&self, members: usize) -> Vec<Duration>;

    /// Offsets at which we check that we have acknowledged a message
    /// ourselves. Empty for our own messages.
    fn own_ack_intervals(&self, owned: bool, members: usize) -> Vec<Duration>;

    /// How many undecryptable packets to buffer: the amount of reordering we
    /// expect from a channel serving `members` members.
    fn asynchronity(&self, members: usize) -> usize;
}

/// Flow control shared by a session and all its sub-sessions.
pub type SharedFlowControl = Arc<dyn FlowControl + Send + Sync>;

/// Configuration of [`DefaultFlowControl`].
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Expected time for one broadcast to reach every member
    pub broadcast_latency: Duration,
    /// Full-ack checkpoints as multiples of the full-ack interval
    pub monitor_backoff: Vec<u32>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            broadcast_latency: DEFAULT_BROADCAST_LATENCY,
            monitor_backoff: DEFAULT_MONITOR_BACKOFF.to_vec(),
        }
    }
}

/// Flow control with a fixed broadcast latency.
///
/// A message needs one latency to reach everyone and one for the replies to
/// come back; acknowledgements relayed through other members add one latency
/// per doubling of the group. Hence `latency * (2 + ceil(log2 n))`.
#[derive(Debug, Clone, Default)]
pub struct DefaultFlowControl {
    config: FlowConfig,
}

impl DefaultFlowControl {
    /// Create from configuration.
    pub fn new(config: FlowConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &FlowConfig {
        &self.config
    }
}

fn ceil_log2(n: usize) -> u32 {
    if n <= 1 { 0 } else { usize::BITS - (n - 1).leading_zeros() }
}

impl FlowControl for DefaultFlowControl {
    fn broadcast_latency(&self) -> Duration {
        self.config.broadcast_latency
    }

    fn full_ack_interval(&self, members: usize) -> Duration {
        self.config.broadcast_latency * (2 + ceil_log2(members))
    }

    fn full_ack_checkpoints(&self, members: usize) -> Vec<Duration> {
        let interval = self.full_ack_interval(members);
        self.config.monitor_backoff.iter().map(|ratio| interval * *ratio).collect()
    }

    fn own_ack_intervals(&self, owned: bool, members: usize) -> Vec<Duration> {
        if owned {
            return Vec::new();
        }
        vec![self.full_ack_interval(members).saturating_sub(self.config.broadcast_latency)]
    }

    fn asynchronity(&self, members: usize) -> usize {
        (members * DECRYPT_BUFFER_PER_MEMBER).max(DECRYPT_BUFFER_FLOOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_ack_interval_grows_logarithmically() {
        let flow = DefaultFlowControl::default();
        let latency = flow.broadcast_latency();

        assert_eq!(flow.full_ack_interval(1), latency * 2);
        assert_eq!(flow.full_ack_interval(2), latency * 3);
        assert_eq!(flow.full_ack_interval(3), latency * 4);
        assert_eq!(flow.full_ack_interval(4), latency * 4);
        assert_eq!(flow.full_ack_interval(5), latency * 5);
    }

    #[test]
    fn checkpoints_back_off() {
        let flow = DefaultFlowControl::default();
        let interval = flow.full_ack_interval(3);
        assert_eq!(flow.full_ack_checkpoints(3), vec![interval, interval * 2, interval * 4]);
    }

    #[test]
    fn own_ack_checks_only_for_others_messages() {
        let flow = DefaultFlowControl::new(FlowConfig {
            broadcast_latency: Duration::from_millis(100),
            ..FlowConfig::default()
        });

        assert!(flow.own_ack_intervals(true, 3).is_empty());
        assert_eq!(flow.own_ack_intervals(false, 3), vec![Duration::from_millis(300)]);
    }

    #[test]
    fn asynchronity_has_a_floor() {
        let flow = DefaultFlowControl::default();
        assert_eq!(flow.asynchronity(1), DECRYPT_BUFFER_FLOOR);
        assert_eq!(flow.asynchronity(100), 800);
    }
}
