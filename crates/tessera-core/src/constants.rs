//! Protocol constants.
//!
//! Durations are expressed as ratios of the broadcast latency reported by
//! [`FlowControl`](crate::flow::FlowControl), so the whole protocol speeds up
//! or slows down with the channel.

use std::time::Duration;

/// Broadcast latency assumed by [`FlowConfig::default`](crate::flow::FlowConfig).
pub const DEFAULT_BROADCAST_LATENCY: Duration = Duration::from_secs(2);

/// Full-ack checkpoints, as multiples of the full-ack interval.
///
/// The last entry is the final deadline after which a message is reported as
/// not fully acknowledged.
pub const DEFAULT_MONITOR_BACKOFF: [u32; 3] = [1, 2, 4];

/// Own presence expires after this many full-ack intervals of silence.
pub const HEARTBEAT_RATIO: u32 = 4;

/// Give up on a clean part after this many broadcast latencies.
pub const FIN_TIMEOUT_RATIO: u32 = 16;

/// After our close message is fully acked, wait this many broadcast latencies
/// for stragglers before finishing.
pub const FIN_CONSISTENT_RATIO: u32 = 1;

/// Others get slightly longer than ourselves before their presence expires.
pub const EXPIRE_GRACE_RATIO: f64 = 1.0625;

/// Lower bound of the accept-buffer sizing term.
pub const ACCEPT_BUFFER_FLOOR: f64 = 16.0;

/// Accept-buffer slots per square root of the member count.
pub const ACCEPT_BUFFER_PER_SQRT_MEMBER: f64 = 8.0;

/// Overall multiplier of the accept-buffer capacity.
pub const ACCEPT_BUFFER_FACTOR: f64 = 4.0;

/// Decrypt-buffer slots per member (see `FlowControl::asynchronity`).
pub const DECRYPT_BUFFER_PER_MEMBER: usize = 8;

/// Lower bound of the decrypt-buffer capacity.
pub const DECRYPT_BUFFER_FLOOR: usize = 32;

/// Number of consecutive closing consistency messages read as intent to leave.
pub const LEAVE_INTENT_CLOSES: u32 = 2;
