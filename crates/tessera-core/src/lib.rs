//! Tessera session layer core logic
//!
//! This crate contains the pure state machine logic of a multi-party
//! encrypted group messaging session. It is completely decoupled from I/O,
//! enabling deterministic testing.
//!
//! # Architecture: "The Hollow Shell"
//!
//! Session logic is strictly separated from cryptography and transport:
//!
//! ```text
//!      ┌──────────────────────────────────┐
//!      │ tessera-core                     │
//!      │ - Causal transcript              │
//!      │ - Consistency monitoring         │
//!      │ - Sub-session rotation           │
//!      └──────────────────────────────────┘
//!         ↑ traits                 ↓ actions
//! ┌──────────────────┐  ┌──────────────────┐
//! │ collaborators    │  │ driver           │
//! │ - MessageSecurity│  │ - channel I/O    │
//! │ - Greeter        │  │ - clock, ticks   │
//! │ - FlowControl    │  │ - app events     │
//! └──────────────────┘  └──────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - No I/O in Core: every operation takes `now` and returns actions
//! - No Callbacks: events are returned, never published, so there is no
//!   reentrancy
//! - Deadlines, not Timers: `next_deadline()` says when to call `tick(now)`
//!
//! # Modules
//!
//! - [`set`]: persistent membership sets
//! - [`trial_buffer`]: retry buffer for out-of-order input
//! - [`transcript`]: causal message DAG with acknowledgement tracking
//! - [`consistency`]: per-message full-acknowledgement watchdog
//! - [`session`]: one fixed-membership sub-session
//! - [`server_order`]: linearizes membership proposals
//! - [`hybrid`]: the logical session across sub-session rotations
//! - [`presence`]: who is around, as seen through the transcript
//! - [`security`], [`greeter`], [`flow`], [`channel`]: collaborator seams
//! - [`env`]: environment abstraction (time, RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod consistency;
pub mod constants;
pub mod env;
pub mod error;
pub mod flow;
pub mod greeter;
pub mod hybrid;
pub mod message;
pub mod message_log;
pub mod presence;
pub mod security;
pub mod server_order;
pub mod session;
pub mod set;
pub mod transcript;
pub mod trial_buffer;

pub use error::{HybridError, SessionError};
pub use set::MemberSet;
