//! # Tessera Protocol: Identifiers and Message Bodies
//!
//! This crate holds the small set of wire-level types shared by every layer
//! of the Tessera session stack:
//!
//! - **Identifiers**: members are named by [`MemberId`]; messages, membership
//!   packets and sub-sessions by 32-byte content digests ([`MessageId`],
//!   [`PacketId`], [`SubSessionId`]); the logical conversation by a random
//!   [`SessionId`] that survives sub-session rotation.
//!
//! - **Message bodies**: [`MessageBody`] is the plaintext carried inside every
//!   authenticated transcript message. Bodies are CBOR-encoded so that new
//!   variants can be added without breaking old peers.
//!
//! ## What This Crate Does NOT Do
//!
//! The ciphertext format is owned by the message-security collaborator, not
//! by this crate. We only define what goes *inside* the ciphertext.
//!
//! ## Security Properties
//!
//! - **Bounded Decoding**: bodies larger than [`MAX_BODY_SIZE`] are rejected
//!   before CBOR parsing begins.
//!
//! - **Content Addressing**: digests are SHA-256, so an identifier can be
//!   recomputed by anyone holding the bytes it names.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod body;
pub mod errors;
pub mod ids;

pub use body::{MAX_BODY_SIZE, MessageBody};
pub use errors::{ProtocolError, Result};
pub use ids::{MemberId, MessageId, PacketId, SessionId, SubSessionId};
