//! Error types for the Tessera session core.
//!
//! One error type per layer:
//! - [`SessionError`]: a single sub-session (sending, receiving, parting)
//! - [`HybridError`]: the logical session (membership operations)
//!
//! Component-level errors ([`TranscriptError`](crate::transcript::TranscriptError),
//! [`SetError`](crate::set::SetError), collaborator errors) live next to their
//! components and are wrapped here where they cross a layer.
//!
//! Nothing here is fatal to the process. Faults from peers degrade into a
//! dropped packet or a reported inconsistency; faults from local callers into
//! a returned error.

use tessera_proto::{PacketId, ProtocolError};
use thiserror::Error;

use crate::{
    greeter::GreetError,
    security::SecurityError,
    session::SessionState,
    set::{MemberSet, SetError},
};

/// Errors from [`SessionBase`](crate::session::SessionBase) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Body may only be sent while joined
    #[error("cannot send in state {state:?}: only allowed while joined")]
    NotJoined {
        /// State at the time of the call
        state: SessionState,
    },

    /// Operation not valid in the current state
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// State at the time of the call
        state: SessionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Ciphertext does not authenticate for this sub-session
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Message was authenticated but rejected by the transcript
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Body could not be encoded
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// Security collaborator failed to encrypt
    #[error("security error: {0}")]
    Security(SecurityError),
}

impl SessionError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// An authentication failure may just mean the packet belongs to another
    /// sub-session whose key we do not have yet.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

impl From<SecurityError> for SessionError {
    fn from(err: SecurityError) -> Self {
        match err {
            SecurityError::Authentication(reason) => Self::Authentication(reason),
            other => Self::Security(other),
        }
    }
}

/// Errors from [`HybridSession`](crate::hybrid::HybridSession) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HybridError {
    /// A different own operation is still running
    #[error("operation in progress")]
    OperationInProgress,

    /// Our proposal lost the ordering race to another one
    #[error("proposal {packet} rejected")]
    ProposalRejected {
        /// Our initial packet
        packet: PacketId,
    },

    /// We have not synced with the channel's operation order yet
    #[error("not synced: wait for someone to include you")]
    NotSynced,

    /// Proposed members are not all in the channel
    #[error("not in channel: {missing}")]
    NotInChannel {
        /// Members that would need to enter the channel first
        missing: MemberSet,
    },

    /// Requested membership equals the current one
    #[error("membership would not change")]
    NoChange,

    /// The same member is both included and excluded
    #[error("invalid membership change: {0}")]
    InvalidChange(#[from] SetError),

    /// No sub-session to act on
    #[error("no current sub-session")]
    NoSession,

    /// Greeting collaborator failed
    #[error("greeting failed: {0}")]
    Greeting(#[from] GreetError),

    /// Current sub-session refused
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

impl HybridError {
    /// Returns true if retrying later may succeed.
    ///
    /// Lost races and ordering gaps resolve themselves once the competing
    /// operation completes; malformed input never does.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::OperationInProgress
            | Self::ProposalRejected { .. }
            | Self::NotSynced
            | Self::NotInChannel { .. } => true,
            Self::Session(err) => err.is_transient(),
            Self::NoChange | Self::InvalidChange(_) | Self::NoSession | Self::Greeting(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use tessera_proto::MemberId;

    use super::*;

    #[test]
    fn lost_races_are_transient() {
        assert!(HybridError::OperationInProgress.is_transient());
        assert!(
            HybridError::ProposalRejected { packet: PacketId::digest(b"p") }.is_transient()
        );
        assert!(HybridError::NotSynced.is_transient());
        assert!(
            HybridError::NotInChannel {
                missing: [MemberId::from("dave")].into_iter().collect()
            }
            .is_transient()
        );
    }

    #[test]
    fn local_misuse_is_fatal() {
        assert!(!HybridError::NoChange.is_transient());
        assert!(!HybridError::NoSession.is_transient());
        assert!(!HybridError::Greeting(GreetError::Malformed("x".into())).is_transient());
        assert!(
            !SessionError::NotJoined { state: SessionState::Parting }.is_transient()
        );
        assert!(!SessionError::InvalidMessage("gap".into()).is_transient());
    }

    #[test]
    fn authentication_failures_map_to_session_authentication() {
        let err: SessionError = SecurityError::Authentication("bad mac".into()).into();
        assert_eq!(err, SessionError::Authentication("bad mac".into()));
        assert!(err.is_transient());

        let err: SessionError = SecurityError::Encryption("no key".into()).into();
        assert!(matches!(err, SessionError::Security(_)));
    }
}
