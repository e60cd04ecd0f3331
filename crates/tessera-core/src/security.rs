//! Message-security collaborator.
//!
//! The session layer never touches keys. It hands plaintext to a
//! [`MessageSecurity`] and gets back ciphertext plus a [`PendingSecret`]:
//! the key-schedule update implied by the message. The secret is committed
//! only once the message is part of the local transcript, and destroyed
//! otherwise. This two-phase protocol is what guarantees that no ciphertext
//! is ever sent, and no key advanced, for a message the transcript rejected.

use bytes::Bytes;
use tessera_proto::{MemberId, MessageId, SubSessionId};
use thiserror::Error;

use crate::{message::MessageSet, set::MemberSet, transcript::Transcript};

/// Errors reported by message-security collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// Ciphertext could not be authenticated for this sub-session
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Plaintext could not be encrypted
    #[error("encryption failed: {0}")]
    Encryption(String),
}

/// Key-schedule update of one message, pending transcript acceptance.
pub trait PendingSecret {
    /// Id of the message this secret belongs to.
    fn message_id(&self) -> MessageId;

    /// Make the update permanent: the message is in the transcript.
    fn commit(self);

    /// Undo the update: the message was rejected or abandoned.
    fn destroy(self);
}

/// Result of [`MessageSecurity::decrypt_verify`].
#[derive(Debug)]
pub struct Decrypted<S> {
    /// Authenticated author
    pub author: MemberId,
    /// Parents claimed by the author
    pub parents: MessageSet,
    /// Recipients claimed by the author
    pub recipients: MemberSet,
    /// Encoded body
    pub plaintext: Bytes,
    /// Pending key-schedule update
    pub secret: S,
}

/// Authenticated encryption of transcript messages for one sub-session.
pub trait MessageSecurity {
    /// Pending secret type.
    type Secret: PendingSecret;

    /// Encrypt and sign a message for `recipients`.
    ///
    /// # Errors
    ///
    /// [`SecurityError::Encryption`] if the message cannot be protected.
    fn auth_encrypt(
        &mut self,
        transcript: &Transcript,
        author: &MemberId,
        parents: &MessageSet,
        recipients: &MemberSet,
        plaintext: &[u8],
    ) -> Result<(Bytes, Self::Secret), SecurityError>;

    /// Decrypt and authenticate a ciphertext received from `sender`.
    ///
    /// # Errors
    ///
    /// [`SecurityError::Authentication`] if the ciphertext does not belong to
    /// this sub-session or fails verification.
    fn decrypt_verify(
        &mut self,
        transcript: &Transcript,
        ciphertext: &[u8],
        sender: &MemberId,
    ) -> Result<Decrypted<Self::Secret>, SecurityError>;
}

/// Builds the [`MessageSecurity`] of a new sub-session from the key material
/// a greeting produced.
pub trait SecurityFactory<State> {
    /// Security type produced.
    type Security: MessageSecurity;

    /// Create the security component of sub-session `sub_session_id`.
    fn create(
        &mut self,
        owner: &MemberId,
        sub_session_id: SubSessionId,
        members: &MemberSet,
        state: &State,
    ) -> Self::Security;
}
