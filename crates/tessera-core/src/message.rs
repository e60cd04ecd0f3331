//! Transcript messages.

use tessera_proto::{MemberId, MessageBody, MessageId};

use crate::set::{ImmutableSet, MemberSet};

/// Set of message ids, used for parents and frontiers.
pub type MessageSet = ImmutableSet<MessageId>;

/// A decrypted, authenticated message of one sub-session.
///
/// The id is the digest of the ciphertext the message arrived in, so it is
/// fixed before the message is ever decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Content-derived identifier
    pub id: MessageId,
    /// Member that wrote the message
    pub author: MemberId,
    /// Messages the author had seen when writing this one
    pub parents: MessageSet,
    /// Everyone the message was sent to: the membership minus the author
    pub recipients: MemberSet,
    /// Decoded plaintext
    pub body: MessageBody,
}

impl Message {
    /// The membership this message claims: `recipients ∪ {author}`.
    #[must_use]
    pub fn members(&self) -> MemberSet {
        self.recipients.with(self.author.clone())
    }
}
