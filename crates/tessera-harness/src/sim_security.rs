//! Simulated message security.
//!
//! Not encryption: the "ciphertext" is a CBOR envelope in the clear, tagged
//! with a SHA-256 MAC over a per-sub-session key. That is enough for the
//! session layer to tell packets of different sub-sessions apart, and for
//! tests to observe tampering.
//!
//! ```text
//! ┌──────────┬──────────────┬──────────────────────────┐
//! │ "MSG1"   │ mac (32)     │ CBOR envelope            │
//! └──────────┴──────────────┴──────────────────────────┘
//!              sha256(key ‖ envelope)
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tessera_core::{
    MemberSet,
    message::MessageSet,
    security::{Decrypted, MessageSecurity, PendingSecret, SecurityError, SecurityFactory},
    transcript::Transcript,
};
use tessera_proto::{MemberId, MessageId, SubSessionId};

/// Magic prefix of every simulated ciphertext.
pub const MESSAGE_MAGIC: &[u8; 4] = b"MSG1";

const MAC_LEN: usize = 32;

/// Key material of one simulated sub-session.
#[derive(Clone, PartialEq, Eq)]
pub struct SimKey([u8; 32]);

impl SimKey {
    /// Derive a key from arbitrary seed bytes.
    pub fn derive(seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"tessera-sim-key");
        hasher.update(seed);
        Self(hasher.finalize().into())
    }
}

impl std::fmt::Debug for SimKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SimKey(..)")
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    sub_session: SubSessionId,
    author: MemberId,
    parents: Vec<MessageId>,
    recipients: Vec<MemberId>,
    /// Per-author counter, so equal bodies never share an id
    seq: u64,
    body: Bytes,
}

/// Key-schedule update of a simulated message. The simulated key never
/// ratchets, so there is nothing to undo.
#[derive(Debug)]
pub struct SimSecret {
    id: MessageId,
}

impl PendingSecret for SimSecret {
    fn message_id(&self) -> MessageId {
        self.id
    }

    fn commit(self) {
        tracing::trace!(id = %self.id, "secret committed");
    }

    fn destroy(self) {
        tracing::trace!(id = %self.id, "secret destroyed");
    }
}

/// [`MessageSecurity`] of one simulated sub-session.
#[derive(Debug)]
pub struct SimSecurity {
    sub_session: SubSessionId,
    key: SimKey,
    seq: u64,
}

impl SimSecurity {
    /// Security for `sub_session` under `key`.
    pub fn new(sub_session: SubSessionId, key: SimKey) -> Self {
        Self { sub_session, key, seq: 0 }
    }

    fn mac(&self, envelope: &[u8]) -> [u8; MAC_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(self.key.0);
        hasher.update(envelope);
        hasher.finalize().into()
    }
}

impl MessageSecurity for SimSecurity {
    type Secret = SimSecret;

    fn auth_encrypt(
        &mut self,
        _transcript: &Transcript,
        author: &MemberId,
        parents: &MessageSet,
        recipients: &MemberSet,
        plaintext: &[u8],
    ) -> Result<(Bytes, SimSecret), SecurityError> {
        self.seq += 1;
        let envelope = Envelope {
            sub_session: self.sub_session,
            author: author.clone(),
            parents: parents.iter().copied().collect(),
            recipients: recipients.iter().cloned().collect(),
            seq: self.seq,
            body: Bytes::copy_from_slice(plaintext),
        };
        let mut encoded = Vec::new();
        ciborium::ser::into_writer(&envelope, &mut encoded)
            .map_err(|e| SecurityError::Encryption(e.to_string()))?;

        let mut out = BytesMut::with_capacity(MESSAGE_MAGIC.len() + MAC_LEN + encoded.len());
        out.put_slice(MESSAGE_MAGIC);
        out.put_slice(&self.mac(&encoded));
        out.put_slice(&encoded);
        let ciphertext = out.freeze();

        let secret = SimSecret { id: MessageId::digest(&ciphertext) };
        Ok((ciphertext, secret))
    }

    fn decrypt_verify(
        &mut self,
        _transcript: &Transcript,
        ciphertext: &[u8],
        sender: &MemberId,
    ) -> Result<Decrypted<SimSecret>, SecurityError> {
        let Some(rest) = ciphertext.strip_prefix(MESSAGE_MAGIC.as_slice()) else {
            return Err(SecurityError::Authentication("not a message".into()));
        };
        if rest.len() < MAC_LEN {
            return Err(SecurityError::Authentication("truncated".into()));
        }
        let (mac, encoded) = rest.split_at(MAC_LEN);
        if mac != self.mac(encoded).as_slice() {
            return Err(SecurityError::Authentication("bad mac".into()));
        }

        let envelope: Envelope = ciborium::de::from_reader(encoded)
            .map_err(|e| SecurityError::Authentication(format!("bad envelope: {e}")))?;
        if envelope.sub_session != self.sub_session {
            return Err(SecurityError::Authentication("other sub-session".into()));
        }
        if &envelope.author != sender {
            return Err(SecurityError::Authentication(format!(
                "sent by {sender} but signed by {}",
                envelope.author
            )));
        }

        Ok(Decrypted {
            author: envelope.author,
            parents: envelope.parents.into_iter().collect(),
            recipients: envelope.recipients.into_iter().collect(),
            plaintext: envelope.body,
            secret: SimSecret { id: MessageId::digest(ciphertext) },
        })
    }
}

/// Builds [`SimSecurity`] from completed simulated greetings.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimSecurityFactory;

impl SecurityFactory<SimKey> for SimSecurityFactory {
    type Security = SimSecurity;

    fn create(
        &mut self,
        _owner: &MemberId,
        sub_session_id: SubSessionId,
        _members: &MemberSet,
        state: &SimKey,
    ) -> SimSecurity {
        SimSecurity::new(sub_session_id, state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn security(label: &[u8]) -> SimSecurity {
        SimSecurity::new(SubSessionId::digest(label), SimKey::derive(label))
    }

    fn seal(security: &mut SimSecurity) -> Bytes {
        let recipients: MemberSet = [MemberId::from("bob")].into_iter().collect();
        let (ciphertext, secret) = security
            .auth_encrypt(
                &Transcript::new(),
                &MemberId::from("alice"),
                &MessageSet::new(),
                &recipients,
                b"body",
            )
            .unwrap();
        assert_eq!(secret.message_id(), MessageId::digest(&ciphertext));
        ciphertext
    }

    #[test]
    fn opens_what_it_sealed() {
        let mut alice = security(b"s1");
        let mut bob = security(b"s1");
        let ciphertext = seal(&mut alice);

        let opened =
            bob.decrypt_verify(&Transcript::new(), &ciphertext, &MemberId::from("alice")).unwrap();
        assert_eq!(opened.author, MemberId::from("alice"));
        assert_eq!(&opened.plaintext[..], b"body");
        assert!(opened.recipients.contains(&MemberId::from("bob")));
    }

    #[test]
    fn equal_messages_get_distinct_ids() {
        let mut alice = security(b"s1");
        assert_ne!(seal(&mut alice), seal(&mut alice));
    }

    #[test]
    fn other_sub_session_fails_authentication() {
        let mut alice = security(b"s1");
        let mut other = security(b"s2");
        let ciphertext = seal(&mut alice);

        let err = other
            .decrypt_verify(&Transcript::new(), &ciphertext, &MemberId::from("alice"))
            .unwrap_err();
        assert!(matches!(err, SecurityError::Authentication(_)));
    }

    #[test]
    fn tampering_and_spoofing_fail_authentication() {
        let mut alice = security(b"s1");
        let mut bob = security(b"s1");
        let ciphertext = seal(&mut alice);

        let mut tampered = ciphertext.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        let transcript = Transcript::new();
        assert!(bob.decrypt_verify(&transcript, &tampered, &MemberId::from("alice")).is_err());

        assert!(bob.decrypt_verify(&transcript, &ciphertext, &MemberId::from("mallory")).is_err());
    }
}
