//! Plaintext bodies carried by transcript messages.
//!
//! A body is what the message-security layer encrypts. The session layer
//! distinguishes three kinds:
//!
//! - `Payload`: application data.
//! - `ExplicitAck`: an empty message whose only purpose is to acknowledge its
//!   parents. Sent either on request of the application (`manual`) or
//!   automatically when the consistency monitor notices that we are late.
//! - `Consistency`: a request for everyone to acknowledge the transcript so
//!   far. With `close` set it also announces that the author is leaving the
//!   sub-session and will send no further payloads.
//!
//! # Security
//!
//! - **Bounded Deserialization**: input is checked against [`MAX_BODY_SIZE`]
//!   before the CBOR parser sees it.
//! - **Explicit Schema**: decoding into the enum rejects unknown variants, so a
//!   peer speaking a newer body format is reported as a decode error instead of
//!   being misread.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Largest encoded body accepted by [`MessageBody::decode`] (1 MiB).
pub const MAX_BODY_SIZE: usize = 1 << 20;

/// Decoded plaintext of a transcript message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Application payload.
    Payload(Bytes),
    /// Acknowledge-only message.
    ExplicitAck {
        /// Requested by the application rather than sent automatically.
        manual: bool,
    },
    /// Consistency request; `close` announces that the author is parting.
    Consistency {
        /// Author is leaving the sub-session.
        close: bool,
    },
}

impl MessageBody {
    /// Payload body from application bytes.
    pub fn payload(data: impl Into<Bytes>) -> Self {
        Self::Payload(data.into())
    }

    /// True for `Payload`.
    #[must_use]
    pub const fn is_payload(&self) -> bool {
        matches!(self, Self::Payload(_))
    }

    /// True for any `ExplicitAck`.
    #[must_use]
    pub const fn is_explicit_ack(&self) -> bool {
        matches!(self, Self::ExplicitAck { .. })
    }

    /// True for `Consistency { close: true }`.
    #[must_use]
    pub const fn is_close(&self) -> bool {
        matches!(self, Self::Consistency { close: true })
    }

    /// Bodies that may only be sent while the session is joined.
    ///
    /// Payloads and closing consistency requests announce something about the
    /// author's future; once parting, an author can do neither.
    #[must_use]
    pub const fn requires_joined(&self) -> bool {
        self.is_payload() || self.is_close()
    }

    /// Encode as CBOR.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::CborEncode`] if serialization fails.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    /// Decode from CBOR.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::BodyTooLarge`] if `bytes` exceeds [`MAX_BODY_SIZE`]
    /// - [`ProtocolError::CborDecode`] if the bytes are not a valid body
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_BODY_SIZE {
            return Err(ProtocolError::BodyTooLarge { size: bytes.len(), max: MAX_BODY_SIZE });
        }

        ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn payload_survives_encoding() {
        let body = MessageBody::payload(&b"hello group"[..]);
        let encoded = body.encode().unwrap();
        assert_eq!(MessageBody::decode(&encoded).unwrap(), body);
    }

    #[test]
    fn control_bodies_are_distinct_on_the_wire() {
        let ack = MessageBody::ExplicitAck { manual: false }.encode().unwrap();
        let consistency = MessageBody::Consistency { close: false }.encode().unwrap();
        let close = MessageBody::Consistency { close: true }.encode().unwrap();

        assert_ne!(ack, consistency);
        assert_ne!(consistency, close);
        assert!(MessageBody::decode(&close).unwrap().is_close());
    }

    #[test]
    fn requires_joined_covers_payload_and_close_only() {
        assert!(MessageBody::payload(Bytes::new()).requires_joined());
        assert!(MessageBody::Consistency { close: true }.requires_joined());
        assert!(!MessageBody::Consistency { close: false }.requires_joined());
        assert!(!MessageBody::ExplicitAck { manual: true }.requires_joined());
    }

    #[test]
    fn rejects_oversized_input_before_parsing() {
        let bytes = vec![0u8; MAX_BODY_SIZE + 1];
        let err = MessageBody::decode(&bytes).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::BodyTooLarge { size: MAX_BODY_SIZE + 1, max: MAX_BODY_SIZE }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            MessageBody::decode(&[0xff, 0x00, 0x13]),
            Err(ProtocolError::CborDecode(_))
        ));
        assert!(matches!(MessageBody::decode(&[]), Err(ProtocolError::CborDecode(_))));
    }

    #[test]
    fn decode_never_panics_on_arbitrary_bytes() {
        proptest!(|(bytes in proptest::collection::vec(any::<u8>(), 0..256))| {
            let _ = MessageBody::decode(&bytes);
        });
    }

    #[test]
    fn any_payload_survives_encoding() {
        proptest!(|(data in proptest::collection::vec(any::<u8>(), 0..512))| {
            let body = MessageBody::payload(data);
            let decoded = MessageBody::decode(&body.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, body);
        });
    }
}
