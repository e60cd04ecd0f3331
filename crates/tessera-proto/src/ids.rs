//! Identifiers used throughout the session layer.
//!
//! Digest identifiers are SHA-256 over the bytes they name. `Display` prints
//! a short hex prefix for logs; `LowerHex` prints all 32 bytes.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::ProtocolError;

/// Length of every digest identifier in bytes.
pub const DIGEST_LEN: usize = 32;

/// Number of bytes shown by the short `Display` form.
const SHORT_LEN: usize = 6;

macro_rules! digest_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name([u8; DIGEST_LEN]);

        impl $name {
            /// Wrap raw digest bytes.
            pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
                Self(bytes)
            }

            /// SHA-256 of `data`.
            pub fn digest(data: &[u8]) -> Self {
                Self(Sha256::digest(data).into())
            }

            /// Raw digest bytes.
            pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
                &self.0
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = ProtocolError;

            fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
                let array: [u8; DIGEST_LEN] = bytes.try_into().map_err(|_| {
                    ProtocolError::InvalidIdLength { expected: DIGEST_LEN, actual: bytes.len() }
                })?;
                Ok(Self(array))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(&self.0[..SHORT_LEN]))
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

digest_id!(
    /// Identifier of a transcript message: digest of its ciphertext.
    MessageId
);

digest_id!(
    /// Identifier of a membership-operation packet: digest of the packet.
    PacketId
);

digest_id!(
    /// Identifier of one fixed-membership cryptographic sub-session.
    ///
    /// Derived by the greeting that established the sub-session; changes on
    /// every membership rotation.
    SubSessionId
);

/// Stable identifier of the logical conversation.
///
/// Chosen once (randomly) when the conversation starts and shared by every
/// sub-session it rotates through.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(u128);

impl SessionId {
    /// Create from a raw value.
    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    /// Raw value.
    pub const fn get(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({:032x})", self.0)
    }
}

/// Identifier of a group member.
///
/// Member ids are opaque strings assigned by the application (usually a user
/// handle). Ordering is lexicographic, which keeps member sets printable in a
/// stable order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    /// Create a member id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MemberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(MessageId::digest(b"ciphertext"), MessageId::digest(b"ciphertext"));
        assert_ne!(MessageId::digest(b"ciphertext"), MessageId::digest(b"ciphertexT"));
    }

    #[test]
    fn display_is_short_prefix_of_hex() {
        let id = PacketId::digest(b"packet");
        let full = format!("{:x}", id);
        let short = id.to_string();

        assert_eq!(full.len(), DIGEST_LEN * 2);
        assert_eq!(short.len(), SHORT_LEN * 2);
        assert!(full.starts_with(&short));
    }

    #[test]
    fn try_from_rejects_wrong_length() {
        let err = SubSessionId::try_from(&[0u8; 31][..]).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidIdLength { expected: 32, actual: 31 });

        let id = SubSessionId::try_from(&[7u8; 32][..]).unwrap();
        assert_eq!(id.as_bytes(), &[7u8; 32]);
    }

    #[test]
    fn member_ids_order_lexicographically() {
        let mut members = vec![MemberId::from("carol"), MemberId::from("alice"), "bob".into()];
        members.sort();
        let names: Vec<&str> = members.iter().map(MemberId::as_str).collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
    }
}
