use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Length of an identity digest in bytes.
pub const IDENTITY_LEN: usize = 32;

/// Content digest naming an item (a contract, a transaction, ...).
///
/// Identities are opaque and immutable. Equality, hashing and ordering are
/// byte-wise over the digest, so any byte pattern (including bytes with the
/// high bit set) is a valid identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    digest: [u8; IDENTITY_LEN],
}

impl Identity {
    /// Derive the identity of a piece of content.
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"tally-identity-v1:");
        hasher.update(content);
        Self {
            digest: *hasher.finalize().as_bytes(),
        }
    }

    /// Wrap an already computed digest.
    pub fn from_digest(digest: [u8; IDENTITY_LEN]) -> Self {
        Self { digest }
    }

    /// Random identity for tests and demos.
    pub fn random() -> Self {
        let mut digest = [0u8; IDENTITY_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut digest);
        Self { digest }
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.digest
    }

    /// Full hex-encoded digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// Short identifier (first 8 hex characters).
    pub fn short_id(&self) -> String {
        format!("id:{}", hex::encode(&self.digest[..4]))
    }

    /// Parse from 64 hex characters, optionally prefixed with `id:`.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let s = s.strip_prefix("id:").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Build from a byte slice that must be exactly [`IDENTITY_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        let digest: [u8; IDENTITY_LEN] =
            bytes.try_into().map_err(|_| TypeError::InvalidLength {
                expected: IDENTITY_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self { digest })
    }
}

impl FromStr for Identity {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.short_id())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn of_is_deterministic() {
        assert_eq!(Identity::of(b"contract"), Identity::of(b"contract"));
        assert_ne!(Identity::of(b"contract"), Identity::of(b"contract2"));
    }

    #[test]
    fn of_is_domain_separated() {
        let raw = *blake3::hash(b"contract").as_bytes();
        assert_ne!(Identity::of(b"contract"), Identity::from_digest(raw));
    }

    #[test]
    fn random_ids_are_unique() {
        assert_ne!(Identity::random(), Identity::random());
    }

    #[test]
    fn short_id_format() {
        let id = Identity::from_digest([0xab; 32]);
        assert_eq!(id.short_id(), "id:abababab");
    }

    #[test]
    fn hex_accepts_prefix() {
        let id = Identity::from_digest([0xf0; 32]);
        let parsed: Identity = format!("id:{}", id.to_hex()).parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let err = Identity::from_hex("abcd").unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: 32,
                actual: 2
            }
        );
        assert!(matches!(
            Identity::from_hex("zz"),
            Err(TypeError::InvalidHex(_))
        ));
    }

    #[test]
    fn serde_keeps_high_bit_bytes() {
        let id = Identity::from_digest([0x80 | 0x7f; 32]);
        let json = serde_json::to_string(&id).unwrap();
        let parsed: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    proptest! {
        #[test]
        fn hex_parse_inverts_to_hex(bytes in proptest::array::uniform32(any::<u8>())) {
            let id = Identity::from_digest(bytes);
            prop_assert_eq!(Identity::from_hex(&id.to_hex()).unwrap(), id);
        }

        #[test]
        fn ordering_is_bytewise(
            a in proptest::array::uniform32(any::<u8>()),
            b in proptest::array::uniform32(any::<u8>()),
        ) {
            let (ia, ib) = (Identity::from_digest(a), Identity::from_digest(b));
            prop_assert_eq!(ia.cmp(&ib), a.cmp(&b));
        }
    }
}
