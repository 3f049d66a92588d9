//! Ed25519 signatures.
//!
//! Signatures authenticate messages whose evidence must be transferable to a
//! third party (view changes, new views, session-key bundles) and requests
//! that explicitly ask for signature authentication.

use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{CryptoError, Result};

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Length of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

// -----------------------------------------------------------------------------
// Signing Key
// -----------------------------------------------------------------------------

/// An Ed25519 signing key.
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

// Manual Debug implementation to avoid exposing key material
impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("inner", &"<redacted>")
            .finish()
    }
}

impl Clone for SigningKey {
    fn clone(&self) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(&self.inner.to_bytes()),
        }
    }
}

impl SigningKey {
    /// Generates a new signing key from system randomness.
    pub fn generate() -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Creates a signing key from a 32-byte seed.
    ///
    /// # Panics
    ///
    /// Panics if the seed is all zeros (degenerate key).
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        assert_ne!(
            bytes, &[0u8; 32],
            "Ed25519 secret key seed is all zeros (degenerate key)"
        );
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.inner.sign(message).to_bytes())
    }
}

// -----------------------------------------------------------------------------
// Verifying Key
// -----------------------------------------------------------------------------

/// An Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl std::fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.inner.as_bytes();
        write!(
            f,
            "VerifyingKey({:02x}{:02x}{:02x}{:02x}...)",
            bytes[0], bytes[1], bytes[2], bytes[3]
        )
    }
}

impl VerifyingKey {
    /// Parses a public key, rejecting points that are not on the curve.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self> {
        ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map(|inner| Self { inner })
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.inner.to_bytes()
    }

    /// Verifies `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.inner.verify(message, &sig).is_ok()
    }
}

// -----------------------------------------------------------------------------
// Signature
// -----------------------------------------------------------------------------

/// A detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; SIGNATURE_LENGTH]);

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Signature({:02x}{:02x}{:02x}{:02x}...)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }
}

// serde only derives for arrays up to 32 elements, so signatures travel as
// a length-checked byte string.
impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SignatureVisitor;

        impl<'de> Visitor<'de> for SignatureVisitor {
            type Value = Signature;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{SIGNATURE_LENGTH} signature bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Signature, E> {
                let bytes: [u8; SIGNATURE_LENGTH] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(Signature(bytes))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Signature, A::Error> {
                let mut bytes = [0u8; SIGNATURE_LENGTH];
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(Signature(bytes))
            }
        }

        deserializer.deserialize_bytes(SignatureVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn sign_and_verify() {
        let key = SigningKey::generate();
        let sig = key.sign(b"view-change");
        assert!(key.verifying_key().verify(b"view-change", &sig));
    }

    #[test_case(b"view-chang3"; "byte flipped")]
    #[test_case(b"view-change\0"; "byte appended")]
    #[test_case(b"view-chang"; "byte dropped")]
    #[test_case(b""; "empty")]
    fn altered_message_fails(altered: &[u8]) {
        let key = SigningKey::generate();
        let sig = key.sign(b"view-change");
        assert!(!key.verifying_key().verify(altered, &sig));
    }

    #[test]
    fn wrong_key_fails() {
        let key = SigningKey::generate();
        let other = SigningKey::generate();
        let sig = key.sign(b"new-view");
        assert!(!other.verifying_key().verify(b"new-view", &sig));
    }

    #[test]
    fn signatures_are_deterministic() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        assert_eq!(key.sign(b"m"), key.sign(b"m"));
    }

    #[test]
    fn verifying_key_bytes_roundtrip() {
        let key = SigningKey::generate().verifying_key();
        let parsed = VerifyingKey::from_bytes(&key.to_bytes()).expect("valid key");
        assert_eq!(key, parsed);
    }

    #[test]
    fn signature_survives_postcard() {
        let key = SigningKey::generate();
        let sig = key.sign(b"payload");
        let bytes = postcard::to_allocvec(&sig).expect("serialize");
        let decoded: Signature = postcard::from_bytes(&bytes).expect("deserialize");
        assert_eq!(sig, decoded);
    }

    #[test]
    fn truncated_signature_is_rejected() {
        let bytes = postcard::to_allocvec(&[0u8; 10].as_slice()).expect("serialize");
        assert!(postcard::from_bytes::<Signature>(&bytes).is_err());
    }

    #[test]
    #[should_panic(expected = "degenerate key")]
    fn zero_seed_panics() {
        let _ = SigningKey::from_bytes(&[0u8; 32]);
    }
}
