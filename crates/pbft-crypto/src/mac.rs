//! HMAC-SHA256 session keys.
//!
//! Each ordered pair of principals shares a [`SessionKey`]. The all-zero key
//! is the "not yet established" sentinel: it never produces a tag that
//! verifies, so a node that has not received a peer's `NewKey` rejects
//! everything MAC'd by that peer instead of trusting a well-known key.

use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac as _};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{CryptoError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Length of a session key in bytes.
pub const SESSION_KEY_LENGTH: usize = 32;

/// Length of a MAC tag in bytes.
pub const MAC_LENGTH: usize = 32;

/// SHA-256 block size; HMAC zero-pads shorter keys to this length.
const HMAC_BLOCK_LENGTH: usize = 64;

/// A symmetric session key shared between two principals.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LENGTH]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_established() {
            f.write_str("SessionKey(<redacted>)")
        } else {
            f.write_str("SessionKey(<unestablished>)")
        }
    }
}

impl SessionKey {
    /// The unestablished key.
    pub const UNESTABLISHED: SessionKey = SessionKey([0u8; SESSION_KEY_LENGTH]);

    /// Generates a fresh random key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_KEY_LENGTH];
        loop {
            OsRng.fill_bytes(&mut bytes);
            // The all-zero key is reserved as the sentinel
            if bytes != [0u8; SESSION_KEY_LENGTH] {
                return Self(bytes);
            }
        }
    }

    pub fn from_bytes(bytes: [u8; SESSION_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Builds a key from a slice, checking the length.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; SESSION_KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: SESSION_KEY_LENGTH,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.0
    }

    /// True unless this is the all-zero sentinel.
    pub fn is_established(&self) -> bool {
        self.0 != [0u8; SESSION_KEY_LENGTH]
    }

    /// Computes the HMAC-SHA256 tag of `data` under this key.
    pub fn mac(&self, data: &[u8]) -> Mac {
        let mut block = Zeroizing::new([0u8; HMAC_BLOCK_LENGTH]);
        block[..SESSION_KEY_LENGTH].copy_from_slice(&self.0);

        let mut hmac = <HmacSha256 as KeyInit>::new(Key::<HmacSha256>::from_slice(&block[..]));
        hmac.update(data);
        Mac(hmac.finalize().into_bytes().into())
    }

    /// Verifies `tag` over `data` in constant time.
    ///
    /// Always false for the unestablished key.
    pub fn verify(&self, data: &[u8], tag: &Mac) -> bool {
        if !self.is_established() {
            return false;
        }
        self.mac(data).ct_eq(tag)
    }
}

impl Default for SessionKey {
    fn default() -> Self {
        Self::UNESTABLISHED
    }
}

/// An HMAC-SHA256 tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mac([u8; MAC_LENGTH]);

impl Mac {
    pub fn from_bytes(bytes: [u8; MAC_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MAC_LENGTH] {
        &self.0
    }

    /// Constant-time comparison.
    pub fn ct_eq(&self, other: &Mac) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn mac_verifies_under_same_key() {
        let key = SessionKey::generate();
        let tag = key.mac(b"prepare");
        assert!(key.verify(b"prepare", &tag));
    }

    #[test]
    fn mac_rejects_other_data_and_other_key() {
        let key = SessionKey::generate();
        let other = SessionKey::generate();
        let tag = key.mac(b"prepare");

        assert!(!key.verify(b"commit", &tag));
        assert!(!other.verify(b"prepare", &tag));
    }

    #[test]
    fn unestablished_key_never_verifies() {
        let key = SessionKey::UNESTABLISHED;
        let tag = key.mac(b"anything");
        assert!(!key.is_established());
        assert!(!key.verify(b"anything", &tag));
    }

    #[test]
    fn generated_key_is_established() {
        assert!(SessionKey::generate().is_established());
    }

    // RFC 4231 cases whose keys fit in 32 bytes. Zero padding a short HMAC
    // key does not change the tag.
    #[test_case(&[0x0b; 20], b"Hi There",
        "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7"; "case 1")]
    #[test_case(b"Jefe", b"what do ya want for nothing?",
        "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"; "case 2")]
    #[test_case(&[0xaa; 20], &[0xdd; 50],
        "773ea91e36800e46854db8ebd09181a72959098b3ef8c122d9635514ced565fe"; "case 3")]
    fn matches_rfc4231(prefix: &[u8], data: &[u8], expected: &str) {
        let mut bytes = [0u8; SESSION_KEY_LENGTH];
        bytes[..prefix.len()].copy_from_slice(prefix);
        let tag = SessionKey::from_bytes(bytes).mac(data);

        let hex: String = tag.as_bytes().iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(hex, expected);
    }

    #[test]
    fn try_from_slice_checks_length() {
        assert_eq!(
            SessionKey::try_from_slice(&[1u8; 16]),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        );
        assert!(SessionKey::try_from_slice(&[1u8; 32]).is_ok());
    }

    #[test]
    fn debug_redacts_key() {
        let key = SessionKey::generate();
        assert_eq!(format!("{key:?}"), "SessionKey(<redacted>)");
    }
}
