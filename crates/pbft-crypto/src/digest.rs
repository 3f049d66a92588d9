//! SHA-256 digests.
//!
//! Every digest in the protocol (content digests, request and batch
//! consensus digests, reply digests, checkpoint state digests) is SHA-256.

use pbft_types::Digest;
use sha2::{Digest as _, Sha256};

/// Computes the SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> Digest {
    let out: [u8; 32] = Sha256::digest(data).into();
    Digest::from_bytes(out)
}

/// Incremental SHA-256 over several fields.
///
/// Used where a digest covers a fixed sequence of fields, for example the
/// request consensus digest over `(sender, request id, read-only, command)`.
#[derive(Clone, Default)]
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes.
    pub fn update(mut self, data: &[u8]) -> Self {
        self.hasher.update(data);
        self
    }

    /// Appends a little-endian `u64`.
    pub fn update_u64(self, value: u64) -> Self {
        self.update(&value.to_le_bytes())
    }

    /// Appends another digest.
    pub fn update_digest(self, digest: &Digest) -> Self {
        self.update(digest.as_bytes())
    }

    pub fn finalize(self) -> Digest {
        let out: [u8; 32] = self.hasher.finalize().into();
        Digest::from_bytes(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_vector() {
        // SHA-256("abc")
        let digest = sha256(b"abc");
        assert_eq!(
            digest.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn builder_matches_one_shot() {
        let one_shot = sha256(b"hello world");
        let built = DigestBuilder::new().update(b"hello ").update(b"world").finalize();
        assert_eq!(one_shot, built);
    }

    #[test]
    fn field_order_matters() {
        let a = DigestBuilder::new().update_u64(1).update_u64(2).finalize();
        let b = DigestBuilder::new().update_u64(2).update_u64(1).finalize();
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn digest_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(sha256(&data), sha256(&data));
        }
    }
}
