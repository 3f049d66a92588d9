//! # pbft-crypto: Cryptographic primitives for PBFT
//!
//! This crate wraps well-tested libraries with the narrow API the agreement
//! core needs:
//!
//! - [`digest`]: SHA-256 content and consensus digests (`sha2`)
//! - [`mac`]: HMAC-SHA256 session keys and tags (`hmac`, `subtle`)
//! - [`signature`]: Ed25519 signing and verification (`ed25519-dalek`)
//! - [`seal`]: sealing fresh session keys to a peer's X25519 public key
//!   (`x25519-dalek`, `hkdf`, `aes-gcm`)
//!
//! Secret material (`SessionKey`, `SigningKey`, `ExchangeSecret`) is
//! zeroized on drop and redacted from `Debug` output.

pub mod digest;
pub mod mac;
pub mod seal;
pub mod signature;

pub use digest::{DigestBuilder, sha256};
pub use mac::{MAC_LENGTH, Mac, SessionKey};
pub use seal::{ExchangePublicKey, ExchangeSecret, SealedKey};
pub use signature::{SIGNATURE_LENGTH, Signature, SigningKey, VerifyingKey};

use thiserror::Error;

/// Errors raised by the cryptographic primitives.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// A key was supplied with the wrong number of bytes.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// The bytes do not encode a valid Ed25519 public key.
    #[error("invalid Ed25519 public key")]
    InvalidPublicKey,

    /// Sealing a session key failed.
    #[error("failed to seal session key")]
    SealFailed,

    /// The sealed key could not be opened (wrong recipient or tampered).
    #[error("failed to open sealed session key")]
    OpenFailed,
}

/// Result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
