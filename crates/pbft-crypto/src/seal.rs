//! Sealing session keys to a peer.
//!
//! Ed25519 keys cannot encrypt, so each node also holds a static X25519
//! exchange key. A fresh session key is sealed to a recipient with an
//! ephemeral-static Diffie-Hellman exchange:
//!
//! ```text
//! shared   = X25519(ephemeral_secret, recipient_public)
//! wrap_key = HKDF-SHA256(salt = ephemeral_public, ikm = shared, info = context)
//! sealed   = AES-256-GCM(wrap_key, nonce, session_key, aad = context)
//! ```
//!
//! The `context` binds the sealed key to the sender, recipient and
//! key-refresh request id, so a sealed key cannot be replayed into a
//! different bundle.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::mac::{SESSION_KEY_LENGTH, SessionKey};
use crate::{CryptoError, Result};

/// AES-GCM nonce length.
const NONCE_LENGTH: usize = 12;

/// A node's static X25519 secret.
#[derive(Clone)]
pub struct ExchangeSecret {
    inner: StaticSecret,
}

// Manual Debug implementation to avoid exposing key material
impl std::fmt::Debug for ExchangeSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeSecret")
            .field("inner", &"<redacted>")
            .finish()
    }
}

impl ExchangeSecret {
    pub fn generate() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    pub fn public_key(&self) -> ExchangePublicKey {
        ExchangePublicKey(PublicKey::from(&self.inner).to_bytes())
    }

    /// Opens a key sealed to this secret.
    pub fn open(&self, sealed: &SealedKey, context: &[u8]) -> Result<SessionKey> {
        let shared = self
            .inner
            .diffie_hellman(&PublicKey::from(sealed.ephemeral_public));
        let wrap_key = derive_wrap_key(shared.as_bytes(), &sealed.ephemeral_public, context)?;

        let cipher =
            Aes256Gcm::new_from_slice(&wrap_key[..]).map_err(|_| CryptoError::OpenFailed)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&sealed.nonce),
                    Payload {
                        msg: &sealed.ciphertext,
                        aad: context,
                    },
                )
                .map_err(|_| CryptoError::OpenFailed)?,
        );

        let key = SessionKey::try_from_slice(&plaintext).map_err(|_| CryptoError::OpenFailed)?;
        if !key.is_established() {
            return Err(CryptoError::OpenFailed);
        }
        Ok(key)
    }
}

/// A node's static X25519 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangePublicKey([u8; 32]);

impl ExchangePublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Seals `key` so that only the holder of the matching secret can open it.
    pub fn seal(&self, key: &SessionKey, context: &[u8]) -> Result<SealedKey> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&PublicKey::from(self.0));
        let wrap_key = derive_wrap_key(shared.as_bytes(), &ephemeral_public, context)?;

        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);

        let cipher =
            Aes256Gcm::new_from_slice(&wrap_key[..]).map_err(|_| CryptoError::SealFailed)?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: key.as_bytes(),
                    aad: context,
                },
            )
            .map_err(|_| CryptoError::SealFailed)?;

        Ok(SealedKey {
            ephemeral_public,
            nonce,
            ciphertext,
        })
    }
}

/// A session key sealed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    pub ephemeral_public: [u8; 32],
    pub nonce: [u8; NONCE_LENGTH],
    pub ciphertext: Vec<u8>,
}

fn derive_wrap_key(
    shared: &[u8; 32],
    salt: &[u8; 32],
    context: &[u8],
) -> Result<Zeroizing<[u8; SESSION_KEY_LENGTH]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared);
    let mut okm = Zeroizing::new([0u8; SESSION_KEY_LENGTH]);
    hk.expand(context, &mut okm[..])
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: SESSION_KEY_LENGTH,
            actual: 0,
        })?;
    Ok(okm)
}
