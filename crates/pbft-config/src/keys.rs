//! Local key material.
//!
//! A node's two secrets live in separate files, each holding 32 bytes as
//! hex: the Ed25519 signing key and the X25519 key-exchange secret. The
//! public halves go into the shared cluster file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use pbft_crypto::{ExchangePublicKey, ExchangeSecret, SigningKey, VerifyingKey};

use crate::ConfigError;

pub const SIGNING_KEY_FILE: &str = "signing.key";
pub const EXCHANGE_KEY_FILE: &str = "exchange.key";

/// This node's private keys.
pub struct NodeKeys {
    pub signing_key: SigningKey,
    pub exchange_secret: ExchangeSecret,
}

impl NodeKeys {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(),
            exchange_secret: ExchangeSecret::generate(),
        }
    }

    pub fn read(signing_path: &Path, exchange_path: &Path) -> Result<Self, ConfigError> {
        let signing = read_secret(signing_path)?;
        let exchange = read_secret(exchange_path)?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&signing),
            exchange_secret: ExchangeSecret::from_bytes(exchange),
        })
    }

    /// Writes both secrets into `dir`, readable only by the owner on Unix.
    pub fn write(&self, dir: &Path) -> Result<(PathBuf, PathBuf), ConfigError> {
        fs::create_dir_all(dir).map_err(|source| ConfigError::WriteError {
            path: dir.to_path_buf(),
            source,
        })?;
        let signing_path = dir.join(SIGNING_KEY_FILE);
        let exchange_path = dir.join(EXCHANGE_KEY_FILE);
        write_secret(&signing_path, &self.signing_key.to_bytes())?;
        write_secret(&exchange_path, &self.exchange_secret.to_bytes())?;
        Ok((signing_path, exchange_path))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn exchange_key(&self) -> ExchangePublicKey {
        self.exchange_secret.public_key()
    }

    /// Public signing key as hex, for the cluster file.
    pub fn verifying_key_hex(&self) -> String {
        hex::encode(self.verifying_key().to_bytes())
    }

    /// Public exchange key as hex, for the cluster file.
    pub fn exchange_key_hex(&self) -> String {
        hex::encode(self.exchange_key().as_bytes())
    }
}

impl std::fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeys")
            .field("verifying_key", &self.verifying_key_hex())
            .finish_non_exhaustive()
    }
}

/// Decodes a 32-byte hex key.
pub(crate) fn decode_key(owner: &str, hex_key: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| ConfigError::KeyError {
        owner: owner.to_string(),
        reason: e.to_string(),
    })?;
    bytes.try_into().map_err(|bytes: Vec<u8>| ConfigError::KeyError {
        owner: owner.to_string(),
        reason: format!("expected 32 bytes, got {}", bytes.len()),
    })
}

fn read_secret(path: &Path) -> Result<[u8; 32], ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    decode_key(&path.display().to_string(), &contents)
}

fn write_secret(path: &Path, secret: &[u8; 32]) -> Result<(), ConfigError> {
    let to_error = |source| ConfigError::WriteError {
        path: path.to_path_buf(),
        source,
    };

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(to_error)?;
    writeln!(file, "{}", hex::encode(secret)).map_err(to_error)
}
