//! A small key-value service for running a replica out of the box.
//!
//! Commands are UTF-8 text:
//!
//! ```text
//! SET <key> <value>   -> OK
//! GET <key>           -> <value> | NOT_FOUND
//! DEL <key>           -> OK | NOT_FOUND
//! ```
//!
//! Anything else answers `ERR <reason>`. Only `GET` runs read-only.

use std::collections::BTreeMap;

use bytes::Bytes;
use pbft_core::Application;
use pbft_crypto::{DigestBuilder, sha256};
use pbft_types::{Digest, PrincipalId};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command<'a> {
    Set(&'a str, &'a str),
    Get(&'a str),
    Del(&'a str),
}

fn parse(command: &[u8]) -> Result<Command<'_>, &'static str> {
    let text = std::str::from_utf8(command).map_err(|_| "command is not UTF-8")?;
    let mut parts = text.trim().splitn(3, ' ');
    let verb = parts.next().unwrap_or_default();
    let key = parts.next().filter(|k| !k.is_empty()).ok_or("missing key")?;
    match verb.to_ascii_uppercase().as_str() {
        "SET" => Ok(Command::Set(key, parts.next().ok_or("missing value")?)),
        "GET" => Ok(Command::Get(key)),
        "DEL" => Ok(Command::Del(key)),
        _ => Err("unknown command"),
    }
}

/// In-memory ordered map.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get(&self, key: &str) -> Bytes {
        self.entries
            .get(key)
            .map_or_else(|| Bytes::from_static(b"NOT_FOUND"), |v| Bytes::from(v.clone()))
    }
}

impl Application for KvStore {
    fn execute(&mut self, client: PrincipalId, command: &[u8], _non_deterministic: &[u8]) -> Bytes {
        match parse(command) {
            Ok(Command::Set(key, value)) => {
                self.entries.insert(key.to_string(), value.to_string());
                Bytes::from_static(b"OK")
            }
            Ok(Command::Get(key)) => self.get(key),
            Ok(Command::Del(key)) => match self.entries.remove(key) {
                Some(_) => Bytes::from_static(b"OK"),
                None => Bytes::from_static(b"NOT_FOUND"),
            },
            Err(reason) => {
                tracing::debug!(%client, reason, "rejected command");
                Bytes::from(format!("ERR {reason}"))
            }
        }
    }

    fn execute_read_only(&self, _client: PrincipalId, command: &[u8]) -> Option<Bytes> {
        match parse(command) {
            Ok(Command::Get(key)) => Some(self.get(key)),
            _ => None,
        }
    }

    fn state_digest(&self) -> Digest {
        self.entries
            .iter()
            .fold(DigestBuilder::new(), |builder, (key, value)| {
                builder
                    .update_digest(&sha256(key.as_bytes()))
                    .update_digest(&sha256(value.as_bytes()))
            })
            .update_u64(self.entries.len() as u64)
            .finalize()
    }
}
