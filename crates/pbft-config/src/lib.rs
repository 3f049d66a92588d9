//! Configuration management for PBFT replicas
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (PBFT_* prefix, `__` between sections)
//! 2. An explicit file passed on the command line
//! 3. pbft.local.toml (gitignored, local overrides)
//! 4. pbft.toml (git-tracked, cluster config)
//! 5. ~/.config/pbft/config.toml (user defaults)
//! 6. Built-in defaults (lowest precedence)
//!
//! The merged [`ClusterFile`] is validated and then converted into the
//! `pbft-core` values a replica runs with.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use pbft_core::{
    ClusterConfig, Keyring, Principal, PrincipalSet, ProtocolConfig, ReplicaConfig, TimerConfig,
};
use pbft_crypto::{ExchangePublicKey, VerifyingKey};
use pbft_types::{ClientId, PrincipalId, ReplicaId};
use serde::{Deserialize, Serialize};

mod error;
mod keys;
mod loader;
mod paths;

pub use error::ConfigError;
pub use keys::{EXCHANGE_KEY_FILE, NodeKeys, SIGNING_KEY_FILE};
pub use loader::ConfigLoader;
pub use paths::Paths;

/// The full cluster configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterFile {
    pub cluster: ClusterSection,
    pub protocol: ProtocolSection,
    pub timers: TimerSection,
    pub node: NodeSection,
}

/// `[cluster]`: fault threshold and every principal's public identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub f: usize,
    pub replicas: Vec<PrincipalEntry>,
    pub clients: Vec<PrincipalEntry>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            f: 1,
            replicas: Vec::new(),
            clients: Vec::new(),
        }
    }
}

/// One `[[cluster.replicas]]` or `[[cluster.clients]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalEntry {
    pub index: u32,
    pub address: String,
    /// Ed25519 public key, hex.
    pub signing_key: String,
    /// X25519 public key, hex.
    pub exchange_key: String,
}

/// `[protocol]`: batching, flow control and checkpointing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSection {
    pub checkpoint_interval: u64,
    pub checkpoint_max_out: u64,
    pub congestion_window: u64,
    pub max_batch_requests: usize,
    pub max_batch_bytes: usize,
    pub big_request_threshold: usize,
    pub sign_protocol_messages: bool,
    pub max_buffered_messages: usize,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        let defaults = ProtocolConfig::default();
        Self {
            checkpoint_interval: defaults.checkpoint_interval,
            checkpoint_max_out: defaults.checkpoint_max_out,
            congestion_window: defaults.congestion_window,
            max_batch_requests: defaults.max_batch_requests,
            max_batch_bytes: defaults.max_batch_bytes,
            big_request_threshold: defaults.big_request_threshold,
            sign_protocol_messages: defaults.sign_protocol_messages,
            max_buffered_messages: defaults.max_buffered_messages,
        }
    }
}

/// `[timers]`: intervals in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSection {
    pub key_refresh_ms: u64,
    pub status_ms: u64,
    pub view_change_ms: u64,
    pub idle_ms: u64,
}

impl Default for TimerSection {
    fn default() -> Self {
        let defaults = TimerConfig::default();
        Self {
            key_refresh_ms: defaults.key_refresh.as_millis() as u64,
            status_ms: defaults.status.as_millis() as u64,
            view_change_ms: defaults.view_change.as_millis() as u64,
            idle_ms: defaults.idle.as_millis() as u64,
        }
    }
}

/// `[node]`: where this node keeps its secrets, and runtime sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub signing_key_file: PathBuf,
    pub exchange_key_file: PathBuf,
    pub task_queue_capacity: usize,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            signing_key_file: PathBuf::from(format!("keys/{SIGNING_KEY_FILE}")),
            exchange_key_file: PathBuf::from(format!("keys/{EXCHANGE_KEY_FILE}")),
            task_queue_capacity: 4096,
        }
    }
}

impl ClusterFile {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Resolve relative key paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();
        if self.node.signing_key_file.is_relative() {
            self.node.signing_key_file = base.join(&self.node.signing_key_file);
        }
        if self.node.exchange_key_file.is_relative() {
            self.node.exchange_key_file = base.join(&self.node.exchange_key_file);
        }
    }

    /// Checks everything a replica relies on without re-checking.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::ValidationError(message));
        let cluster = &self.cluster;

        if cluster.f == 0 {
            return invalid("f must be at least 1".to_string());
        }
        let expected = 3 * cluster.f + 1;
        if cluster.replicas.len() != expected {
            return invalid(format!(
                "cluster has {} replicas, expected 3f+1 = {expected}",
                cluster.replicas.len()
            ));
        }
        check_dense("replica", &cluster.replicas)?;
        check_dense("client", &cluster.clients)?;
        for (kind, entries) in [("replica", &cluster.replicas), ("client", &cluster.clients)] {
            for entry in entries {
                parse_entry(kind, entry)?;
            }
        }

        let protocol = &self.protocol;
        if protocol.checkpoint_interval == 0 {
            return invalid("checkpoint_interval must be positive".to_string());
        }
        if protocol.checkpoint_max_out < protocol.checkpoint_interval {
            return invalid(format!(
                "checkpoint_max_out ({}) must be at least checkpoint_interval ({})",
                protocol.checkpoint_max_out, protocol.checkpoint_interval
            ));
        }
        if protocol.congestion_window == 0 {
            return invalid("congestion_window must be positive".to_string());
        }
        if protocol.max_batch_requests == 0 {
            return invalid("max_batch_requests must be positive".to_string());
        }

        let timers = &self.timers;
        if [
            timers.key_refresh_ms,
            timers.status_ms,
            timers.view_change_ms,
            timers.idle_ms,
        ]
        .contains(&0)
        {
            return invalid("timer intervals must be positive".to_string());
        }
        if self.node.task_queue_capacity == 0 {
            return invalid("task_queue_capacity must be positive".to_string());
        }
        Ok(())
    }

    /// The agreement-core configuration this file describes.
    pub fn replica_config(&self) -> Result<ReplicaConfig, ConfigError> {
        self.validate()?;
        let protocol = &self.protocol;
        let timers = &self.timers;
        Ok(ReplicaConfig::new(ClusterConfig::new(self.cluster.f))
            .with_protocol(ProtocolConfig {
                checkpoint_interval: protocol.checkpoint_interval,
                checkpoint_max_out: protocol.checkpoint_max_out,
                congestion_window: protocol.congestion_window,
                max_batch_requests: protocol.max_batch_requests,
                max_batch_bytes: protocol.max_batch_bytes,
                big_request_threshold: protocol.big_request_threshold,
                sign_protocol_messages: protocol.sign_protocol_messages,
                max_buffered_messages: protocol.max_buffered_messages,
            })
            .with_timers(TimerConfig {
                key_refresh: Duration::from_millis(timers.key_refresh_ms),
                status: Duration::from_millis(timers.status_ms),
                view_change: Duration::from_millis(timers.view_change_ms),
                idle: Duration::from_millis(timers.idle_ms),
            }))
    }

    /// Every principal's public identity.
    pub fn principals(&self) -> Result<PrincipalSet, ConfigError> {
        self.validate()?;
        let build = |kind: &str, entries: &[PrincipalEntry]| {
            let mut sorted: Vec<&PrincipalEntry> = entries.iter().collect();
            sorted.sort_by_key(|e| e.index);
            sorted
                .into_iter()
                .map(|entry| parse_entry(kind, entry))
                .collect::<Result<Vec<Principal>, ConfigError>>()
        };
        Ok(PrincipalSet::new(
            build("replica", &self.cluster.replicas)?,
            build("client", &self.cluster.clients)?,
        ))
    }

    /// Builds the keyring for `me`, checking that `keys` match the public
    /// keys the cluster file lists for it.
    pub fn keyring(&self, me: PrincipalId, keys: NodeKeys) -> Result<Keyring, ConfigError> {
        let principals = self.principals()?;
        let Some(principal) = principals.get(me) else {
            return Err(ConfigError::ValidationError(format!(
                "{me} is not in the cluster file"
            )));
        };
        if *principal.verifying_key() != keys.verifying_key()
            || *principal.exchange_key() != keys.exchange_key()
        {
            return Err(ConfigError::KeyError {
                owner: me.to_string(),
                reason: "local keys do not match the cluster file".to_string(),
            });
        }
        Ok(Keyring::new(
            me,
            keys.signing_key,
            keys.exchange_secret,
            principals,
        ))
    }

    /// Reads this node's key files and builds its keyring.
    pub fn load_keyring(&self, me: PrincipalId) -> Result<Keyring, ConfigError> {
        let keys = NodeKeys::read(&self.node.signing_key_file, &self.node.exchange_key_file)?;
        self.keyring(me, keys)
    }
}

fn check_dense(kind: &str, entries: &[PrincipalEntry]) -> Result<(), ConfigError> {
    let mut indices: Vec<u32> = entries.iter().map(|e| e.index).collect();
    indices.sort_unstable();
    for (expected, index) in indices.into_iter().enumerate() {
        if index as usize != expected {
            return Err(ConfigError::ValidationError(format!(
                "{kind} indices must be dense from 0, missing {expected}"
            )));
        }
    }
    Ok(())
}

fn parse_entry(kind: &str, entry: &PrincipalEntry) -> Result<Principal, ConfigError> {
    let id = match kind {
        "replica" => PrincipalId::Replica(ReplicaId::new(entry.index)),
        _ => PrincipalId::Client(ClientId::new(entry.index)),
    };
    let owner = id.to_string();

    let address: SocketAddr = entry.address.parse().map_err(|e| {
        ConfigError::ValidationError(format!("bad address {:?} for {owner}: {e}", entry.address))
    })?;
    let verifying_key = VerifyingKey::from_bytes(&keys::decode_key(&owner, &entry.signing_key)?)
        .map_err(|e| ConfigError::KeyError {
            owner: owner.clone(),
            reason: e.to_string(),
        })?;
    let exchange_key = ExchangePublicKey::from_bytes(keys::decode_key(&owner, &entry.exchange_key)?);

    Ok(Principal::new(id, address, verifying_key, exchange_key))
}


#[cfg(test)]
mod tests {
    use super::testing::cluster_toml;
    use super::*;

    fn cluster_file(keys: &[NodeKeys]) -> ClusterFile {
        toml::from_str(&cluster_toml(keys)).expect("valid toml")
    }

    fn keys(n: usize) -> Vec<NodeKeys> {
        (0..n).map(|_| NodeKeys::generate()).collect()
    }

    #[test]
    fn test_default_config() {
        let config = ClusterFile::default();
        assert_eq!(config.cluster.f, 1);
        assert_eq!(config.protocol.checkpoint_interval, 128);
        assert_eq!(config.timers.view_change_ms, 5_000);
        assert!(config.validate().is_err(), "defaults list no replicas");
    }

    #[test]
    fn test_replica_config_conversion() {
        let mut file = cluster_file(&keys(5));
        file.protocol.congestion_window = 8;
        file.timers.idle_ms = 20;

        let config = file.replica_config().expect("valid");
        assert_eq!(config.cluster.replica_count(), 4);
        assert_eq!(config.protocol.congestion_window, 8);
        assert_eq!(config.timers.idle, Duration::from_millis(20));
    }

    #[test]
    fn test_principals_are_sorted_by_index() {
        let mut file = cluster_file(&keys(5));
        file.cluster.replicas.reverse();

        let principals = file.principals().expect("valid");
        assert_eq!(principals.replica_count(), 4);
        assert_eq!(principals.client_count(), 1);
        let third = principals
            .get(ReplicaId::new(2).into())
            .expect("replica 2");
        assert_eq!(third.address(), "127.0.0.1:7002".parse().expect("addr"));
    }

    #[test]
    fn test_validation_failures() {
        let base = cluster_file(&keys(5));

        let mut sparse = base.clone();
        sparse.cluster.replicas[3].index = 7;
        assert!(sparse.validate().is_err());

        let mut bad_key = base.clone();
        bad_key.cluster.clients[0].signing_key = "00".to_string();
        assert!(matches!(
            bad_key.validate(),
            Err(ConfigError::KeyError { .. })
        ));

        let mut bad_address = base.clone();
        bad_address.cluster.replicas[0].address = "nowhere".to_string();
        assert!(bad_address.validate().is_err());

        let mut no_checkpoints = base.clone();
        no_checkpoints.protocol.checkpoint_interval = 0;
        assert!(no_checkpoints.validate().is_err());

        let mut no_window = base;
        no_window.protocol.congestion_window = 0;
        assert!(no_window.validate().is_err());
    }

    #[test]
    fn test_keyring_checks_local_keys() {
        let mut node_keys = keys(5);
        let file = cluster_file(&node_keys);
        let me = PrincipalId::Replica(ReplicaId::new(1));

        let wrong = NodeKeys::generate();
        assert!(matches!(
            file.keyring(me, wrong),
            Err(ConfigError::KeyError { .. })
        ));

        let mine = node_keys.swap_remove(1);
        let keyring = file.keyring(me, mine).expect("matching keys");
        assert_eq!(keyring.me(), me);
        assert_eq!(keyring.replica_count(), 4);
    }

    #[test]
    fn test_path_resolution() {
        let mut config = ClusterFile::default();
        config.resolve_paths("/etc/pbft");
        assert_eq!(
            config.node.signing_key_file,
            PathBuf::from("/etc/pbft/keys/signing.key")
        );
    }
}
