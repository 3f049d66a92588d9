//! Cluster and protocol configuration.
//!
//! These are the already-validated values the agreement core consumes. File
//! and environment loading lives in `pbft-config`.

use std::time::Duration;

use pbft_types::{ReplicaId, ViewNumber};

// ============================================================================
// Cluster Configuration
// ============================================================================

/// Size and fault threshold of the replica set.
///
/// The replica set always has `n = 3f + 1` members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterConfig {
    max_faulty: usize,
}

impl ClusterConfig {
    /// Creates a cluster tolerating `f` faulty replicas.
    pub fn new(max_faulty: usize) -> Self {
        Self { max_faulty }
    }

    /// Creates a cluster from its replica count.
    ///
    /// # Panics
    ///
    /// Panics if `replica_count` is not of the form `3f + 1`.
    pub fn from_replica_count(replica_count: usize) -> Self {
        assert!(
            replica_count >= 1 && (replica_count - 1) % 3 == 0,
            "replica count must be 3f+1, got {replica_count}"
        );
        Self::new((replica_count - 1) / 3)
    }

    /// Number of replicas (`n`).
    pub fn replica_count(&self) -> usize {
        3 * self.max_faulty + 1
    }

    /// Maximum number of faulty replicas tolerated (`f`).
    pub fn max_faulty(&self) -> usize {
        self.max_faulty
    }

    /// Size of a certificate quorum (`2f + 1`).
    pub fn quorum(&self) -> usize {
        2 * self.max_faulty + 1
    }

    /// Smallest set guaranteed to contain a correct replica (`f + 1`).
    pub fn weak_quorum(&self) -> usize {
        self.max_faulty + 1
    }

    /// Prepares from others needed to prepare a proposal this replica made.
    pub fn prepares_needed_as_primary(&self) -> usize {
        2 * self.max_faulty
    }

    /// Prepares from others needed when this replica's own vote is implicit.
    pub fn prepares_needed_as_backup(&self) -> usize {
        (2 * self.max_faulty).saturating_sub(1)
    }

    /// The primary of `view` (`view mod n`).
    pub fn primary(&self, view: ViewNumber) -> ReplicaId {
        ReplicaId::new((view.as_u64() % self.replica_count() as u64) as u32)
    }

    /// True if `id` names a replica in this cluster.
    pub fn contains(&self, id: ReplicaId) -> bool {
        id.as_index() < self.replica_count()
    }

    /// Iterates over every replica id.
    pub fn replicas(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        (0..self.replica_count() as u32).map(ReplicaId::new)
    }
}

// ============================================================================
// Protocol Configuration
// ============================================================================

/// Tunables for batching, flow control and checkpointing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Executed sequence numbers between checkpoints.
    pub checkpoint_interval: u64,

    /// How far past the last stable checkpoint the primary may propose.
    /// Also the certificate log capacity.
    pub checkpoint_max_out: u64,

    /// How far past the last executed sequence number the primary may propose.
    pub congestion_window: u64,

    /// Maximum requests per PrePrepare.
    pub max_batch_requests: usize,

    /// Maximum encoded request bytes per PrePrepare.
    pub max_batch_bytes: usize,

    /// Requests whose encoding exceeds this are carried by digest reference.
    pub big_request_threshold: usize,

    /// Sign PrePrepare/Prepare/Commit/Checkpoint/Status instead of MAC'ing them.
    pub sign_protocol_messages: bool,

    /// Bound on messages held for a view this replica has not installed.
    pub max_buffered_messages: usize,
}

impl ProtocolConfig {
    /// Returns the configured log capacity.
    pub fn log_capacity(&self) -> usize {
        self.checkpoint_max_out as usize
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 128,
            checkpoint_max_out: 256,
            congestion_window: 1,
            max_batch_requests: 1,
            max_batch_bytes: 8196,
            big_request_threshold: 80,
            sign_protocol_messages: false,
            max_buffered_messages: 1024,
        }
    }
}

// ============================================================================
// Timer Configuration
// ============================================================================

/// Intervals of the four replica timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    pub key_refresh: Duration,
    pub status: Duration,
    /// Initial view-change suspicion timeout; doubles on each failed view.
    pub view_change: Duration,
    pub idle: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            key_refresh: Duration::from_secs(30),
            status: Duration::from_millis(150),
            view_change: Duration::from_secs(5),
            idle: Duration::from_secs(1),
        }
    }
}

/// Everything a replica needs besides its keys and application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaConfig {
    pub cluster: ClusterConfig,
    pub protocol: ProtocolConfig,
    pub timers: TimerConfig,
}

impl ReplicaConfig {
    pub fn new(cluster: ClusterConfig) -> Self {
        Self {
            cluster,
            protocol: ProtocolConfig::default(),
            timers: TimerConfig::default(),
        }
    }

    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_timers(mut self, timers: TimerConfig) -> Self {
        self.timers = timers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(0, 1, 1, 0, 0; "single replica")]
    #[test_case(1, 4, 3, 2, 1; "four replicas")]
    #[test_case(2, 7, 5, 4, 3; "seven replicas")]
    fn quorum_sizes(f: usize, n: usize, quorum: usize, as_primary: usize, as_backup: usize) {
        let config = ClusterConfig::new(f);
        assert_eq!(config.replica_count(), n);
        assert_eq!(config.quorum(), quorum);
        assert_eq!(config.weak_quorum(), f + 1);
        assert_eq!(config.prepares_needed_as_primary(), as_primary);
        assert_eq!(config.prepares_needed_as_backup(), as_backup);
    }

    #[test]
    fn from_replica_count_accepts_3f_plus_1() {
        assert_eq!(ClusterConfig::from_replica_count(4).max_faulty(), 1);
        assert_eq!(ClusterConfig::from_replica_count(10).max_faulty(), 3);
    }

    #[test]
    #[should_panic(expected = "3f+1")]
    fn from_replica_count_rejects_other_sizes() {
        let _ = ClusterConfig::from_replica_count(5);
    }

    #[test]
    fn primary_rotates_with_view() {
        let config = ClusterConfig::new(1);
        assert_eq!(config.primary(ViewNumber::new(0)), ReplicaId::new(0));
        assert_eq!(config.primary(ViewNumber::new(3)), ReplicaId::new(3));
        assert_eq!(config.primary(ViewNumber::new(5)), ReplicaId::new(1));
    }

    #[test]
    fn default_log_capacity_is_twice_interval() {
        let protocol = ProtocolConfig::default();
        assert_eq!(
            protocol.log_capacity() as u64,
            protocol.checkpoint_interval * 2
        );
    }

    proptest! {
        #[test]
        fn any_two_quorums_share_a_correct_replica(f in 0usize..50) {
            let config = ClusterConfig::new(f);
            // |Q1 ∩ Q2| >= 2q - n = f + 1
            let overlap = 2 * config.quorum() - config.replica_count();
            prop_assert_eq!(overlap, config.weak_quorum());
        }
    }
}
