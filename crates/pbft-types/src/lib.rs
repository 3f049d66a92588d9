//! # pbft-types: Core types for the PBFT agreement core
//!
//! This crate contains the small, `Copy` identifier types shared by every
//! other crate in the workspace:
//! - Principal identities ([`ReplicaId`], [`ClientId`], [`PrincipalId`])
//! - Protocol counters ([`ViewNumber`], [`SeqNo`], [`RequestId`])
//! - Cryptographic digests ([`struct@Digest`])

use std::{
    fmt::{Debug, Display},
    ops::{Add, Sub},
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Principal Identities - All Copy (cheap 4-byte values)
// ============================================================================

/// Index of a replica within the fixed replica set (`0..n`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ReplicaId(u32);

impl ReplicaId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Position of this replica in per-replica vectors (authenticators,
    /// principal tables).
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}

impl From<u32> for ReplicaId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ReplicaId> for u32 {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

/// Index of a client within the fixed client set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ClientId(u32);

impl ClientId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "C{}", self.0)
    }
}

impl From<u32> for ClientId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ClientId> for u32 {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

/// Identity of any protocol participant.
///
/// The sender class is part of the identity: replica 0 and client 0 are
/// different principals with different keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PrincipalId {
    Replica(ReplicaId),
    Client(ClientId),
}

impl PrincipalId {
    pub fn is_replica(self) -> bool {
        matches!(self, Self::Replica(_))
    }

    pub fn is_client(self) -> bool {
        matches!(self, Self::Client(_))
    }

    /// Returns the replica id if this principal is a replica.
    pub fn as_replica(self) -> Option<ReplicaId> {
        match self {
            Self::Replica(id) => Some(id),
            Self::Client(_) => None,
        }
    }

    /// Returns the client id if this principal is a client.
    pub fn as_client(self) -> Option<ClientId> {
        match self {
            Self::Client(id) => Some(id),
            Self::Replica(_) => None,
        }
    }
}

impl Display for PrincipalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replica(id) => Display::fmt(id, f),
            Self::Client(id) => Display::fmt(id, f),
        }
    }
}

impl From<ReplicaId> for PrincipalId {
    fn from(id: ReplicaId) -> Self {
        Self::Replica(id)
    }
}

impl From<ClientId> for PrincipalId {
    fn from(id: ClientId) -> Self {
        Self::Client(id)
    }
}

// ============================================================================
// Protocol Counters - All Copy (cheap 8-byte values)
// ============================================================================

/// A view number.
///
/// The primary of view `v` is replica `v mod n`. Views only ever increase.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    pub const ZERO: ViewNumber = ViewNumber(0);

    pub fn new(view: u64) -> Self {
        Self(view)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the view that follows this one.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ViewNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ViewNumber> for u64 {
    fn from(view: ViewNumber) -> Self {
        view.0
    }
}

/// A sequence number assigned by the primary to a batch of requests.
///
/// Sequence number zero is the genesis checkpoint; the first batch is
/// assigned sequence number one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SeqNo(u64);

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);

    pub fn new(seqno: u64) -> Self {
        Self(seqno)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the sequence number before this one, saturating at zero.
    pub fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Returns the number of sequence numbers in `other..self`, or zero.
    pub fn distance_from(self, other: SeqNo) -> u64 {
        self.0.saturating_sub(other.0)
    }

    /// True if this sequence number ends a checkpoint interval.
    pub fn is_checkpoint(self, interval: u64) -> bool {
        interval > 0 && self.0 % interval == 0
    }
}

impl Display for SeqNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SeqNo {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SeqNo> for u64 {
    fn from(seqno: SeqNo) -> Self {
        seqno.0
    }
}

impl Add<u64> for SeqNo {
    type Output = SeqNo;

    fn add(self, rhs: u64) -> Self::Output {
        SeqNo(self.0.saturating_add(rhs))
    }
}

impl Sub<u64> for SeqNo {
    type Output = SeqNo;

    fn sub(self, rhs: u64) -> Self::Output {
        SeqNo(self.0.saturating_sub(rhs))
    }
}

/// A client-chosen request identifier.
///
/// Request ids from a given client must strictly increase; replicas use
/// them to discard stale retransmissions and to answer duplicates from
/// the reply cache.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RequestId(u64);

impl RequestId {
    pub const ZERO: RequestId = RequestId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<RequestId> for u64 {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

// ============================================================================
// Digest
// ============================================================================

/// Length of a SHA-256 digest in bytes.
pub const DIGEST_LENGTH: usize = 32;

/// A 32-byte SHA-256 digest.
///
/// The all-zero digest stands for "no content" (for example the state
/// digest of the genesis checkpoint).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest([u8; DIGEST_LENGTH]);

impl Digest {
    pub const ZERO: Digest = Digest([0u8; DIGEST_LENGTH]);

    pub fn from_bytes(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; DIGEST_LENGTH]
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 8 bytes are enough to tell digests apart in logs
        write!(
            f,
            "Digest({:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}...)",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5], self.0[6], self.0[7]
        )
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<[u8; DIGEST_LENGTH]> for Digest {
    fn from(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl From<Digest> for [u8; DIGEST_LENGTH] {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn principal_classes_are_distinct() {
        let replica = PrincipalId::from(ReplicaId::new(0));
        let client = PrincipalId::from(ClientId::new(0));

        assert_ne!(replica, client);
        assert!(replica.is_replica());
        assert!(client.is_client());
        assert_eq!(replica.as_replica(), Some(ReplicaId::new(0)));
        assert_eq!(client.as_replica(), None);
        assert_eq!(client.as_client(), Some(ClientId::new(0)));
    }

    #[test]
    fn principal_display() {
        assert_eq!(PrincipalId::from(ReplicaId::new(3)).to_string(), "R3");
        assert_eq!(PrincipalId::from(ClientId::new(7)).to_string(), "C7");
    }

    #[test_case(0, 10, true; "genesis")]
    #[test_case(10, 10, true; "exact interval")]
    #[test_case(15, 10, false; "mid interval")]
    #[test_case(20, 0, false; "zero interval never checkpoints")]
    fn seqno_checkpoint_boundaries(seqno: u64, interval: u64, expected: bool) {
        assert_eq!(SeqNo::new(seqno).is_checkpoint(interval), expected);
    }

    #[test]
    fn seqno_arithmetic_saturates() {
        assert_eq!(SeqNo::ZERO.prev(), SeqNo::ZERO);
        assert_eq!(SeqNo::new(u64::MAX).next(), SeqNo::new(u64::MAX));
        assert_eq!(SeqNo::new(5) - 10, SeqNo::ZERO);
        assert_eq!(SeqNo::new(5) + 3, SeqNo::new(8));
        assert_eq!(SeqNo::new(5).distance_from(SeqNo::new(9)), 0);
        assert_eq!(SeqNo::new(9).distance_from(SeqNo::new(5)), 4);
    }

    #[test]
    fn digest_zero_and_display() {
        assert!(Digest::ZERO.is_zero());
        assert!(Digest::default().is_zero());

        let digest = Digest::from_bytes([0xab; DIGEST_LENGTH]);
        assert!(!digest.is_zero());
        assert_eq!(digest.to_string(), "ab".repeat(DIGEST_LENGTH));
        assert!(format!("{digest:?}").starts_with("Digest(abababab"));
    }

    proptest! {
        #[test]
        fn view_next_is_strictly_greater(v in 0u64..u64::MAX) {
            let view = ViewNumber::new(v);
            prop_assert!(view.next() > view);
        }

        #[test]
        fn request_id_order_matches_u64(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(RequestId::new(a) < RequestId::new(b), a < b);
        }
    }
}
