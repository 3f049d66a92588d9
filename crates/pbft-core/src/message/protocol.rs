//! Normal-case agreement messages: PrePrepare, Prepare, Commit, Checkpoint
//! and Status.

use bytes::Bytes;
use pbft_types::{Digest, PrincipalId, ReplicaId, RequestId, SeqNo, ViewNumber};
use serde::{Deserialize, Serialize};

use super::AuthenticatedRequest;

// ============================================================================
// PrePrepare
// ============================================================================

/// Placeholder for a request too large to embed in a PrePrepare.
///
/// Backups obtain the body directly from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRef {
    pub sender: PrincipalId,
    pub request_id: RequestId,
    /// Consensus digest of the referenced request.
    pub digest: Digest,
}

/// One request slot in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchEntry {
    Full(AuthenticatedRequest),
    Reference(RequestRef),
}

impl BatchEntry {
    pub fn sender(&self) -> PrincipalId {
        match self {
            Self::Full(r) => r.sender(),
            Self::Reference(r) => r.sender,
        }
    }

    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Full(r) => r.request_id(),
            Self::Reference(r) => r.request_id,
        }
    }

    pub fn consensus_digest(&self) -> Digest {
        match self {
            Self::Full(r) => r.consensus_digest(),
            Self::Reference(r) => r.digest,
        }
    }

    /// The embedded request, if carried in full.
    pub fn full(&self) -> Option<&AuthenticatedRequest> {
        match self {
            Self::Full(r) => Some(r),
            Self::Reference(_) => None,
        }
    }
}

/// The primary's proposal binding `(view, seqno)` to a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub view: ViewNumber,
    pub seqno: SeqNo,
    /// Must be the primary of `view`.
    pub replica: ReplicaId,
    /// Requests in execution order.
    pub entries: Vec<BatchEntry>,
    /// Non-deterministic choices made by the primary (e.g. timestamps).
    pub non_deterministic: Bytes,
}

impl PrePrepare {
    /// An empty proposal; executing it only advances the sequence number.
    pub fn null(view: ViewNumber, seqno: SeqNo, replica: ReplicaId) -> Self {
        Self {
            view,
            seqno,
            replica,
            entries: Vec::new(),
            non_deterministic: Bytes::new(),
        }
    }

    /// `SHA-256(Σ request consensus digests ‖ non-deterministic choices)`.
    ///
    /// Independent of view, seqno and authenticators, so a proposal carried
    /// into a new view keeps its digest.
    pub fn consensus_digest(&self) -> Digest {
        self.entries
            .iter()
            .fold(pbft_crypto::DigestBuilder::new(), |builder, entry| {
                builder.update_digest(&entry.consensus_digest())
            })
            .update(&self.non_deterministic)
            .finalize()
    }

    pub fn is_null(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a copy re-proposed at `view` by `replica`.
    pub fn reproposed(&self, view: ViewNumber, replica: ReplicaId) -> Self {
        Self {
            view,
            replica,
            ..self.clone()
        }
    }
}

// ============================================================================
// Votes
// ============================================================================

/// A backup's vote that it accepted the PrePrepare for `(view, seqno)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub view: ViewNumber,
    pub seqno: SeqNo,
    pub digest: Digest,
    pub replica: ReplicaId,
}

/// A replica's vote that `(view, seqno, digest)` is prepared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub view: ViewNumber,
    pub seqno: SeqNo,
    pub digest: Digest,
    pub replica: ReplicaId,
}

/// A replica's application-state digest after executing `seqno`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seqno: SeqNo,
    pub state_digest: Digest,
    pub replica: ReplicaId,
}

/// Periodic progress report used to trigger retransmissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub view: ViewNumber,
    pub has_new_view: bool,
    pub last_stable: SeqNo,
    pub last_executed: SeqNo,
    /// In-window seqnos above `last_executed` the sender has prepared.
    pub prepared: Vec<SeqNo>,
    /// In-window seqnos above `last_executed` the sender has committed.
    pub committed: Vec<SeqNo>,
    pub replica: ReplicaId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Authenticator, Replier, Request, RequestFlags};
    use pbft_types::ClientId;

    fn full(id: u64) -> BatchEntry {
        BatchEntry::Full(AuthenticatedRequest::new(
            Request::new(
                ClientId::new(0).into(),
                RequestId::new(id),
                RequestFlags::default(),
                Replier::All,
                Bytes::from(vec![id as u8; 8]),
            ),
            Authenticator::None,
        ))
    }

    #[test]
    fn reference_and_full_entries_share_digest() {
        let entry = full(1);
        let reference = BatchEntry::Reference(RequestRef {
            sender: entry.sender(),
            request_id: entry.request_id(),
            digest: entry.consensus_digest(),
        });

        let with_full = PrePrepare {
            entries: vec![entry],
            ..PrePrepare::null(ViewNumber::ZERO, SeqNo::new(1), ReplicaId::new(0))
        };
        let with_ref = PrePrepare {
            entries: vec![reference],
            ..with_full.clone()
        };

        assert_eq!(with_full.consensus_digest(), with_ref.consensus_digest());
        assert!(with_ref.entries[0].full().is_none());
    }

    #[test]
    fn digest_depends_on_order_and_non_determinism() {
        let base = PrePrepare {
            entries: vec![full(1), full(2)],
            ..PrePrepare::null(ViewNumber::ZERO, SeqNo::new(1), ReplicaId::new(0))
        };
        let swapped = PrePrepare {
            entries: vec![full(2), full(1)],
            ..base.clone()
        };
        let timestamped = PrePrepare {
            non_deterministic: Bytes::from_static(b"t=5"),
            ..base.clone()
        };

        assert_ne!(base.consensus_digest(), swapped.consensus_digest());
        assert_ne!(base.consensus_digest(), timestamped.consensus_digest());
    }

    #[test]
    fn reproposal_keeps_digest() {
        let original = PrePrepare {
            entries: vec![full(1)],
            ..PrePrepare::null(ViewNumber::ZERO, SeqNo::new(4), ReplicaId::new(0))
        };
        let moved = original.reproposed(ViewNumber::new(1), ReplicaId::new(1));

        assert_eq!(moved.view, ViewNumber::new(1));
        assert_eq!(moved.seqno, SeqNo::new(4));
        assert_eq!(moved.consensus_digest(), original.consensus_digest());
    }

    #[test]
    fn null_proposals_share_a_digest() {
        let a = PrePrepare::null(ViewNumber::ZERO, SeqNo::new(1), ReplicaId::new(0));
        let b = PrePrepare::null(ViewNumber::new(3), SeqNo::new(9), ReplicaId::new(3));
        assert!(a.is_null());
        assert_eq!(a.consensus_digest(), b.consensus_digest());
    }
}
