//! View-change messages.
//!
//! Both messages are always signed: a `NewView` carries the `ViewChange`
//! messages it was built from, and backups must be able to check those
//! signatures themselves.

use pbft_crypto::{Signature, VerifyingKey};
use pbft_types::{Digest, ReplicaId, SeqNo, ViewNumber};
use serde::{Deserialize, Serialize};

use super::{MessageTag, PrePrepare, encode_content, tagged_digest};

/// A sequence number this replica prepared, with the proposal itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedEntry {
    pub seqno: SeqNo,
    /// View in which the proposal prepared.
    pub view: ViewNumber,
    pub digest: Digest,
    pub pre_prepare: PrePrepare,
}

impl PreparedEntry {
    /// The entry agrees with the proposal it carries.
    pub fn is_consistent(&self) -> bool {
        self.pre_prepare.seqno == self.seqno
            && self.pre_prepare.view == self.view
            && self.pre_prepare.consensus_digest() == self.digest
    }
}

/// A replica's vote to move to `new_view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    pub new_view: ViewNumber,
    pub replica: ReplicaId,
    pub last_stable: SeqNo,
    pub stable_digest: Digest,
    /// At most one entry per covered seqno (see [`ViewChange::covers`]), for
    /// the highest view in which it prepared. Sorted by seqno.
    pub prepared: Vec<PreparedEntry>,
}

impl ViewChange {
    /// The digest the sender's signature covers.
    pub fn content_digest(&self) -> Digest {
        tagged_digest(MessageTag::ViewChange, &encode_content(self))
    }

    /// The prepared entry for `seqno`, if reported.
    pub fn prepared_at(&self, seqno: SeqNo) -> Option<&PreparedEntry> {
        self.prepared
            .binary_search_by_key(&seqno, |entry| entry.seqno)
            .ok()
            .map(|i| &self.prepared[i])
    }

    /// True if this view change carries prepared information for `seqno`.
    ///
    /// Replicas keep prepared entries for one window below their stable
    /// checkpoint, so a view change speaks for seqnos in
    /// `(last_stable - max_out, last_stable + max_out]`.
    pub fn covers(&self, seqno: SeqNo, max_out: u64) -> bool {
        seqno > SeqNo::new(self.last_stable.as_u64().saturating_sub(max_out))
            && seqno <= self.last_stable + max_out
    }

    /// Structural checks that need no keys.
    ///
    /// Entries are strictly increasing, lie in the covered window, predate
    /// the new view and match their proposals.
    pub fn is_well_formed(&self, max_out: u64) -> bool {
        let increasing = self
            .prepared
            .windows(2)
            .all(|pair| pair[0].seqno < pair[1].seqno);
        increasing
            && self.prepared.iter().all(|entry| {
                self.covers(entry.seqno, max_out)
                    && entry.view < self.new_view
                    && entry.is_consistent()
            })
    }
}

/// A `ViewChange` with its sender's signature, as embedded in a `NewView`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedViewChange {
    pub view_change: ViewChange,
    pub signature: Signature,
}

impl SignedViewChange {
    pub fn verify(&self, key: &VerifyingKey) -> bool {
        key.verify(self.view_change.content_digest().as_bytes(), &self.signature)
    }
}

/// The new primary's certificate that view `view` has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    pub view: ViewNumber,
    pub replica: ReplicaId,
    /// Checkpoint the new view starts from.
    pub min_s: SeqNo,
    pub stable_digest: Digest,
    /// The `2f+1` (or more) view changes the selection was computed from.
    pub view_changes: Vec<SignedViewChange>,
    /// One proposal per seqno in `(min_s, max_s]`, in order; null proposals
    /// fill seqnos where nothing could have committed.
    pub pre_prepares: Vec<PrePrepare>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_crypto::SigningKey;

    fn entry(seqno: u64, view: u64) -> PreparedEntry {
        let pre_prepare =
            PrePrepare::null(ViewNumber::new(view), SeqNo::new(seqno), ReplicaId::new(0));
        PreparedEntry {
            seqno: SeqNo::new(seqno),
            view: ViewNumber::new(view),
            digest: pre_prepare.consensus_digest(),
            pre_prepare,
        }
    }

    fn view_change(prepared: Vec<PreparedEntry>) -> ViewChange {
        ViewChange {
            new_view: ViewNumber::new(2),
            replica: ReplicaId::new(1),
            last_stable: SeqNo::new(10),
            stable_digest: Digest::ZERO,
            prepared,
        }
    }

    #[test]
    fn well_formed_view_change() {
        let vc = view_change(vec![entry(11, 0), entry(12, 1)]);
        assert!(vc.is_well_formed(256));
        assert_eq!(vc.prepared_at(SeqNo::new(12)).map(|e| e.view), Some(ViewNumber::new(1)));
        assert!(vc.prepared_at(SeqNo::new(13)).is_none());
    }

    #[test]
    fn coverage_spans_a_window_either_side_of_the_checkpoint() {
        let vc = view_change(vec![]);
        assert!(!vc.covers(SeqNo::new(5), 5));
        assert!(vc.covers(SeqNo::new(6), 5));
        assert!(vc.covers(SeqNo::new(15), 5));
        assert!(!vc.covers(SeqNo::new(16), 5));
        // Entries just below the checkpoint are still reported
        assert!(view_change(vec![entry(8, 0), entry(11, 1)]).is_well_formed(5));
    }

    #[test]
    fn malformed_view_changes() {
        // More than a window below the checkpoint
        assert!(!view_change(vec![entry(5, 0)]).is_well_formed(5));
        // Not from an earlier view
        assert!(!view_change(vec![entry(11, 2)]).is_well_formed(256));
        // Duplicate seqno
        assert!(!view_change(vec![entry(11, 0), entry(11, 1)]).is_well_formed(256));
        // Beyond the window
        assert!(!view_change(vec![entry(20, 0)]).is_well_formed(5));

        // Digest that does not match the proposal
        let mut forged = entry(11, 0);
        forged.digest = pbft_crypto::sha256(b"other");
        assert!(!view_change(vec![forged]).is_well_formed(256));
    }

    #[test]
    fn signed_view_change_verifies() {
        let key = SigningKey::generate();
        let vc = view_change(vec![entry(11, 0)]);
        let signed = SignedViewChange {
            signature: key.sign(vc.content_digest().as_bytes()),
            view_change: vc,
        };

        assert!(signed.verify(&key.verifying_key()));
        assert!(!signed.verify(&SigningKey::generate().verifying_key()));

        let mut tampered = signed.clone();
        tampered.view_change.last_stable = SeqNo::new(0);
        assert!(!tampered.verify(&key.verifying_key()));
    }
}
