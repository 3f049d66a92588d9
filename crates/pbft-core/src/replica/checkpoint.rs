//! Checkpoints and log garbage collection.
//!
//! Every `checkpoint_interval` executed seqnos a replica broadcasts the
//! application's state digest. A checkpoint with `2f + 1` matching votes,
//! this replica's own among them, becomes stable: the log window slides
//! past it and older votes are discarded.

use std::collections::HashMap;

use pbft_types::{Digest, ReplicaId, SeqNo};

use crate::application::Application;
use crate::instrumentation::METRICS;
use crate::message::{Checkpoint, MessagePayload};

use super::{ReplicaOutput, ReplicaState};

impl<A: Application> ReplicaState<A> {
    /// Records and broadcasts this replica's checkpoint for `seqno`.
    pub(crate) fn send_checkpoint(&mut self, seqno: SeqNo) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        let state_digest = self.app.state_digest();
        self.checkpoints
            .entry(seqno)
            .or_default()
            .insert(self.replica_id, state_digest);

        tracing::debug!(
            replica = %self.replica_id,
            seqno = %seqno,
            digest = ?state_digest,
            "sending Checkpoint"
        );
        let checkpoint = Checkpoint {
            seqno,
            state_digest,
            replica: self.replica_id,
        };
        self.broadcast(&mut output, MessagePayload::Checkpoint(checkpoint));
        output.merge(self.check_stable(seqno));
        output
    }

    /// Handles a peer's Checkpoint vote.
    pub(crate) fn on_checkpoint(mut self, checkpoint: Checkpoint) -> (Self, ReplicaOutput) {
        let from = checkpoint.replica;
        if from == self.replica_id {
            return (self, ReplicaOutput::empty());
        }
        if checkpoint.seqno <= self.last_stable {
            tracing::trace!(
                replica = %self.replica_id,
                from = %from,
                seqno = %checkpoint.seqno,
                "ignoring Checkpoint at or below stable"
            );
            return (self, ReplicaOutput::empty());
        }
        if !checkpoint
            .seqno
            .is_checkpoint(self.config.protocol.checkpoint_interval)
        {
            self.violation(from, "Checkpoint off the checkpoint interval");
            return (self, ReplicaOutput::empty());
        }
        // Only votes within two windows of stable are kept.
        if checkpoint.seqno > self.last_stable + 2 * self.config.protocol.checkpoint_max_out {
            tracing::debug!(
                replica = %self.replica_id,
                from = %from,
                seqno = %checkpoint.seqno,
                "ignoring Checkpoint far ahead of stable"
            );
            return (self, ReplicaOutput::empty());
        }

        let votes = self.checkpoints.entry(checkpoint.seqno).or_default();
        if votes.contains_key(&from) {
            return (self, ReplicaOutput::empty());
        }
        votes.insert(from, checkpoint.state_digest);

        let output = self.check_stable(checkpoint.seqno);
        (self, output)
    }

    /// Makes `seqno` stable once `2f + 1` votes match this replica's own.
    fn check_stable(&mut self, seqno: SeqNo) -> ReplicaOutput {
        let Some(votes) = self.checkpoints.get(&seqno) else {
            return ReplicaOutput::empty();
        };
        let quorum = self.config.cluster.quorum();

        let Some(own) = votes.get(&self.replica_id).copied() else {
            if let Some(digest) = quorum_digest(votes, quorum) {
                tracing::warn!(
                    replica = %self.replica_id,
                    seqno = %seqno,
                    digest = ?digest,
                    "peers reached a checkpoint this replica has not; state transfer unsupported"
                );
            }
            return ReplicaOutput::empty();
        };
        let matching = votes.values().filter(|digest| **digest == own).count();
        if matching < quorum {
            return ReplicaOutput::empty();
        }

        self.mark_stable(seqno, own)
    }

    /// Slides the log window and discards state the checkpoint supersedes.
    pub(crate) fn mark_stable(&mut self, seqno: SeqNo, digest: Digest) -> ReplicaOutput {
        if seqno <= self.last_stable {
            return ReplicaOutput::empty();
        }
        self.last_stable = seqno;
        self.stable_digest = digest;
        self.log.advance_head(seqno.next());
        if self.next_seqno < seqno {
            self.next_seqno = seqno;
        }

        self.checkpoints.retain(|s, _| *s > seqno);
        // Prepared history is kept one window below stable for view changes.
        let keep_from = seqno - self.config.protocol.checkpoint_max_out;
        self.prepared_history.retain(|s, _| *s > keep_from);

        tracing::info!(
            replica = %self.replica_id,
            seqno = %seqno,
            digest = ?digest,
            "checkpoint stable"
        );
        METRICS.increment_stable_checkpoints();
        METRICS.set_last_stable(seqno.as_u64());

        self.send_pre_prepares()
    }
}

/// The digest at least `quorum` voters agree on, if any.
fn quorum_digest(votes: &HashMap<ReplicaId, Digest>, quorum: usize) -> Option<Digest> {
    let mut counts: HashMap<Digest, usize> = HashMap::new();
    for digest in votes.values() {
        *counts.entry(*digest).or_default() += 1;
    }
    counts
        .into_iter()
        .find(|(_, count)| *count >= quorum)
        .map(|(digest, _)| digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn votes(digests: &[u8]) -> HashMap<ReplicaId, Digest> {
        digests
            .iter()
            .enumerate()
            .map(|(i, d)| (ReplicaId::new(i as u32), Digest::from_bytes([*d; 32])))
            .collect()
    }

    #[test]
    fn quorum_digest_needs_enough_matching_votes() {
        assert_eq!(quorum_digest(&votes(&[1, 1, 2]), 3), None);
        assert_eq!(
            quorum_digest(&votes(&[1, 1, 2, 1]), 3),
            Some(Digest::from_bytes([1; 32]))
        );
    }
}
