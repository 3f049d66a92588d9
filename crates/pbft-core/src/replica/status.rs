//! Status messages and retransmission.
//!
//! Replicas periodically broadcast where they are. A peer that reports an
//! older view gets the NewView that started this one; a peer behind in the
//! same view gets this replica's own agreement messages for the in-progress
//! seqnos it reports neither prepared nor committed, and its stable
//! checkpoint vote.

use pbft_types::{Digest, SeqNo};

use crate::application::Application;
use crate::message::{Checkpoint, Commit, MessagePayload, Prepare, Status};
use crate::timer::{TimeoutKind, TimerCommand};

use super::{Destination, ReplicaOutput, ReplicaState};

impl<A: Application> ReplicaState<A> {
    /// Broadcasts a Status and rearms the status timer.
    pub(crate) fn send_status(&mut self) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        let (prepared, committed) = self.in_progress();
        let status = Status {
            view: self.view,
            has_new_view: self.has_new_view,
            last_stable: self.last_stable,
            last_executed: self.last_executed,
            prepared,
            committed,
            replica: self.replica_id,
        };
        self.broadcast(&mut output, MessagePayload::Status(status));
        output.timer(TimerCommand::Restart(TimeoutKind::Status));
        output
    }

    /// Unexecuted in-window seqnos this replica has prepared, and the subset
    /// it has committed.
    fn in_progress(&self) -> (Vec<SeqNo>, Vec<SeqNo>) {
        let cluster = self.config.cluster;
        let mut prepared = Vec::new();
        let mut committed = Vec::new();
        let mut seqno = self.last_executed.next().max(self.log.head());
        while let Ok(cert) = self.log.get(seqno) {
            if cert.is_prepared(&cluster) {
                prepared.push(seqno);
                if cert.is_committed(&cluster) {
                    committed.push(seqno);
                }
            }
            seqno = seqno.next();
        }
        (prepared, committed)
    }

    /// Retransmits whatever a lagging peer is missing.
    pub(crate) fn on_status(self, status: Status) -> (Self, ReplicaOutput) {
        let from = status.replica;
        if from == self.replica_id {
            return (self, ReplicaOutput::empty());
        }
        let mut output = ReplicaOutput::empty();

        // The checkpoint goes first so the peer's window can slide before
        // any PrePrepare beyond it arrives.
        if status.last_stable < self.last_stable {
            let checkpoint = Checkpoint {
                seqno: self.last_stable,
                state_digest: self.stable_digest,
                replica: self.replica_id,
            };
            self.send_to(&mut output, from, MessagePayload::Checkpoint(checkpoint));
        }

        if status.view < self.view || (status.view == self.view && !status.has_new_view) {
            if self.has_new_view {
                if let Some(new_view) = &self.new_view_message {
                    tracing::debug!(
                        replica = %self.replica_id,
                        to = %from,
                        view = %self.view,
                        "relaying NewView to lagging peer"
                    );
                    output.send(Destination::Replica(from), new_view.clone());
                }
            }
        } else if status.view == self.view && self.has_new_view {
            self.retransmit_agreement(&mut output, &status);
        }

        (self, output)
    }

    /// Resends this replica's own agreement messages for every in-window
    /// seqno above the peer's `last_executed` that the peer has not
    /// committed. PrePrepares and Prepares are skipped where the peer
    /// already reports the slot prepared.
    fn retransmit_agreement(&self, output: &mut ReplicaOutput, status: &Status) {
        let to = status.replica;
        let mut resent = 0usize;
        let mut seqno = status.last_executed.next().max(self.log.head());
        while let Ok(cert) = self.log.get(seqno) {
            if status.committed.contains(&seqno) {
                seqno = seqno.next();
                continue;
            }
            if let Some(digest) = cert.digest() {
                if !status.prepared.contains(&seqno) {
                    if cert.is_mine() {
                        if let Some(pre_prepare) = cert.refreshed_pre_prepare() {
                            self.send_to(output, to, MessagePayload::PrePrepare(pre_prepare));
                            resent += 1;
                        }
                    }
                    if cert.prepare_sent() {
                        let prepare = self.prepare_for(seqno, digest);
                        self.send_to(output, to, MessagePayload::Prepare(prepare));
                        resent += 1;
                    }
                }
                if cert.commit_sent() {
                    let commit = self.commit_for(seqno, digest);
                    self.send_to(output, to, MessagePayload::Commit(commit));
                    resent += 1;
                }
            }
            seqno = seqno.next();
        }
        if resent > 0 {
            tracing::debug!(
                replica = %self.replica_id,
                to = %to,
                view = %self.view,
                resent,
                "retransmitted agreement messages"
            );
        }
    }

    /// This replica's Prepare vote for `seqno` in the current view.
    pub(crate) fn prepare_for(&self, seqno: SeqNo, digest: Digest) -> Prepare {
        Prepare {
            view: self.view,
            seqno,
            digest,
            replica: self.replica_id,
        }
    }

    /// This replica's Commit vote for `seqno` in the current view.
    pub(crate) fn commit_for(&self, seqno: SeqNo, digest: Digest) -> Commit {
        Commit {
            view: self.view,
            seqno,
            digest,
            replica: self.replica_id,
        }
    }
}
