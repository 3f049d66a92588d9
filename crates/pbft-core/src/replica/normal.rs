//! Normal operation protocol handlers.
//!
//! This module implements the three-phase agreement protocol:
//! - Request (client → primary, forwarded by backups)
//! - PrePrepare (primary → backups)
//! - Prepare (backup → all)
//! - Commit (all → all)
//!
//! and in-order execution of committed batches.

use bytes::Bytes;
use pbft_types::{PrincipalId, ReplicaId, RequestId, SeqNo, ViewNumber};

use crate::application::Application;
use crate::error::Rejection;
use crate::instrumentation::METRICS;
use crate::log::PrePrepareOutcome;
use crate::message::{
    AuthenticatedRequest, BatchEntry, Commit, MessagePayload, PrePrepare, Prepare,
    PreparedEntry, Reply, RequestRef,
};
use crate::timer::{TimeoutKind, TimerCommand};

use super::{Destination, Executed, ReplicaOutput, ReplicaState};

impl<A: Application> ReplicaState<A> {
    // ========================================================================
    // Request Handler
    // ========================================================================

    /// Handles a client request (sent directly or forwarded by a backup).
    ///
    /// 1. Answers retransmissions of the last executed request from the
    ///    reply table
    /// 2. Answers read-only requests without agreement when possible
    /// 3. Primary: queues the request and proposes it
    /// 4. Backup: queues it, forwards it to the primary and arms the
    ///    view-change timer
    pub(crate) fn on_request(mut self, request: AuthenticatedRequest) -> (Self, ReplicaOutput) {
        let sender = request.sender();
        let request_id = request.request_id();

        if !self.has_new_view {
            tracing::debug!(
                replica = %self.replica_id,
                from = %sender,
                request = %request_id,
                "dropping request during view change"
            );
            return (self, ReplicaOutput::empty());
        }

        if let Some(last) = self.replies.get(&sender) {
            if request_id < last.request_id {
                self.reject(&Rejection::StaleRequest {
                    sender,
                    request_id,
                    last_replied: last.request_id,
                });
                return (self, ReplicaOutput::empty());
            }
            if request_id == last.request_id {
                let mut output = ReplicaOutput::empty();
                let full = request.request.replier.includes(self.replica_id);
                self.send_reply(&mut output, last, full);
                return (self, output);
            }
        }

        if request.request.flags.read_only {
            let output = self.on_read_only(request);
            return (self, output);
        }

        if self.is_primary() {
            if self.log.change_by_primary(&request) {
                tracing::trace!(
                    replica = %self.replica_id,
                    from = %sender,
                    request = %request_id,
                    "request already proposed"
                );
                let output = self.resend_proposal(sender, request_id);
                return (self, output);
            }
            self.pending.append(request);
            METRICS.set_pending_requests(self.pending.len() as u64);
            let output = self.send_pre_prepares();
            return (self, output);
        }

        let mut output = ReplicaOutput::empty();
        if let Some(seqno) = self.log.change_by_backup(&request) {
            output.merge(self.try_send_prepare(seqno));
        }

        let proposed = self.log.lookup(sender, request_id).is_some();
        if !proposed {
            output.send(Destination::Replica(self.primary()), request.to_message());
        }
        self.pending.append(request);
        METRICS.set_pending_requests(self.pending.len() as u64);

        output.timer(TimerCommand::Start(TimeoutKind::ViewChange));
        (self, output)
    }

    fn on_read_only(&mut self, request: AuthenticatedRequest) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        if !self.try_read_only(&request, &mut output) {
            self.read_only_pending.append(request);
        }
        output
    }

    /// Executes a read-only request if nothing proposed is still
    /// uncommitted, so the result reflects every request ordered so far.
    fn try_read_only(&self, request: &AuthenticatedRequest, output: &mut ReplicaOutput) -> bool {
        if self.has_unexecuted_proposals() {
            return false;
        }
        let sender = request.sender();
        let Some(result) = self.app.execute_read_only(sender, &request.request.command) else {
            return false;
        };

        let reply = Reply {
            view: self.view,
            request_id: request.request_id(),
            requester: sender,
            replica: self.replica_id,
            result_digest: pbft_crypto::sha256(&result),
            result: Some(result),
        };
        self.send_reply(output, &reply, request.request.replier.includes(self.replica_id));
        METRICS.increment_read_only_executed();
        true
    }

    /// Retries queued read-only requests, keeping the ones that still
    /// cannot be answered.
    pub(crate) fn retry_read_only(&mut self) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        if self.read_only_pending.is_empty() || self.has_unexecuted_proposals() {
            return output;
        }
        for request in self.read_only_pending.drain() {
            if !self.try_read_only(&request, &mut output) {
                self.read_only_pending.append(request);
            }
        }
        output
    }

    fn has_unexecuted_proposals(&self) -> bool {
        let end = self.log.head() + self.log.capacity() as u64;
        let mut seqno = self.last_executed.next().max(self.log.head());
        while seqno < end {
            if self
                .log
                .get(seqno)
                .is_ok_and(|cert| cert.pre_prepare().is_some())
            {
                return true;
            }
            seqno = seqno.next();
        }
        false
    }

    // ========================================================================
    // PrePrepare (Primary)
    // ========================================================================

    /// Proposes batches of pending requests while both watermarks allow.
    ///
    /// The next seqno must stay within `congestion_window` of the last
    /// executed seqno and within `checkpoint_max_out` of the last stable
    /// checkpoint.
    pub(crate) fn send_pre_prepares(&mut self) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        let cluster = self.config.cluster;

        while self.is_primary() && self.has_new_view {
            let seqno = self.next_seqno.next();
            if seqno > self.last_executed + self.config.protocol.congestion_window
                || seqno > self.last_stable + self.config.protocol.checkpoint_max_out
            {
                tracing::trace!(
                    replica = %self.replica_id,
                    seqno = %seqno,
                    "proposal window full"
                );
                break;
            }

            let batch = self.next_batch();
            if batch.is_empty() {
                break;
            }

            let threshold = self.config.protocol.big_request_threshold;
            let entries = batch
                .iter()
                .map(|request| {
                    if request.request.encoded_len() > threshold {
                        BatchEntry::Reference(RequestRef {
                            sender: request.sender(),
                            request_id: request.request_id(),
                            digest: request.consensus_digest(),
                        })
                    } else {
                        BatchEntry::Full(request.clone())
                    }
                })
                .collect();
            let pre_prepare = PrePrepare {
                view: self.view,
                seqno,
                replica: self.replica_id,
                entries,
                non_deterministic: Bytes::new(),
            };

            match self.log.add_pre_prepare(pre_prepare.clone(), true, &cluster) {
                Ok(PrePrepareOutcome::Installed) => {}
                outcome => {
                    tracing::warn!(
                        replica = %self.replica_id,
                        seqno = %seqno,
                        ?outcome,
                        "could not install own proposal"
                    );
                    break;
                }
            }
            if let Ok(cert) = self.log.get_mut(seqno) {
                for (position, request) in batch.into_iter().enumerate() {
                    cert.fill_request(position, request);
                }
            }
            self.next_seqno = seqno;

            tracing::debug!(
                replica = %self.replica_id,
                view = %self.view,
                seqno = %seqno,
                requests = pre_prepare.entries.len(),
                "sending PrePrepare"
            );
            self.broadcast(&mut output, MessagePayload::PrePrepare(pre_prepare));
            output.merge(self.check_progress(seqno));
        }

        output
    }

    /// Picks the oldest pending requests that are neither proposed nor
    /// answered, up to the batch limits. Always takes at least one.
    fn next_batch(&self) -> Vec<AuthenticatedRequest> {
        let protocol = &self.config.protocol;
        let mut batch = Vec::new();
        let mut bytes = 0usize;

        for request in self.pending.iter() {
            if batch.len() >= protocol.max_batch_requests {
                break;
            }
            if self.log.lookup(request.sender(), request.request_id()).is_some()
                || self.already_answered(request.sender(), request.request_id())
            {
                continue;
            }
            let size = request.request.encoded_len().min(protocol.big_request_threshold);
            if !batch.is_empty() && bytes + size > protocol.max_batch_bytes {
                break;
            }
            bytes += size;
            batch.push(request.clone());
        }
        batch
    }

    fn already_answered(&self, sender: PrincipalId, request_id: RequestId) -> bool {
        self.replies
            .get(&sender)
            .is_some_and(|reply| reply.request_id >= request_id)
    }

    // ========================================================================
    // PrePrepare Handler (Backup)
    // ========================================================================

    /// Handles a PrePrepare from the primary.
    ///
    /// Every embedded request is verified against its sender. A request
    /// whose authenticator does not check out here may be replaced by a
    /// verified copy with the same consensus digest that reached this
    /// replica directly.
    pub(crate) fn on_pre_prepare(mut self, pre_prepare: PrePrepare) -> (Self, ReplicaOutput) {
        let from = pre_prepare.replica;

        if pre_prepare.view < self.view {
            self.reject(&Rejection::OldView {
                view: pre_prepare.view,
                current: self.view,
            });
            return (self, ReplicaOutput::empty());
        }
        if from != self.primary() || from == self.replica_id {
            self.violation(from, "PrePrepare not from the view's primary");
            return (self, ReplicaOutput::empty());
        }
        if !self.log.in_window(pre_prepare.seqno) {
            tracing::debug!(
                replica = %self.replica_id,
                from = %from,
                seqno = %pre_prepare.seqno,
                head = %self.log.head(),
                "PrePrepare outside log window"
            );
            return (self, ReplicaOutput::empty());
        }

        let PrePrepare {
            view,
            seqno,
            replica,
            entries,
            non_deterministic,
        } = pre_prepare;

        let mut verified = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                BatchEntry::Full(request) => match self.keys.verify_request(&request) {
                    Ok(()) => verified.push(BatchEntry::Full(request)),
                    Err(rejection) => {
                        let Some(copy) = self
                            .pending
                            .get(request.sender())
                            .filter(|p| p.consensus_digest() == request.consensus_digest())
                        else {
                            self.reject(&rejection);
                            return (self, ReplicaOutput::empty());
                        };
                        verified.push(BatchEntry::Full(copy.clone()));
                    }
                },
                reference @ BatchEntry::Reference(_) => verified.push(reference),
            }
        }

        let pre_prepare = PrePrepare {
            view,
            seqno,
            replica,
            entries: verified,
            non_deterministic,
        };
        let cluster = self.config.cluster;
        match self.log.add_pre_prepare(pre_prepare, false, &cluster) {
            Ok(PrePrepareOutcome::Installed | PrePrepareOutcome::Replaced) => {
                tracing::debug!(
                    replica = %self.replica_id,
                    from = %from,
                    view = %view,
                    seqno = %seqno,
                    "accepted PrePrepare"
                );
                self.fill_from_pending(seqno);
                let output = self.try_send_prepare(seqno);
                (self, output)
            }
            Ok(PrePrepareOutcome::Duplicate) => {
                let output = self.resend_votes(seqno);
                (self, output)
            }
            Ok(PrePrepareOutcome::Rejected) => {
                self.violation(from, "conflicting PrePrepare for an assigned seqno");
                (self, ReplicaOutput::empty())
            }
            Err(error) => {
                tracing::debug!(replica = %self.replica_id, %error, "PrePrepare not installed");
                (self, ReplicaOutput::empty())
            }
        }
    }

    /// Rebroadcasts the PrePrepare carrying a retransmitted request that is
    /// proposed but not yet executed.
    fn resend_proposal(&self, sender: PrincipalId, request_id: RequestId) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        let Some(location) = self.log.lookup(sender, request_id) else {
            return output;
        };
        if location.seqno <= self.last_executed {
            return output;
        }
        let pre_prepare = self
            .log
            .get(location.seqno)
            .ok()
            .filter(|cert| cert.is_mine())
            .and_then(|cert| cert.refreshed_pre_prepare());
        if let Some(pre_prepare) = pre_prepare {
            tracing::debug!(
                replica = %self.replica_id,
                seqno = %location.seqno,
                "resending PrePrepare for retransmitted request"
            );
            self.broadcast(&mut output, MessagePayload::PrePrepare(pre_prepare));
        }
        output
    }

    /// Rebroadcasts this backup's votes for an unexecuted slot whose
    /// PrePrepare the primary resent.
    fn resend_votes(&self, seqno: SeqNo) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        if seqno <= self.last_executed {
            return output;
        }
        let Ok(cert) = self.log.get(seqno) else {
            return output;
        };
        let Some(digest) = cert.digest() else {
            return output;
        };
        if cert.prepare_sent() {
            let prepare = self.prepare_for(seqno, digest);
            self.broadcast(&mut output, MessagePayload::Prepare(prepare));
        }
        if cert.commit_sent() {
            let commit = self.commit_for(seqno, digest);
            self.broadcast(&mut output, MessagePayload::Commit(commit));
        }
        output
    }

    /// Supplies referenced request bodies that already arrived directly.
    pub(crate) fn fill_from_pending(&mut self, seqno: SeqNo) {
        let Ok(cert) = self.log.get(seqno) else {
            return;
        };
        let fills: Vec<_> = cert
            .missing_requests()
            .filter_map(|(position, reference)| {
                self.pending
                    .get(reference.sender)
                    .filter(|request| {
                        request.request_id() == reference.request_id
                            && request.consensus_digest() == reference.digest
                    })
                    .map(|request| (position, request.clone()))
            })
            .collect();

        if let Ok(cert) = self.log.get_mut(seqno) {
            for (position, request) in fills {
                cert.fill_request(position, request);
            }
        }
    }

    /// Sends this backup's Prepare once the batch is complete. At most one
    /// Prepare is ever sent per slot.
    pub(crate) fn try_send_prepare(&mut self, seqno: SeqNo) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        let digest = match self.log.get_mut(seqno) {
            Ok(cert) if !cert.is_mine() && !cert.prepare_sent() && cert.is_complete() => {
                cert.mark_prepare_sent();
                cert.digest()
            }
            _ => None,
        };
        let Some(digest) = digest else {
            return output;
        };

        let prepare = self.prepare_for(seqno, digest);
        self.broadcast(&mut output, MessagePayload::Prepare(prepare));
        output.merge(self.check_progress(seqno));
        output
    }

    // ========================================================================
    // Prepare / Commit Handlers
    // ========================================================================

    /// Handles a Prepare vote.
    pub(crate) fn on_prepare(mut self, prepare: Prepare) -> (Self, ReplicaOutput) {
        let from = prepare.replica;
        if let Err(rejection) = self.check_vote(from, prepare.view, prepare.seqno) {
            self.reject(&rejection);
            return (self, ReplicaOutput::empty());
        }
        if from == self.primary() {
            self.violation(from, "Prepare from the view's primary");
            return (self, ReplicaOutput::empty());
        }

        let added = self
            .log
            .get_mut(prepare.seqno)
            .is_ok_and(|cert| cert.add_prepare(from, prepare.digest));
        if !added {
            return (self, ReplicaOutput::empty());
        }
        let output = self.check_progress(prepare.seqno);
        (self, output)
    }

    /// Handles a Commit vote.
    pub(crate) fn on_commit(mut self, commit: Commit) -> (Self, ReplicaOutput) {
        let from = commit.replica;
        if let Err(rejection) = self.check_vote(from, commit.view, commit.seqno) {
            self.reject(&rejection);
            return (self, ReplicaOutput::empty());
        }

        let added = self
            .log
            .get_mut(commit.seqno)
            .is_ok_and(|cert| cert.add_commit(from, commit.digest));
        if !added {
            return (self, ReplicaOutput::empty());
        }
        let output = self.check_progress(commit.seqno);
        (self, output)
    }

    /// A vote must be for the current view and inside the log window.
    fn check_vote(
        &self,
        from: ReplicaId,
        view: ViewNumber,
        seqno: SeqNo,
    ) -> Result<(), Rejection> {
        if view < self.view {
            return Err(Rejection::OldView {
                view,
                current: self.view,
            });
        }
        if from == self.replica_id {
            return Err(Rejection::ProtocolViolation {
                sender: from.into(),
                reason: "vote claims to come from this replica",
            });
        }
        if !self.log.in_window(seqno) {
            return Err(Rejection::ProtocolViolation {
                sender: from.into(),
                reason: "vote outside log window",
            });
        }
        Ok(())
    }

    /// Acts on the prepared and committed edges of a slot.
    pub(crate) fn check_progress(&mut self, seqno: SeqNo) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        let cluster = self.config.cluster;
        let me = self.replica_id;

        let Ok(cert) = self.log.get_mut(seqno) else {
            return output;
        };
        let mut newly_prepared = None;
        if !cert.commit_sent() && cert.is_prepared(&cluster) {
            if let (Some(digest), Some(pre_prepare)) = (cert.digest(), cert.pre_prepare().cloned())
            {
                cert.mark_commit_sent();
                cert.add_commit(me, digest);
                newly_prepared = Some((digest, pre_prepare));
            }
        }
        let committed = cert.is_committed(&cluster);

        if let Some((digest, pre_prepare)) = newly_prepared {
            tracing::debug!(
                replica = %self.replica_id,
                view = %self.view,
                seqno = %seqno,
                "prepared, sending Commit"
            );
            self.prepared_history.insert(
                seqno,
                PreparedEntry {
                    seqno,
                    view: pre_prepare.view,
                    digest,
                    pre_prepare,
                },
            );
            let commit = self.commit_for(seqno, digest);
            self.broadcast(&mut output, MessagePayload::Commit(commit));
        }

        if committed {
            output.merge(self.execute_committed());
        }
        output
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Executes every committed batch from `last_executed + 1` onward, in
    /// order, stopping at the first gap.
    pub(crate) fn execute_committed(&mut self) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        let cluster = self.config.cluster;
        let mut progressed = false;

        loop {
            let seqno = self.last_executed.next();
            let batch = match self.log.get(seqno) {
                Ok(cert) if cert.is_committed(&cluster) => cert.requests().and_then(|requests| {
                    let non_deterministic = cert.pre_prepare()?.non_deterministic.clone();
                    let requests: Vec<AuthenticatedRequest> =
                        requests.into_iter().cloned().collect();
                    Some((requests, non_deterministic))
                }),
                _ => None,
            };
            let Some((requests, non_deterministic)) = batch else {
                break;
            };

            for request in &requests {
                self.execute_request(request, &non_deterministic, seqno, &mut output);
            }
            self.last_executed = seqno;
            progressed = true;

            METRICS.increment_batches_committed();
            METRICS.set_last_executed(seqno.as_u64());
            tracing::debug!(
                replica = %self.replica_id,
                seqno = %seqno,
                requests = requests.len(),
                "executed batch"
            );

            if seqno.is_checkpoint(self.config.protocol.checkpoint_interval) {
                output.merge(self.send_checkpoint(seqno));
            }
        }

        if progressed {
            METRICS.set_pending_requests(self.pending.len() as u64);
            if self.pending.is_empty() || self.is_primary() {
                output.timer(TimerCommand::Stop(TimeoutKind::ViewChange));
            } else {
                output.timer(TimerCommand::Restart(TimeoutKind::ViewChange));
            }
            output.merge(self.retry_read_only());
            output.merge(self.send_pre_prepares());
        }
        output
    }

    /// Executes one request unless its client already has a reply for it
    /// or a later request.
    fn execute_request(
        &mut self,
        request: &AuthenticatedRequest,
        non_deterministic: &Bytes,
        seqno: SeqNo,
        output: &mut ReplicaOutput,
    ) {
        let sender = request.sender();
        let request_id = request.request_id();
        self.pending.remove(sender, request_id);

        if self.already_answered(sender, request_id) {
            tracing::trace!(
                replica = %self.replica_id,
                client = %sender,
                request = %request_id,
                "skipping already executed request"
            );
            return;
        }

        let result = self
            .app
            .execute(sender, &request.request.command, non_deterministic);
        let reply = Reply {
            view: self.view,
            request_id,
            requester: sender,
            replica: self.replica_id,
            result_digest: pbft_crypto::sha256(&result),
            result: Some(result),
        };
        self.send_reply(output, &reply, request.request.replier.includes(self.replica_id));
        self.replies.insert(sender, reply);

        output.executed.push(Executed {
            client: sender,
            request_id,
            seqno,
        });
        METRICS.increment_requests_executed();
    }

    // ========================================================================
    // Idle Timer
    // ========================================================================

    /// Re-forwards pending requests and retries read-only requests.
    pub(crate) fn on_idle(&mut self) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        if self.has_new_view {
            if self.is_primary() {
                output.merge(self.send_pre_prepares());
            } else {
                output.merge(self.forward_pending());
            }
            output.merge(self.retry_read_only());
        }
        output.timer(TimerCommand::Start(TimeoutKind::Idle));
        output
    }

    /// Forwards every pending request the primary has not proposed yet.
    pub(crate) fn forward_pending(&self) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        let primary = self.primary();
        for request in self.pending.iter() {
            if self
                .log
                .lookup(request.sender(), request.request_id())
                .is_none()
            {
                output.send(Destination::Replica(primary), request.to_message());
            }
        }
        output
    }
}
