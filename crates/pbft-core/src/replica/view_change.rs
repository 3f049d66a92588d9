//! View change protocol handlers.
//!
//! This module implements the PBFT view change:
//!
//! 1. **ViewChange**: a replica whose view-change timer expires moves to
//!    `v + 1`, stops accepting agreement messages and broadcasts a signed
//!    report of its stable checkpoint and the proposals it prepared.
//! 2. **Join**: a replica that sees `f + 1` replicas ahead of it joins the
//!    smallest of their views, since at least one of them is correct.
//! 3. **NewView**: the new primary waits for `2f + 1` ViewChanges, runs
//!    [`select`] and broadcasts the result with the ViewChanges attached.
//!    Backups re-run [`select`] over the same ViewChanges and accept the
//!    NewView only if they get the same answer.
//!
//! # Safety Properties
//!
//! - A proposal that committed at any correct replica is re-proposed with
//!   the same digest at the same seqno
//! - Null proposals fill only seqnos where no quorum can have committed
//! - The selection is a pure function of the ViewChanges, so every correct
//!   replica checks the primary's work

use pbft_types::{Digest, SeqNo, ViewNumber};

use crate::application::Application;
use crate::config::ClusterConfig;
use crate::error::Rejection;
use crate::instrumentation::METRICS;
use crate::log::PrePrepareOutcome;
use crate::message::{
    Authenticator, Message, MessagePayload, NewView, PrePrepare, PreparedEntry, SignedViewChange,
    ViewChange,
};
use crate::timer::{TimeoutKind, TimerCommand};

use super::{Destination, ReplicaOutput, ReplicaState};

// ============================================================================
// Selection
// ============================================================================

/// The starting point of a new view, computed from `2f + 1` ViewChanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Checkpoint the new view starts from.
    pub min_s: SeqNo,
    pub stable_digest: Digest,
    /// One proposal per seqno in `(min_s, max_s]`, re-issued in the new view.
    pub pre_prepares: Vec<PrePrepare>,
}

/// Computes the NewView contents for `view` from a set of ViewChanges from
/// distinct replicas.
///
/// - `min_s` is the `(f+1)`-th largest reported stable checkpoint, so at
///   least one correct replica has it stable.
/// - For each seqno `n` above `min_s`, a prepared proposal `(v, d)` is
///   chosen when `2f + 1` ViewChanges that speak for `n` report nothing
///   newer or conflicting, and `f + 1` report `d` prepared at `v` or later.
/// - Otherwise `n` gets a null proposal when `2f + 1` ViewChanges that speak
///   for `n` report nothing prepared there.
///
/// Returns `None` while fewer than `2f + 1` ViewChanges are present or some
/// seqno cannot be decided yet.
pub fn select(
    view_changes: &[&ViewChange],
    cluster: &ClusterConfig,
    max_out: u64,
    view: ViewNumber,
) -> Option<Selection> {
    if view_changes.len() < cluster.quorum() {
        return None;
    }
    let (min_s, stable_digest) = select_checkpoint(view_changes, cluster)?;

    let max_s = view_changes
        .iter()
        .flat_map(|vc| vc.prepared.iter())
        .map(|entry| entry.seqno)
        .filter(|seqno| *seqno > min_s)
        .max()
        .unwrap_or(min_s)
        .min(min_s + max_out);

    let primary = cluster.primary(view);
    let mut pre_prepares = Vec::new();
    let mut seqno = min_s.next();
    while seqno <= max_s {
        let pre_prepare = match select_at(view_changes, cluster, max_out, seqno)? {
            Some(chosen) => chosen.reproposed(view, primary),
            None => PrePrepare::null(view, seqno, primary),
        };
        pre_prepares.push(pre_prepare);
        seqno = seqno.next();
    }

    Some(Selection {
        min_s,
        stable_digest,
        pre_prepares,
    })
}

/// The `(f+1)`-th largest stable checkpoint. Ties break by replica id so
/// every replica picks the same digest.
fn select_checkpoint(
    view_changes: &[&ViewChange],
    cluster: &ClusterConfig,
) -> Option<(SeqNo, Digest)> {
    let mut sorted = view_changes.to_vec();
    sorted.sort_by(|a, b| {
        b.last_stable
            .cmp(&a.last_stable)
            .then(a.replica.cmp(&b.replica))
    });
    let chosen = sorted.get(cluster.max_faulty())?;
    Some((chosen.last_stable, chosen.stable_digest))
}

/// `Some(Some(pp))` to re-propose, `Some(None)` for a null proposal, `None`
/// if the seqno is not decidable from these ViewChanges.
fn select_at<'a>(
    view_changes: &[&'a ViewChange],
    cluster: &ClusterConfig,
    max_out: u64,
    seqno: SeqNo,
) -> Option<Option<&'a PrePrepare>> {
    let covering: Vec<&'a ViewChange> = view_changes
        .iter()
        .copied()
        .filter(|vc| vc.covers(seqno, max_out))
        .collect();

    let mut candidates: Vec<&'a PreparedEntry> = covering
        .iter()
        .filter_map(|&vc| vc.prepared_at(seqno))
        .collect();
    candidates.sort_by(|a, b| b.view.cmp(&a.view).then(a.digest.cmp(&b.digest)));

    for candidate in candidates {
        let consistent = covering
            .iter()
            .filter(|vc| match vc.prepared_at(seqno) {
                None => true,
                Some(entry) => {
                    entry.view < candidate.view
                        || (entry.view == candidate.view && entry.digest == candidate.digest)
                }
            })
            .count();
        let vouching = covering
            .iter()
            .filter(|vc| {
                vc.prepared_at(seqno).is_some_and(|entry| {
                    entry.digest == candidate.digest && entry.view >= candidate.view
                })
            })
            .count();
        if consistent >= cluster.quorum() && vouching >= cluster.weak_quorum() {
            return Some(Some(&candidate.pre_prepare));
        }
    }

    let empty = covering
        .iter()
        .filter(|vc| vc.prepared_at(seqno).is_none())
        .count();
    (empty >= cluster.quorum()).then_some(None)
}

impl<A: Application> ReplicaState<A> {
    // ========================================================================
    // View Change Initiation
    // ========================================================================

    /// Moves to `target` and broadcasts this replica's ViewChange.
    ///
    /// Called when the view-change timer expires, or when `f + 1` replicas
    /// are already in a later view.
    pub(crate) fn start_view_change(mut self, target: ViewNumber) -> (Self, ReplicaOutput) {
        if target <= self.view {
            return (self, ReplicaOutput::empty());
        }
        let mut output = ReplicaOutput::empty();

        self.view = target;
        self.has_new_view = false;
        self.new_view_message = None;
        METRICS.increment_view_changes();
        METRICS.set_view_number(target.as_u64());

        // Doubles for every consecutive view change; reset on NewView.
        self.view_change_timeout = self.view_change_timeout.saturating_mul(2);
        output.timer(TimerCommand::SetInterval(
            TimeoutKind::ViewChange,
            self.view_change_timeout,
        ));
        output.timer(TimerCommand::Restart(TimeoutKind::ViewChange));

        let max_out = self.config.protocol.checkpoint_max_out;
        let mut view_change = ViewChange {
            new_view: target,
            replica: self.replica_id,
            last_stable: self.last_stable,
            stable_digest: self.stable_digest,
            prepared: Vec::new(),
        };
        view_change.prepared = self
            .prepared_history
            .values()
            .filter(|entry| view_change.covers(entry.seqno, max_out))
            .cloned()
            .collect();

        tracing::info!(
            replica = %self.replica_id,
            view = %target,
            last_stable = %self.last_stable,
            prepared = view_change.prepared.len(),
            "starting view change"
        );

        let signature = self.keys.sign(view_change.content_digest().as_bytes());
        let message = Message::with_auth(
            MessagePayload::ViewChange(view_change.clone()),
            Authenticator::Signature(signature.clone()),
        );
        output.send(Destination::AllReplicas, message);

        self.view_changes = self.view_changes.split_off(&target);
        self.record_view_change(SignedViewChange {
            view_change,
            signature,
        });

        let (state, new_view_output) = self.try_new_view();
        output.merge(new_view_output);
        (state, output)
    }

    /// Stores a ViewChange, keeping only the latest one per replica.
    /// Returns false if the sender already reported this view or a later one.
    fn record_view_change(&mut self, signed: SignedViewChange) -> bool {
        let from = signed.view_change.replica;
        let view = signed.view_change.new_view;
        let superseded = self
            .view_changes
            .range(view..)
            .any(|(_, votes)| votes.contains_key(&from));
        if superseded {
            return false;
        }
        for votes in self.view_changes.values_mut() {
            votes.remove(&from);
        }
        self.view_changes.retain(|_, votes| !votes.is_empty());
        self.view_changes
            .entry(view)
            .or_default()
            .insert(from, signed);
        true
    }

    // ========================================================================
    // ViewChange Handler
    // ========================================================================

    /// Handles a ViewChange from a peer.
    pub(crate) fn on_view_change(
        mut self,
        view_change: ViewChange,
        auth: Authenticator,
    ) -> (Self, ReplicaOutput) {
        let from = view_change.replica;
        if from == self.replica_id {
            return (self, ReplicaOutput::empty());
        }
        if view_change.new_view < self.view {
            self.reject(&Rejection::OldView {
                view: view_change.new_view,
                current: self.view,
            });
            return (self, ReplicaOutput::empty());
        }
        if view_change.new_view == self.view && self.has_new_view {
            // The sender missed the NewView for this view.
            let mut output = ReplicaOutput::empty();
            if let Some(new_view) = &self.new_view_message {
                output.send(Destination::Replica(from), new_view.clone());
            }
            return (self, output);
        }
        if !view_change.is_well_formed(self.config.protocol.checkpoint_max_out) {
            self.violation(from, "malformed ViewChange");
            return (self, ReplicaOutput::empty());
        }
        let Authenticator::Signature(signature) = auth else {
            self.reject(&Rejection::AuthenticationFailure {
                sender: from.into(),
                reason: "ViewChange must be signed",
            });
            return (self, ReplicaOutput::empty());
        };

        let view = view_change.new_view;
        tracing::debug!(
            replica = %self.replica_id,
            from = %from,
            view = %view,
            "received ViewChange"
        );
        if !self.record_view_change(SignedViewChange {
            view_change,
            signature,
        }) {
            return (self, ReplicaOutput::empty());
        }

        if let Some(target) = self.join_target() {
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                target = %target,
                "f+1 replicas moved ahead, joining view change"
            );
            return self.start_view_change(target);
        }

        if view == self.view {
            return self.try_new_view();
        }
        (self, ReplicaOutput::empty())
    }

    /// The smallest later view once `f + 1` replicas have moved past this
    /// replica's view.
    fn join_target(&self) -> Option<ViewNumber> {
        let ahead = self.view_changes.range(self.view.next()..);
        let senders: usize = ahead.clone().map(|(_, votes)| votes.len()).sum();
        if senders < self.config.cluster.weak_quorum() {
            return None;
        }
        ahead.map(|(view, _)| *view).next()
    }

    // ========================================================================
    // NewView (New Primary)
    // ========================================================================

    /// Issues the NewView once this replica is the new primary and the
    /// ViewChanges it holds decide every seqno.
    fn try_new_view(mut self) -> (Self, ReplicaOutput) {
        if self.has_new_view || !self.is_primary() {
            return (self, ReplicaOutput::empty());
        }
        let Some(votes) = self.view_changes.get(&self.view) else {
            return (self, ReplicaOutput::empty());
        };
        if votes.len() < self.config.cluster.quorum() {
            return (self, ReplicaOutput::empty());
        }

        let mut signed: Vec<SignedViewChange> = votes.values().cloned().collect();
        signed.sort_by_key(|s| s.view_change.replica);
        let view_changes: Vec<&ViewChange> = signed.iter().map(|s| &s.view_change).collect();
        let Some(selection) = select(
            &view_changes,
            &self.config.cluster,
            self.config.protocol.checkpoint_max_out,
            self.view,
        ) else {
            tracing::debug!(
                replica = %self.replica_id,
                view = %self.view,
                view_changes = signed.len(),
                "waiting for more ViewChanges to decide the new view"
            );
            return (self, ReplicaOutput::empty());
        };

        let new_view = NewView {
            view: self.view,
            replica: self.replica_id,
            min_s: selection.min_s,
            stable_digest: selection.stable_digest,
            view_changes: signed,
            pre_prepares: selection.pre_prepares.clone(),
        };
        tracing::info!(
            replica = %self.replica_id,
            view = %self.view,
            min_s = %selection.min_s,
            pre_prepares = selection.pre_prepares.len(),
            "sending NewView"
        );

        let message = self.keys.sign_message(MessagePayload::NewView(new_view));
        let mut output = ReplicaOutput::empty();
        output.send(Destination::AllReplicas, message.clone());
        self.new_view_message = Some(message);

        let (state, installed) = self.install_new_view(selection);
        output.merge(installed);
        (state, output)
    }

    // ========================================================================
    // NewView Handler (Backup)
    // ========================================================================

    /// Validates a NewView by recomputing it from its ViewChanges.
    pub(crate) fn on_new_view(
        mut self,
        new_view: NewView,
        auth: Authenticator,
    ) -> (Self, ReplicaOutput) {
        let from = new_view.replica;
        if new_view.view < self.view || (new_view.view == self.view && self.has_new_view) {
            tracing::trace!(
                replica = %self.replica_id,
                from = %from,
                view = %new_view.view,
                "ignoring NewView for installed or old view"
            );
            return (self, ReplicaOutput::empty());
        }
        if from != self.config.cluster.primary(new_view.view) || from == self.replica_id {
            self.violation(from, "NewView not from the view's primary");
            return (self, ReplicaOutput::empty());
        }
        if let Err(reason) = self.check_new_view_evidence(&new_view) {
            self.violation(from, reason);
            return (self, ReplicaOutput::empty());
        }

        let view_changes: Vec<&ViewChange> = new_view
            .view_changes
            .iter()
            .map(|s| &s.view_change)
            .collect();
        let selection = select(
            &view_changes,
            &self.config.cluster,
            self.config.protocol.checkpoint_max_out,
            new_view.view,
        );
        let Some(selection) = selection.filter(|s| {
            s.min_s == new_view.min_s
                && s.stable_digest == new_view.stable_digest
                && s.pre_prepares == new_view.pre_prepares
        }) else {
            self.violation(from, "NewView does not match its ViewChanges");
            return (self, ReplicaOutput::empty());
        };

        if new_view.view > self.view {
            self.view = new_view.view;
            METRICS.set_view_number(self.view.as_u64());
        }
        tracing::info!(
            replica = %self.replica_id,
            from = %from,
            view = %self.view,
            min_s = %selection.min_s,
            "accepted NewView"
        );
        self.new_view_message = Some(Message::with_auth(MessagePayload::NewView(new_view), auth));
        self.install_new_view(selection)
    }

    /// Every embedded ViewChange is for this view, signed by a distinct
    /// replica, and well formed; there are at least `2f + 1` of them.
    fn check_new_view_evidence(&self, new_view: &NewView) -> Result<(), &'static str> {
        let max_out = self.config.protocol.checkpoint_max_out;
        let mut senders = std::collections::HashSet::new();
        for signed in &new_view.view_changes {
            let vc = &signed.view_change;
            if vc.new_view != new_view.view {
                return Err("embedded ViewChange for another view");
            }
            if !senders.insert(vc.replica) {
                return Err("duplicate ViewChange sender");
            }
            let signed_ok = self
                .keys
                .principals()
                .get(vc.replica.into())
                .is_some_and(|p| signed.verify(p.verifying_key()));
            if !signed_ok {
                return Err("bad ViewChange signature");
            }
            if !vc.is_well_formed(max_out) {
                return Err("malformed embedded ViewChange");
            }
        }
        if senders.len() < self.config.cluster.quorum() {
            return Err("too few ViewChanges");
        }
        Ok(())
    }

    // ========================================================================
    // NewView Installation
    // ========================================================================

    /// Starts the current view from `selection`.
    ///
    /// Uncommitted agreement state is discarded and the selected proposals
    /// installed in its place. Buffered messages are then replayed.
    fn install_new_view(mut self, selection: Selection) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();
        let cluster = self.config.cluster;
        let mine = self.is_primary();

        self.log.reset_from(self.last_executed.next());

        if selection.min_s > self.last_stable {
            let own = self
                .checkpoints
                .get(&selection.min_s)
                .and_then(|votes| votes.get(&self.replica_id))
                .copied();
            match own {
                Some(digest) if digest == selection.stable_digest => {
                    output.merge(self.mark_stable(selection.min_s, digest));
                }
                Some(digest) => tracing::error!(
                    replica = %self.replica_id,
                    seqno = %selection.min_s,
                    own = ?digest,
                    selected = ?selection.stable_digest,
                    "state diverges from the new view's checkpoint"
                ),
                None => tracing::warn!(
                    replica = %self.replica_id,
                    seqno = %selection.min_s,
                    last_executed = %self.last_executed,
                    "new view starts past this replica's state; state transfer unsupported"
                ),
            }
        }

        let mut installed = Vec::new();
        let mut highest = selection.min_s;
        for pre_prepare in selection.pre_prepares {
            let seqno = pre_prepare.seqno;
            highest = highest.max(seqno);
            if seqno <= self.last_executed || !self.log.in_window(seqno) {
                continue;
            }
            match self.log.add_pre_prepare(pre_prepare, mine, &cluster) {
                Ok(PrePrepareOutcome::Installed | PrePrepareOutcome::Replaced) => {
                    installed.push(seqno);
                }
                outcome => tracing::warn!(
                    replica = %self.replica_id,
                    seqno = %seqno,
                    ?outcome,
                    "could not install re-proposed PrePrepare"
                ),
            }
        }
        self.next_seqno = self.last_executed.max(highest);
        self.has_new_view = true;

        for seqno in installed {
            if mine {
                output.merge(self.check_progress(seqno));
            } else {
                self.fill_from_pending(seqno);
                output.merge(self.try_send_prepare(seqno));
            }
        }

        self.view_change_timeout = self.config.timers.view_change;
        output.timer(TimerCommand::SetInterval(
            TimeoutKind::ViewChange,
            self.view_change_timeout,
        ));
        output.timer(if self.pending.is_empty() || mine {
            TimerCommand::Stop(TimeoutKind::ViewChange)
        } else {
            TimerCommand::Restart(TimeoutKind::ViewChange)
        });
        self.view_changes = self.view_changes.split_off(&self.view.next());

        tracing::info!(
            replica = %self.replica_id,
            view = %self.view,
            primary = %self.primary(),
            next_seqno = %self.next_seqno,
            "new view installed"
        );

        let (mut state, replayed) = self.replay_buffered();
        output.merge(replayed);
        if state.is_primary() {
            output.merge(state.send_pre_prepares());
        } else {
            output.merge(state.forward_pending());
        }
        (state, output)
    }
}
