//! Certificate log.
//!
//! A fixed window of [`PrepareCertificate`]s indexed by sequence number. The
//! window starts at `head` (one past the last stable checkpoint) and holds
//! `checkpoint_max_out` slots, so the primary can never propose past the end
//! of it. Slots are reused as the head advances.
//!
//! The log also indexes every request named by an installed PrePrepare so a
//! request that arrives after its proposal (large requests travel by
//! reference) can be matched to the slot waiting for it.

use std::collections::HashMap;

use pbft_types::{Digest, PrincipalId, ReplicaId, RequestId, SeqNo};

use crate::config::ClusterConfig;
use crate::error::LogError;
use crate::message::{AuthenticatedRequest, BatchEntry, PrePrepare, RequestRef};

// ============================================================================
// Prepare Certificate
// ============================================================================

/// What happened when a PrePrepare was offered to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrePrepareOutcome {
    /// The slot was empty; the proposal is now installed.
    Installed,
    /// The same proposal was already installed.
    Duplicate,
    /// A conflicting proposal was displaced because `f + 1` replicas
    /// prepared the new one and this replica had not voted for the old one.
    Replaced,
    /// A conflicting proposal is already installed.
    Rejected,
}

/// Agreement state for one sequence number.
#[derive(Debug, Clone, Default)]
pub struct PrepareCertificate {
    pre_prepare: Option<PrePrepare>,
    digest: Digest,
    /// This replica proposed the PrePrepare.
    mine: bool,
    prepare_sent: bool,
    commit_sent: bool,
    /// Prepares from other replicas, first vote wins.
    prepares: HashMap<ReplicaId, Digest>,
    /// Commits including this replica's own.
    commits: HashMap<ReplicaId, Digest>,
    /// Request bodies for each batch entry; `None` until a referenced
    /// request arrives.
    requests: Vec<Option<AuthenticatedRequest>>,
}

impl PrepareCertificate {
    pub fn pre_prepare(&self) -> Option<&PrePrepare> {
        self.pre_prepare.as_ref()
    }

    /// Digest of the installed proposal, if any.
    pub fn digest(&self) -> Option<Digest> {
        self.pre_prepare.as_ref().map(|_| self.digest)
    }

    pub fn is_mine(&self) -> bool {
        self.mine
    }

    pub fn prepare_sent(&self) -> bool {
        self.prepare_sent
    }

    pub fn mark_prepare_sent(&mut self) {
        self.prepare_sent = true;
    }

    pub fn commit_sent(&self) -> bool {
        self.commit_sent
    }

    pub fn mark_commit_sent(&mut self) {
        self.commit_sent = true;
    }

    /// True if nothing at all has been recorded.
    pub fn is_empty(&self) -> bool {
        self.pre_prepare.is_none() && self.prepares.is_empty() && self.commits.is_empty()
    }

    /// Offers a PrePrepare to this slot.
    fn add_pre_prepare(
        &mut self,
        pre_prepare: PrePrepare,
        mine: bool,
        cluster: &ClusterConfig,
    ) -> PrePrepareOutcome {
        let digest = pre_prepare.consensus_digest();
        let outcome = match &self.pre_prepare {
            None => PrePrepareOutcome::Installed,
            Some(_) if self.digest == digest => return PrePrepareOutcome::Duplicate,
            Some(_) => {
                let backing = self.matching_prepares(&digest);
                if !self.mine && !self.prepare_sent && backing >= cluster.weak_quorum() {
                    PrePrepareOutcome::Replaced
                } else {
                    return PrePrepareOutcome::Rejected;
                }
            }
        };

        self.requests = pre_prepare
            .entries
            .iter()
            .map(|entry| entry.full().cloned())
            .collect();
        self.digest = digest;
        self.mine = mine;
        self.pre_prepare = Some(pre_prepare);
        outcome
    }

    /// Records a Prepare; returns true if it is new.
    pub fn add_prepare(&mut self, replica: ReplicaId, digest: Digest) -> bool {
        if self.prepares.contains_key(&replica) {
            return false;
        }
        self.prepares.insert(replica, digest);
        true
    }

    /// Records a Commit; returns true if it is new.
    pub fn add_commit(&mut self, replica: ReplicaId, digest: Digest) -> bool {
        if self.commits.contains_key(&replica) {
            return false;
        }
        self.commits.insert(replica, digest);
        true
    }

    fn matching_prepares(&self, digest: &Digest) -> usize {
        self.prepares.values().filter(|d| *d == digest).count()
    }

    fn matching_commits(&self) -> usize {
        self.commits.values().filter(|d| **d == self.digest).count()
    }

    /// Every batch entry has its request body.
    pub fn is_complete(&self) -> bool {
        self.pre_prepare.is_some() && self.requests.iter().all(Option::is_some)
    }

    /// Entries still waiting for their request body.
    pub fn missing_requests(&self) -> impl Iterator<Item = (usize, &RequestRef)> + '_ {
        self.pre_prepare
            .iter()
            .flat_map(|pp| pp.entries.iter().enumerate())
            .filter_map(move |(position, entry)| match entry {
                BatchEntry::Reference(reference) if self.requests[position].is_none() => {
                    Some((position, reference))
                }
                _ => None,
            })
    }

    /// Supplies the body for a batch entry. Returns true if it filled a gap.
    ///
    /// A body already present only has its non-agreement fields (replier
    /// hint and authenticator) refreshed from the newer copy.
    pub fn fill_request(&mut self, position: usize, request: AuthenticatedRequest) -> bool {
        let expected = self
            .pre_prepare
            .as_ref()
            .and_then(|pp| pp.entries.get(position))
            .map(BatchEntry::consensus_digest);
        if expected != Some(request.consensus_digest()) {
            return false;
        }
        match self.requests.get_mut(position) {
            Some(slot @ None) => {
                *slot = Some(request);
                true
            }
            Some(Some(existing)) => {
                existing.request.replier = request.request.replier;
                existing.auth = request.auth;
                false
            }
            None => false,
        }
    }

    /// Request bodies in batch order, once complete.
    pub fn requests(&self) -> Option<Vec<&AuthenticatedRequest>> {
        self.requests.iter().map(Option::as_ref).collect()
    }

    /// The installed PrePrepare with inline bodies swapped for the newest
    /// copies held. Only authenticators and replier hints can differ, so the
    /// consensus digest is unchanged.
    pub fn refreshed_pre_prepare(&self) -> Option<PrePrepare> {
        let mut pre_prepare = self.pre_prepare.clone()?;
        for (entry, held) in pre_prepare.entries.iter_mut().zip(&self.requests) {
            if let (BatchEntry::Full(inline), Some(held)) = (entry, held) {
                *inline = held.clone();
            }
        }
        Some(pre_prepare)
    }

    /// This replica holds the proposal and has voted for it (or made it).
    pub fn is_pre_prepared(&self) -> bool {
        self.pre_prepare.is_some() && (self.mine || self.prepare_sent)
    }

    /// Pre-prepared plus `2f` matching votes in total besides the primary's.
    ///
    /// The proposer needs `2f` Prepares from backups. A backup counts its own
    /// vote implicitly and needs `2f - 1` from others.
    pub fn is_prepared(&self, cluster: &ClusterConfig) -> bool {
        if !self.is_pre_prepared() {
            return false;
        }
        let needed = if self.mine {
            cluster.prepares_needed_as_primary()
        } else {
            cluster.prepares_needed_as_backup()
        };
        self.matching_prepares(&self.digest) >= needed
    }

    /// Prepared plus `2f + 1` matching Commits, this replica's included.
    pub fn is_committed(&self, cluster: &ClusterConfig) -> bool {
        self.is_prepared(cluster) && self.matching_commits() >= cluster.quorum()
    }
}

// ============================================================================
// Certificate Log
// ============================================================================

/// Where a request sits in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLocation {
    pub seqno: SeqNo,
    pub position: usize,
    pub digest: Digest,
}

/// Sliding window of certificates `[head, head + capacity)`.
#[derive(Debug)]
pub struct CertificateLog {
    slots: Vec<PrepareCertificate>,
    head: SeqNo,
    index: HashMap<(PrincipalId, RequestId), RequestLocation>,
}

impl CertificateLog {
    /// Creates an empty log starting at sequence number 1.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "log capacity must be positive");
        Self {
            slots: vec![PrepareCertificate::default(); capacity],
            head: SeqNo::new(1),
            index: HashMap::new(),
        }
    }

    pub fn head(&self) -> SeqNo {
        self.head
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_window(&self, seqno: SeqNo) -> bool {
        seqno >= self.head && seqno.distance_from(self.head) < self.capacity() as u64
    }

    fn slot_index(&self, seqno: SeqNo) -> Result<usize, LogError> {
        if self.in_window(seqno) {
            Ok((seqno.as_u64() % self.capacity() as u64) as usize)
        } else {
            Err(LogError::OutOfWindow {
                seqno,
                head: self.head,
                capacity: self.capacity() as u64,
            })
        }
    }

    pub fn get(&self, seqno: SeqNo) -> Result<&PrepareCertificate, LogError> {
        let i = self.slot_index(seqno)?;
        Ok(&self.slots[i])
    }

    pub fn get_mut(&mut self, seqno: SeqNo) -> Result<&mut PrepareCertificate, LogError> {
        let i = self.slot_index(seqno)?;
        Ok(&mut self.slots[i])
    }

    /// Offers a PrePrepare to its slot and keeps the request index in step.
    pub fn add_pre_prepare(
        &mut self,
        pre_prepare: PrePrepare,
        mine: bool,
        cluster: &ClusterConfig,
    ) -> Result<PrePrepareOutcome, LogError> {
        let seqno = pre_prepare.seqno;
        let i = self.slot_index(seqno)?;

        let displaced = self.slots[i].pre_prepare.clone();
        let outcome = self.slots[i].add_pre_prepare(pre_prepare, mine, cluster);
        if matches!(
            outcome,
            PrePrepareOutcome::Installed | PrePrepareOutcome::Replaced
        ) {
            if let Some(old) = displaced {
                self.unindex(&old);
            }
            if let Some(pp) = self.slots[i].pre_prepare.clone() {
                self.reindex(&pp);
            }
        }
        Ok(outcome)
    }

    fn reindex(&mut self, pre_prepare: &PrePrepare) {
        for (position, entry) in pre_prepare.entries.iter().enumerate() {
            self.index.insert(
                (entry.sender(), entry.request_id()),
                RequestLocation {
                    seqno: pre_prepare.seqno,
                    position,
                    digest: entry.consensus_digest(),
                },
            );
        }
    }

    fn unindex(&mut self, pre_prepare: &PrePrepare) {
        for entry in &pre_prepare.entries {
            let key = (entry.sender(), entry.request_id());
            if self
                .index
                .get(&key)
                .is_some_and(|loc| loc.seqno == pre_prepare.seqno)
            {
                self.index.remove(&key);
            }
        }
    }

    fn clear_slot(&mut self, seqno: SeqNo) {
        let i = (seqno.as_u64() % self.capacity() as u64) as usize;
        let cleared = std::mem::take(&mut self.slots[i]);
        if let Some(pp) = cleared.pre_prepare {
            self.unindex(&pp);
        }
    }

    /// Moves the window start to `new_head`, clearing vacated slots.
    ///
    /// A no-op if `new_head` does not advance the head.
    pub fn advance_head(&mut self, new_head: SeqNo) {
        if new_head <= self.head {
            return;
        }
        let end = new_head.min(self.head + self.capacity() as u64);
        let mut seqno = self.head;
        while seqno < end {
            self.clear_slot(seqno);
            seqno = seqno.next();
        }
        self.head = new_head;
    }

    /// Clears every slot at or after `from`. Used when a new view replaces
    /// whatever was in flight.
    pub fn reset_from(&mut self, from: SeqNo) {
        let end = self.head + self.capacity() as u64;
        let mut seqno = from.max(self.head);
        while seqno < end {
            self.clear_slot(seqno);
            seqno = seqno.next();
        }
    }

    /// Where a request was proposed, if it is in the window.
    pub fn lookup(&self, sender: PrincipalId, request_id: RequestId) -> Option<RequestLocation> {
        self.index.get(&(sender, request_id)).copied()
    }

    /// Merges a retransmitted request into the proposal that already holds
    /// it. Returns true if the request already has a sequence number, in
    /// which case the primary must not batch it again.
    pub fn change_by_primary(&mut self, request: &AuthenticatedRequest) -> bool {
        self.merge(request).is_some()
    }

    /// Hands a request that arrived on its own to the slot that names it.
    ///
    /// Fills a missing `Reference` body or refreshes the replier hint and
    /// authenticator of a present one. Returns the slot's seqno if this
    /// made the batch complete.
    pub fn change_by_backup(&mut self, request: &AuthenticatedRequest) -> Option<SeqNo> {
        match self.merge(request) {
            Some((seqno, true)) if self.get(seqno).is_ok_and(PrepareCertificate::is_complete) => {
                Some(seqno)
            }
            _ => None,
        }
    }

    fn merge(&mut self, request: &AuthenticatedRequest) -> Option<(SeqNo, bool)> {
        let location = self.lookup(request.sender(), request.request_id())?;
        if location.digest != request.consensus_digest() {
            return None;
        }
        let cert = self.get_mut(location.seqno).ok()?;
        let filled = cert.fill_request(location.position, request.clone());
        Some((location.seqno, filled))
    }
}
