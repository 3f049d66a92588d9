//! Replica state structure.
//!
//! This module defines [`ReplicaState`], the complete state of a PBFT
//! replica, together with the event entry point and the helpers every
//! handler shares (authentication, rejection logging, buffering).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use pbft_types::{Digest, PrincipalId, ReplicaId, SeqNo, ViewNumber};

use crate::application::Application;
use crate::config::ReplicaConfig;
use crate::error::Rejection;
use crate::instrumentation::METRICS;
use crate::log::CertificateLog;
use crate::message::{
    AuthenticatedRequest, Message, MessagePayload, MessageTag, PreparedEntry, Reply,
    SignedViewChange,
};
use crate::principal::Keyring;
use crate::queue::RequestQueue;
use crate::timer::{TimeoutKind, TimerCommand};

use super::{Destination, ReplicaEvent, ReplicaOutput};

// ============================================================================
// Replica State
// ============================================================================

/// The state of a PBFT replica.
///
/// # State Categories
///
/// 1. **Identity**: `replica_id`, `config`, `keys`
/// 2. **View State**: `view`, `has_new_view`, `new_view_message`
/// 3. **Agreement**: `log`, `next_seqno`, `last_executed`
/// 4. **Checkpoints**: `last_stable`, `stable_digest`, `checkpoints`
/// 5. **Clients**: `pending`, `read_only_pending`, `replies`
/// 6. **View Change Tracking**: `view_changes`, `prepared_history`,
///    `buffered`, `view_change_timeout`
/// 7. **Application**: `app`
#[derive(Debug)]
pub struct ReplicaState<A> {
    // ========================================================================
    // Identity
    // ========================================================================
    pub(crate) replica_id: ReplicaId,
    pub(crate) config: ReplicaConfig,
    pub(crate) keys: Keyring,

    // ========================================================================
    // View State
    // ========================================================================
    pub(crate) view: ViewNumber,

    /// False from sending a ViewChange until the matching NewView installs.
    pub(crate) has_new_view: bool,

    /// The signed NewView that started the current view, kept so any replica
    /// can relay it to peers that missed it.
    pub(crate) new_view_message: Option<Message>,

    // ========================================================================
    // Agreement
    // ========================================================================
    pub(crate) log: CertificateLog,

    /// Highest seqno assigned to a proposal (primary only).
    pub(crate) next_seqno: SeqNo,

    pub(crate) last_executed: SeqNo,

    // ========================================================================
    // Checkpoints
    // ========================================================================
    pub(crate) last_stable: SeqNo,
    pub(crate) stable_digest: Digest,

    /// Checkpoint votes above `last_stable`, including this replica's own.
    pub(crate) checkpoints: BTreeMap<SeqNo, HashMap<ReplicaId, Digest>>,

    // ========================================================================
    // Clients
    // ========================================================================
    /// Requests waiting to execute, one per client.
    pub(crate) pending: RequestQueue,

    /// Read-only requests that could not be answered yet.
    pub(crate) read_only_pending: RequestQueue,

    /// Last reply sent to each client, with the full result.
    pub(crate) replies: HashMap<PrincipalId, Reply>,

    // ========================================================================
    // View Change Tracking
    // ========================================================================
    pub(crate) view_changes: BTreeMap<ViewNumber, HashMap<ReplicaId, SignedViewChange>>,

    /// Highest-view prepared proposal per seqno, reported in view changes.
    pub(crate) prepared_history: BTreeMap<SeqNo, PreparedEntry>,

    /// Agreement messages held until their view is installed.
    pub(crate) buffered: VecDeque<Message>,

    /// Current view-change timeout; doubles each time a view change fails.
    pub(crate) view_change_timeout: Duration,

    // ========================================================================
    // Application
    // ========================================================================
    pub(crate) app: A,
}

impl<A: Application> ReplicaState<A> {
    /// Creates a replica in view 0 with an empty log.
    ///
    /// The application's current state is the genesis checkpoint.
    ///
    /// # Panics
    ///
    /// Panics if `keys` does not belong to a replica in the cluster, or if
    /// the key tables do not have `n = 3f + 1` replicas.
    pub fn new(config: ReplicaConfig, keys: Keyring, app: A) -> Self {
        let Some(replica_id) = keys
            .me()
            .as_replica()
            .filter(|id| config.cluster.contains(*id))
        else {
            panic!("keyring must belong to a cluster replica, got {}", keys.me());
        };
        assert_eq!(
            keys.replica_count(),
            config.cluster.replica_count(),
            "key tables must have n = 3f + 1 replicas"
        );

        Self {
            replica_id,
            log: CertificateLog::new(config.protocol.log_capacity()),
            view_change_timeout: config.timers.view_change,
            stable_digest: app.state_digest(),
            config,
            keys,
            view: ViewNumber::ZERO,
            has_new_view: true,
            new_view_message: None,
            next_seqno: SeqNo::ZERO,
            last_executed: SeqNo::ZERO,
            last_stable: SeqNo::ZERO,
            checkpoints: BTreeMap::new(),
            pending: RequestQueue::new(),
            read_only_pending: RequestQueue::new(),
            replies: HashMap::new(),
            view_changes: BTreeMap::new(),
            prepared_history: BTreeMap::new(),
            buffered: VecDeque::new(),
            app,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn has_new_view(&self) -> bool {
        self.has_new_view
    }

    pub fn last_executed(&self) -> SeqNo {
        self.last_executed
    }

    pub fn last_stable(&self) -> SeqNo {
        self.last_stable
    }

    pub fn log(&self) -> &CertificateLog {
        &self.log
    }

    pub fn keys(&self) -> &Keyring {
        &self.keys
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn primary(&self) -> ReplicaId {
        self.config.cluster.primary(self.view)
    }

    pub fn is_primary(&self) -> bool {
        self.primary() == self.replica_id
    }

    // ========================================================================
    // Event Processing (Main Entry Point)
    // ========================================================================

    /// Processes an event and returns the new state and output.
    ///
    /// This method is pure: it takes ownership of `self`, processes the
    /// event, and returns the new state. The caller is responsible for
    /// sending the messages and applying the timer commands.
    pub fn process(self, event: ReplicaEvent) -> (Self, ReplicaOutput) {
        match event {
            ReplicaEvent::Start { now_millis } => self.on_start(now_millis),
            ReplicaEvent::Message { source, message } => self.on_message(source, message),
            ReplicaEvent::Timeout { kind, now_millis } => self.on_timeout(kind, now_millis),
        }
    }

    fn on_start(mut self, now_millis: u64) -> (Self, ReplicaOutput) {
        tracing::info!(
            replica = %self.replica_id,
            view = %self.view,
            n = self.config.cluster.replica_count(),
            f = self.config.cluster.max_faulty(),
            "replica starting"
        );
        METRICS.set_view_number(self.view.as_u64());

        let mut output = self.send_new_key(now_millis);
        output.timer(TimerCommand::Start(TimeoutKind::Status));
        output.timer(TimerCommand::Start(TimeoutKind::Idle));
        (self, output)
    }

    /// Handles an incoming message.
    fn on_message(self, source: Option<PrincipalId>, message: Message) -> (Self, ReplicaOutput) {
        METRICS.increment_messages_received();

        if message.tag() == MessageTag::Reply {
            tracing::trace!(replica = %self.replica_id, ?source, "ignoring reply sent to a replica");
            return (self, ReplicaOutput::empty());
        }

        // Every message is checked against the principal it claims to come
        // from before anything else looks at it.
        if let Err(rejection) = self.keys.verify_message(&message) {
            self.reject(&rejection);
            return (self, ReplicaOutput::empty());
        }

        self.dispatch(message)
    }

    /// Routes an authenticated message to its handler, buffering agreement
    /// messages for views that are not installed yet.
    pub(crate) fn dispatch(mut self, message: Message) -> (Self, ReplicaOutput) {
        if self.should_buffer(&message) {
            self.buffer(message);
            return (self, ReplicaOutput::empty());
        }

        let Message { payload, auth } = message;
        match payload {
            // Normal operation
            MessagePayload::Request(request) => {
                self.on_request(AuthenticatedRequest::new(request, auth))
            }
            MessagePayload::PrePrepare(pre_prepare) => self.on_pre_prepare(pre_prepare),
            MessagePayload::Prepare(prepare) => self.on_prepare(prepare),
            MessagePayload::Commit(commit) => self.on_commit(commit),

            // Checkpoints and retransmission
            MessagePayload::Checkpoint(checkpoint) => self.on_checkpoint(checkpoint),
            MessagePayload::Status(status) => self.on_status(status),

            // View change
            MessagePayload::ViewChange(view_change) => self.on_view_change(view_change, auth),
            MessagePayload::NewView(new_view) => self.on_new_view(new_view, auth),

            // Keys
            MessagePayload::NewKey(new_key) => self.on_new_key(new_key),

            MessagePayload::Reply(_) => (self, ReplicaOutput::empty()),
        }
    }

    /// Handles a timeout event.
    fn on_timeout(mut self, kind: TimeoutKind, now_millis: u64) -> (Self, ReplicaOutput) {
        match kind {
            TimeoutKind::KeyRefresh => {
                let output = self.send_new_key(now_millis);
                (self, output)
            }
            TimeoutKind::Status => {
                let output = self.send_status();
                (self, output)
            }
            TimeoutKind::ViewChange => {
                let target = self.view.next();
                tracing::info!(
                    replica = %self.replica_id,
                    view = %self.view,
                    target = %target,
                    "view-change timer expired"
                );
                self.start_view_change(target)
            }
            TimeoutKind::Idle => {
                let output = self.on_idle();
                (self, output)
            }
        }
    }

    // ========================================================================
    // Buffering
    // ========================================================================

    /// Agreement messages for a view this replica has not installed are held
    /// for replay after the NewView.
    fn should_buffer(&self, message: &Message) -> bool {
        let agreement = matches!(
            message.tag(),
            MessageTag::PrePrepare | MessageTag::Prepare | MessageTag::Commit
        );
        agreement
            && message
                .view()
                .is_some_and(|v| v > self.view || (v == self.view && !self.has_new_view))
    }

    fn buffer(&mut self, message: Message) {
        if self.buffered.len() >= self.config.protocol.max_buffered_messages {
            tracing::debug!(
                replica = %self.replica_id,
                view = %self.view,
                "buffer full, dropping message for uninstalled view"
            );
            return;
        }
        self.buffered.push_back(message);
    }

    /// Replays buffered messages. Messages still ahead of the installed
    /// view are buffered again.
    pub(crate) fn replay_buffered(mut self) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();
        let buffered = std::mem::take(&mut self.buffered);
        for message in buffered {
            if message.view().is_some_and(|v| v < self.view) {
                continue;
            }
            let (state, replayed) = self.dispatch(message);
            self = state;
            output.merge(replayed);
        }
        (self, output)
    }

    // ========================================================================
    // Outbound Helpers
    // ========================================================================

    /// Authenticates a payload the way this replica sends it.
    ///
    /// ViewChange, NewView and NewKey are always signed; other protocol
    /// messages are signed or MAC'd per `sign_protocol_messages`.
    pub(crate) fn authenticate(&self, payload: MessagePayload) -> Message {
        if payload.tag().requires_signature() || self.config.protocol.sign_protocol_messages {
            self.keys.sign_message(payload)
        } else {
            self.keys.mac_message(payload)
        }
    }

    pub(crate) fn broadcast(&self, output: &mut ReplicaOutput, payload: MessagePayload) {
        output.send(Destination::AllReplicas, self.authenticate(payload));
    }

    pub(crate) fn send_to(&self, output: &mut ReplicaOutput, to: ReplicaId, payload: MessagePayload) {
        output.send(Destination::Replica(to), self.authenticate(payload));
    }

    /// Sends `reply` to its requester in the current view, with the full
    /// result only if this replica is a designated replier.
    pub(crate) fn send_reply(&self, output: &mut ReplicaOutput, reply: &Reply, full: bool) {
        let reply = Reply {
            view: self.view,
            result: if full { reply.result.clone() } else { None },
            ..reply.clone()
        };
        let requester = reply.requester;
        let message = self
            .keys
            .mac_message_for(requester, MessagePayload::Reply(reply));
        output.send(Destination::principal(requester), message);
    }

    // ========================================================================
    // Rejections
    // ========================================================================

    /// Logs and counts a dropped message.
    pub(crate) fn reject(&self, rejection: &Rejection) {
        if rejection.is_authentication() {
            METRICS.increment_authentication_failures();
        } else {
            METRICS.increment_protocol_rejections();
        }
        tracing::warn!(
            replica = %self.replica_id,
            view = %self.view,
            error = %rejection,
            "dropping message"
        );
    }

    pub(crate) fn violation(&self, sender: impl Into<PrincipalId>, reason: &'static str) {
        self.reject(&Rejection::ProtocolViolation {
            sender: sender.into(),
            reason,
        });
    }
}
