//! Client side of the protocol.
//!
//! A [`Client`] has at most one request outstanding. It sends the request to
//! the primary it believes is current (or to every replica for read-only
//! and large requests), and accepts a result once enough replicas agree on
//! its digest:
//!
//! - `f + 1` matching replies for ordered requests, since one of them comes
//!   from a correct replica
//! - `2f + 1` for read-only requests, which skip agreement
//!
//! On a retransmission every replica is asked for the full result, and a
//! read-only request that could not gather its quorum is resent as an
//! ordered request.

use std::collections::HashMap;

use bytes::Bytes;
use pbft_types::{Digest, ReplicaId, RequestId, ViewNumber};

use crate::config::ClusterConfig;
use crate::error::{ClientError, KeyError};
use crate::message::{Message, MessagePayload, Replier, Reply, Request, RequestFlags};
use crate::principal::Keyring;
use crate::replica::{Destination, Outbound};

#[derive(Debug)]
struct Outstanding {
    request: Request,
    replies: HashMap<ReplicaId, Reply>,
}

/// A client bound to one principal identity.
#[derive(Debug)]
pub struct Client {
    keys: Keyring,
    cluster: ClusterConfig,
    big_request_threshold: usize,
    view: ViewNumber,
    last_request_id: RequestId,
    outstanding: Option<Outstanding>,
}

impl Client {
    /// # Panics
    ///
    /// Panics if `keys` belongs to a replica.
    pub fn new(keys: Keyring, cluster: ClusterConfig, big_request_threshold: usize) -> Self {
        assert!(keys.me().is_client(), "client keyring must belong to a client");
        Self {
            keys,
            cluster,
            big_request_threshold,
            view: ViewNumber::ZERO,
            last_request_id: RequestId::ZERO,
            outstanding: None,
        }
    }

    /// Continues numbering requests after `request_id`, for a client that
    /// restarts with a known floor.
    pub fn resume_after(mut self, request_id: RequestId) -> Self {
        self.last_request_id = self.last_request_id.max(request_id);
        self
    }

    /// The view this client believes is current.
    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn outstanding(&self) -> Option<RequestId> {
        self.outstanding.as_ref().map(|o| o.request.request_id)
    }

    /// Distributes fresh session keys to every replica.
    pub fn refresh_keys(&mut self, now_millis: u64) -> Result<Vec<Outbound>, KeyError> {
        let bundle = self.keys.new_key_bundle(now_millis)?;
        let message = self.keys.sign_message(MessagePayload::NewKey(bundle));
        Ok(vec![Outbound {
            destination: Destination::AllReplicas,
            message,
        }])
    }

    /// Starts a new request.
    pub fn invoke(&mut self, command: Bytes, read_only: bool) -> Result<Vec<Outbound>, ClientError> {
        if let Some(id) = self.outstanding() {
            return Err(ClientError::RequestOutstanding(id));
        }

        self.last_request_id = self.last_request_id.next();
        let primary = self.cluster.primary(self.view);
        let request = Request::new(
            self.keys.me(),
            self.last_request_id,
            RequestFlags {
                read_only,
                use_signature: false,
            },
            Replier::Designated(primary),
            command,
        );

        let broadcast = read_only || request.encoded_len() > self.big_request_threshold;
        let destination = if broadcast {
            Destination::AllReplicas
        } else {
            Destination::Replica(primary)
        };
        tracing::debug!(
            client = %self.keys.me(),
            request = %request.request_id,
            read_only,
            ?destination,
            "sending request"
        );

        let message = self.keys.mac_message(MessagePayload::Request(request.clone()));
        self.outstanding = Some(Outstanding {
            request,
            replies: HashMap::new(),
        });
        Ok(vec![Outbound {
            destination,
            message,
        }])
    }

    /// Resends the outstanding request to every replica, asking all of them
    /// for the full result.
    pub fn retransmit(&mut self) -> Vec<Outbound> {
        let Some(outstanding) = self.outstanding.as_mut() else {
            return Vec::new();
        };
        outstanding.request.replier = Replier::All;
        if outstanding.request.flags.read_only {
            tracing::debug!(
                client = %self.keys.me(),
                request = %outstanding.request.request_id,
                "read-only request unanswered, resending as ordered"
            );
            outstanding.request.flags.read_only = false;
            outstanding.replies.clear();
        }

        let message = self
            .keys
            .mac_message(MessagePayload::Request(outstanding.request.clone()));
        vec![Outbound {
            destination: Destination::AllReplicas,
            message,
        }]
    }

    /// Accepts a reply. Returns the result once a reply quorum agrees on it.
    pub fn handle_reply(&mut self, message: &Message) -> Option<Bytes> {
        let MessagePayload::Reply(reply) = &message.payload else {
            return None;
        };
        if let Err(rejection) = self.keys.verify_message(message) {
            tracing::warn!(client = %self.keys.me(), error = %rejection, "dropping reply");
            return None;
        }

        let me = self.keys.me();
        let outstanding = self.outstanding.as_mut()?;
        if reply.requester != me || reply.request_id != outstanding.request.request_id {
            return None;
        }
        // A reply with a full result is never replaced by a digest-only one.
        let keep_existing = outstanding
            .replies
            .get(&reply.replica)
            .is_some_and(|existing| {
                existing.result_digest == reply.result_digest && existing.result.is_some()
            });
        if !keep_existing {
            outstanding.replies.insert(reply.replica, reply.clone());
        }

        let needed = if outstanding.request.flags.read_only {
            self.cluster.quorum()
        } else {
            self.cluster.weak_quorum()
        };
        let (digest, view) = quorum_result(&outstanding.replies, needed)?;
        let result = outstanding
            .replies
            .values()
            .find(|r| r.result_digest == digest && r.has_valid_result())
            .and_then(|r| r.result.clone())?;

        tracing::debug!(
            client = %me,
            request = %outstanding.request.request_id,
            view = %view,
            "request complete"
        );
        self.view = self.view.max(view);
        self.outstanding = None;
        Some(result)
    }
}

/// The result digest at least `needed` replicas reported, with the highest
/// view among those replies.
fn quorum_result(replies: &HashMap<ReplicaId, Reply>, needed: usize) -> Option<(Digest, ViewNumber)> {
    let mut tally: HashMap<Digest, (usize, ViewNumber)> = HashMap::new();
    for reply in replies.values() {
        let entry = tally.entry(reply.result_digest).or_insert((0, ViewNumber::ZERO));
        entry.0 += 1;
        entry.1 = entry.1.max(reply.view);
    }
    tally
        .into_iter()
        .find(|(_, (count, _))| *count >= needed)
        .map(|(digest, (_, view))| (digest, view))
}
