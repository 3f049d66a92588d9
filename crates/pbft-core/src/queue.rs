//! Per-sender request queue.
//!
//! Holds at most one request per sender, in arrival order. A newer or
//! equal request from the same sender replaces the queued one in place, so
//! a retransmission refreshes its authenticator; an older one is ignored. Replicas keep one queue of requests waiting for agreement
//! and one of read-only requests waiting to be retried.

use std::collections::{HashMap, VecDeque};

use pbft_types::{PrincipalId, RequestId};

use crate::message::AuthenticatedRequest;

#[derive(Debug, Default)]
pub struct RequestQueue {
    order: VecDeque<PrincipalId>,
    requests: HashMap<PrincipalId, AuthenticatedRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `request`. Returns true if the sender had nothing queued or
    /// only an older request.
    pub fn append(&mut self, request: AuthenticatedRequest) -> bool {
        let sender = request.sender();
        match self.requests.get_mut(&sender) {
            Some(existing) if existing.request_id() > request.request_id() => false,
            Some(existing) => {
                let newer = existing.request_id() < request.request_id();
                *existing = request;
                newer
            }
            None => {
                self.order.push_back(sender);
                self.requests.insert(sender, request);
                true
            }
        }
    }

    /// Removes the sender's queued request if its id is at most
    /// `request_id`.
    pub fn remove(
        &mut self,
        sender: PrincipalId,
        request_id: RequestId,
    ) -> Option<AuthenticatedRequest> {
        if self
            .requests
            .get(&sender)
            .is_none_or(|queued| queued.request_id() > request_id)
        {
            return None;
        }
        self.order.retain(|s| *s != sender);
        self.requests.remove(&sender)
    }

    pub fn get(&self, sender: PrincipalId) -> Option<&AuthenticatedRequest> {
        self.requests.get(&sender)
    }

    pub fn contains(&self, sender: PrincipalId, request_id: RequestId) -> bool {
        self.get(sender)
            .is_some_and(|queued| queued.request_id() == request_id)
    }

    /// Oldest-first iteration.
    pub fn iter(&self) -> impl Iterator<Item = &AuthenticatedRequest> + '_ {
        self.order.iter().filter_map(|sender| self.requests.get(sender))
    }

    /// Removes and returns every queued request, oldest first.
    pub fn drain(&mut self) -> Vec<AuthenticatedRequest> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|sender| self.requests.remove(&sender))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Authenticator, Replier, Request, RequestFlags};
    use bytes::Bytes;
    use pbft_types::{ClientId, ReplicaId};

    fn request(client: u32, id: u64) -> AuthenticatedRequest {
        AuthenticatedRequest::new(
            Request::new(
                ClientId::new(client).into(),
                RequestId::new(id),
                RequestFlags::default(),
                Replier::All,
                Bytes::from_static(b"op"),
            ),
            Authenticator::None,
        )
    }

    #[test]
    fn one_request_per_sender_in_arrival_order() {
        let mut queue = RequestQueue::new();
        assert!(queue.append(request(1, 1)));
        assert!(queue.append(request(2, 1)));
        assert!(queue.append(request(1, 2)), "newer replaces older");
        assert!(!queue.append(request(1, 2)), "duplicate is not new");
        assert!(!queue.append(request(2, 0)), "older ignored");

        let ids: Vec<_> = queue
            .iter()
            .map(|r| (r.sender(), r.request_id().as_u64()))
            .collect();
        assert_eq!(
            ids,
            vec![
                (PrincipalId::from(ClientId::new(1)), 2),
                (PrincipalId::from(ClientId::new(2)), 1)
            ]
        );
    }

    #[test]
    fn retransmission_replaces_queued_copy_in_place() {
        let mut queue = RequestQueue::new();
        queue.append(request(1, 3));
        queue.append(request(2, 1));

        let mut retransmitted = request(1, 3);
        retransmitted.auth = Authenticator::Macs(vec![None; 4]);
        retransmitted.request.replier = Replier::Designated(ReplicaId::new(2));
        assert!(!queue.append(retransmitted.clone()));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get(ClientId::new(1).into()), Some(&retransmitted));
        let order: Vec<_> = queue.iter().map(AuthenticatedRequest::sender).collect();
        assert_eq!(
            order,
            vec![PrincipalId::from(ClientId::new(1)), ClientId::new(2).into()],
            "replacement keeps the original position"
        );
    }

    #[test]
    fn remove_only_up_to_executed_id() {
        let mut queue = RequestQueue::new();
        queue.append(request(1, 5));

        assert!(queue.remove(ClientId::new(1).into(), RequestId::new(4)).is_none());
        assert!(queue.contains(ClientId::new(1).into(), RequestId::new(5)));
        assert!(queue.remove(ClientId::new(1).into(), RequestId::new(5)).is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_empties_in_order() {
        let mut queue = RequestQueue::new();
        queue.append(request(3, 1));
        queue.append(request(1, 1));

        let drained: Vec<_> = queue.drain().iter().map(AuthenticatedRequest::sender).collect();
        assert_eq!(
            drained,
            vec![PrincipalId::from(ClientId::new(3)), ClientId::new(1).into()]
        );
        assert_eq!(queue.len(), 0);
    }
}
