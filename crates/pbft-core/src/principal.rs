//! Principals and message authentication.
//!
//! Every participant (replica or client) is a [`Principal`]: a stable index,
//! a network address, an Ed25519 verifying key, an X25519 exchange key and a
//! pair of HMAC session keys.
//!
//! # Session Keys
//!
//! A key generated by node `A` for peer `B` is stored by `A` as
//! `in_key[B]` and, once `B` opens it from `A`'s `NewKey` bundle, by `B` as
//! `out_key[A]`:
//!
//! | Direction          | MAC'd with                   | Verified with          |
//! |--------------------|------------------------------|------------------------|
//! | replica → replica  | sender's `out_key[receiver]` | receiver's `in_key[sender]` |
//! | client → replica   | client's `in_key[replica]`   | replica's `out_key[client]` |
//! | replica → client   | replica's `out_key[client]`  | client's `in_key[replica]`  |
//!
//! Client/replica pairs therefore use one client-generated key in both
//! directions. Keys start unestablished (all zero) and every MAC checked
//! against an unestablished key fails.
//!
//! Generating a new bundle keeps the replaced `in_key` as a fallback until
//! the next refresh, so messages a peer MAC'd before it opened the bundle
//! still verify.

use std::net::SocketAddr;

use pbft_crypto::{
    ExchangePublicKey, ExchangeSecret, Mac, SessionKey, Signature, SigningKey, VerifyingKey,
};
use pbft_types::{ClientId, Digest, PrincipalId, ReplicaId};

use crate::error::{KeyError, Rejection};
use crate::message::{
    AuthenticatedRequest, Authenticator, Message, MessagePayload, MessageTag, NewKey,
    seal_context,
};

// ============================================================================
// Principal
// ============================================================================

/// One participant's public identity and the session keys shared with it.
#[derive(Debug)]
pub struct Principal {
    id: PrincipalId,
    address: SocketAddr,
    verifying_key: VerifyingKey,
    exchange_key: ExchangePublicKey,
    in_key: SessionKey,
    /// The `in_key` the latest bundle replaced.
    previous_in_key: SessionKey,
    out_key: SessionKey,
    out_key_request_id: u64,
}

impl Principal {
    pub fn new(
        id: PrincipalId,
        address: SocketAddr,
        verifying_key: VerifyingKey,
        exchange_key: ExchangePublicKey,
    ) -> Self {
        Self {
            id,
            address,
            verifying_key,
            exchange_key,
            in_key: SessionKey::UNESTABLISHED,
            previous_in_key: SessionKey::UNESTABLISHED,
            out_key: SessionKey::UNESTABLISHED,
            out_key_request_id: 0,
        }
    }

    pub fn id(&self) -> PrincipalId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn exchange_key(&self) -> &ExchangePublicKey {
        &self.exchange_key
    }

    pub fn in_key(&self) -> &SessionKey {
        &self.in_key
    }

    pub fn out_key(&self) -> &SessionKey {
        &self.out_key
    }

    pub fn out_key_request_id(&self) -> u64 {
        self.out_key_request_id
    }

    /// Checks a MAC under the current `in_key` or the one it replaced.
    fn verify_inbound(&self, data: &[u8], mac: &Mac) -> bool {
        self.in_key.verify(data, mac) || self.previous_in_key.verify(data, mac)
    }

    /// Verifies a signature from this principal.
    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> bool {
        self.verifying_key.verify(bytes, signature)
    }
}

/// The fixed replica and client tables.
#[derive(Debug)]
pub struct PrincipalSet {
    replicas: Vec<Principal>,
    clients: Vec<Principal>,
}

impl PrincipalSet {
    /// Builds the tables.
    ///
    /// # Panics
    ///
    /// Panics if the principals are not indexed densely from zero in their
    /// class, or if there are no replicas.
    pub fn new(replicas: Vec<Principal>, clients: Vec<Principal>) -> Self {
        assert!(!replicas.is_empty(), "principal set needs replicas");
        for (i, p) in replicas.iter().enumerate() {
            assert_eq!(
                p.id,
                PrincipalId::Replica(ReplicaId::new(i as u32)),
                "replica principals must be indexed densely"
            );
        }
        for (i, p) in clients.iter().enumerate() {
            assert_eq!(
                p.id,
                PrincipalId::Client(ClientId::new(i as u32)),
                "client principals must be indexed densely"
            );
        }
        Self { replicas, clients }
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn get(&self, id: PrincipalId) -> Option<&Principal> {
        match id {
            PrincipalId::Replica(r) => self.replicas.get(r.as_index()),
            PrincipalId::Client(c) => self.clients.get(c.as_index()),
        }
    }

    fn get_mut(&mut self, id: PrincipalId) -> Option<&mut Principal> {
        match id {
            PrincipalId::Replica(r) => self.replicas.get_mut(r.as_index()),
            PrincipalId::Client(c) => self.clients.get_mut(c.as_index()),
        }
    }

    pub fn replicas(&self) -> impl Iterator<Item = &Principal> {
        self.replicas.iter()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Principal> {
        self.replicas.iter().chain(self.clients.iter())
    }

    /// Finds the principal bound to a network address.
    pub fn by_address(&self, address: SocketAddr) -> Option<&Principal> {
        self.iter().find(|p| p.address == address)
    }
}

// ============================================================================
// Keyring
// ============================================================================

/// This node's private keys together with every peer's public identity.
pub struct Keyring {
    me: PrincipalId,
    signing_key: SigningKey,
    exchange_secret: ExchangeSecret,
    principals: PrincipalSet,
    last_new_key_request_id: u64,
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("me", &self.me)
            .field("principals", &self.principals)
            .field("last_new_key_request_id", &self.last_new_key_request_id)
            .finish_non_exhaustive()
    }
}

impl Keyring {
    /// # Panics
    ///
    /// Panics if `me` is not in `principals` or its public key does not match
    /// `signing_key`.
    pub fn new(
        me: PrincipalId,
        signing_key: SigningKey,
        exchange_secret: ExchangeSecret,
        principals: PrincipalSet,
    ) -> Self {
        let own = principals.get(me);
        assert!(
            own.is_some_and(|p| *p.verifying_key() == signing_key.verifying_key()),
            "local signing key must match principal {me}"
        );
        Self {
            me,
            signing_key,
            exchange_secret,
            principals,
            last_new_key_request_id: 0,
        }
    }

    pub fn me(&self) -> PrincipalId {
        self.me
    }

    pub fn principals(&self) -> &PrincipalSet {
        &self.principals
    }

    pub fn replica_count(&self) -> usize {
        self.principals.replica_count()
    }

    // ------------------------------------------------------------------------
    // Signatures
    // ------------------------------------------------------------------------

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing_key.sign(bytes)
    }

    /// Verifies a signature claimed to come from `sender`. Unknown senders
    /// never verify.
    pub fn verify(&self, sender: PrincipalId, bytes: &[u8], signature: &Signature) -> bool {
        self.principals
            .get(sender)
            .is_some_and(|p| p.verify(bytes, signature))
    }

    // ------------------------------------------------------------------------
    // MACs
    // ------------------------------------------------------------------------

    /// Key used to MAC messages sent to `to`.
    fn sending_key(&self, to: PrincipalId) -> Option<&SessionKey> {
        let peer = self.principals.get(to)?;
        if self.me.is_client() {
            Some(peer.in_key())
        } else {
            Some(peer.out_key())
        }
    }

    /// Checks a MAC received from `from` with the key for that direction.
    fn verify_received(&self, from: PrincipalId, digest: &Digest, mac: &Mac) -> bool {
        let Some(peer) = self.principals.get(from) else {
            return false;
        };
        if self.me.is_client() || from.is_replica() {
            peer.verify_inbound(digest.as_bytes(), mac)
        } else {
            peer.out_key().verify(digest.as_bytes(), mac)
        }
    }

    /// One MAC per replica over `digest`; this node's own slot is empty.
    pub fn generate_authenticators(&self, digest: &Digest) -> Vec<Option<Mac>> {
        self.principals
            .replicas()
            .map(|peer| {
                if peer.id() == self.me {
                    None
                } else {
                    self.sending_key(peer.id())
                        .map(|key| key.mac(digest.as_bytes()))
                }
            })
            .collect()
    }

    /// Checks this replica's slot of a MAC vector from `sender`.
    ///
    /// The vector must have exactly one slot per replica. Clients hold no
    /// slot and never accept vectors.
    pub fn verify_authenticator_vector(
        &self,
        sender: PrincipalId,
        digest: &Digest,
        vector: &[Option<Mac>],
    ) -> bool {
        let Some(me) = self.me.as_replica() else {
            return false;
        };
        if vector.len() != self.replica_count() || sender == self.me {
            return false;
        }
        match vector.get(me.as_index()) {
            Some(Some(mac)) => self.verify_received(sender, digest, mac),
            _ => false,
        }
    }

    /// A single MAC over `digest` for `to`.
    pub fn mac_for(&self, to: PrincipalId, digest: &Digest) -> Option<Mac> {
        self.sending_key(to).map(|key| key.mac(digest.as_bytes()))
    }

    /// Verifies a single MAC from `from`.
    pub fn verify_mac(&self, from: PrincipalId, digest: &Digest, mac: &Mac) -> bool {
        self.verify_received(from, digest, mac)
    }

    // ------------------------------------------------------------------------
    // Message authentication
    // ------------------------------------------------------------------------

    /// Signs a payload.
    pub fn sign_message(&self, payload: MessagePayload) -> Message {
        let signature = self.sign(payload.content_digest().as_bytes());
        Message::with_auth(payload, Authenticator::Signature(signature))
    }

    /// Attaches a MAC vector to a payload.
    pub fn mac_message(&self, payload: MessagePayload) -> Message {
        let macs = self.generate_authenticators(&payload.content_digest());
        Message::with_auth(payload, Authenticator::Macs(macs))
    }

    /// Attaches a single MAC for `to` to a payload.
    pub fn mac_message_for(&self, to: PrincipalId, payload: MessagePayload) -> Message {
        let auth = self
            .mac_for(to, &payload.content_digest())
            .map_or(Authenticator::None, Authenticator::Mac);
        Message::with_auth(payload, auth)
    }

    /// Checks a message's authenticator against its claimed sender.
    ///
    /// ViewChange, NewView and NewKey must be signed. Requests must use the
    /// scheme their flags name. Replies carry a single MAC. Other protocol
    /// messages may use either a signature or a MAC vector.
    pub fn verify_message(&self, message: &Message) -> Result<(), Rejection> {
        if let MessagePayload::Request(request) = &message.payload {
            return self.verify_request(&AuthenticatedRequest::new(
                request.clone(),
                message.auth.clone(),
            ));
        }

        let sender = message.sender();
        let fail = |reason| Rejection::AuthenticationFailure { sender, reason };
        if self.principals.get(sender).is_none() {
            return Err(fail("unknown sender"));
        }

        let digest = message.content_digest();
        let tag = message.tag();
        let ok = match (&message.auth, tag) {
            (Authenticator::Signature(sig), _) => self.verify(sender, digest.as_bytes(), sig),
            (_, t) if t.requires_signature() => return Err(fail("signature required")),
            (Authenticator::Mac(mac), MessageTag::Reply) => self.verify_mac(sender, &digest, mac),
            (Authenticator::Macs(macs), t) if t != MessageTag::Reply => {
                self.verify_authenticator_vector(sender, &digest, macs)
            }
            (Authenticator::None, _) => return Err(fail("missing authenticator")),
            _ => return Err(fail("wrong authenticator kind")),
        };

        if ok {
            Ok(())
        } else {
            Err(fail("bad signature or MAC"))
        }
    }

    /// Checks a request's authenticator against its claimed sender.
    pub fn verify_request(&self, request: &AuthenticatedRequest) -> Result<(), Rejection> {
        let sender = request.sender();
        let fail = |reason| Rejection::AuthenticationFailure { sender, reason };
        if self.principals.get(sender).is_none() {
            return Err(fail("unknown sender"));
        }

        let digest = request.content_digest();
        let ok = match (&request.auth, request.request.flags.use_signature) {
            (Authenticator::Signature(sig), true) => self.verify(sender, digest.as_bytes(), sig),
            (Authenticator::Macs(macs), false) => {
                self.verify_authenticator_vector(sender, &digest, macs)
            }
            (Authenticator::None, _) => return Err(fail("missing authenticator")),
            _ => return Err(fail("authenticator does not match request flags")),
        };

        if ok {
            Ok(())
        } else {
            Err(fail("bad signature or MAC"))
        }
    }

    // ------------------------------------------------------------------------
    // Session-key refresh
    // ------------------------------------------------------------------------

    /// Generates fresh inbound keys for every replica peer and seals one to
    /// each.
    ///
    /// The bundle's request id is `max(last + 1, now_millis)`, so it keeps
    /// increasing across restarts. The returned payload still has to be
    /// signed. Keys are installed locally only once every copy is sealed.
    pub fn new_key_bundle(&mut self, now_millis: u64) -> Result<NewKey, KeyError> {
        let request_id = (self.last_new_key_request_id + 1).max(now_millis);

        let mut fresh = Vec::with_capacity(self.replica_count());
        let mut sealed = Vec::with_capacity(self.replica_count());
        for peer in self.principals.replicas() {
            let Some(peer_id) = peer.id().as_replica() else {
                continue;
            };
            if peer.id() == self.me {
                sealed.push(None);
                continue;
            }
            let key = SessionKey::generate();
            let context = seal_context(self.me, peer_id, request_id);
            sealed.push(Some(peer.exchange_key().seal(&key, &context)?));
            fresh.push((peer.id(), key));
        }

        for (peer, key) in fresh {
            if let Some(principal) = self.principals.get_mut(peer) {
                principal.previous_in_key = std::mem::replace(&mut principal.in_key, key);
            }
        }
        self.last_new_key_request_id = request_id;

        Ok(NewKey {
            sender: self.me,
            request_id,
            keys: sealed,
        })
    }

    /// Installs the key a peer sealed to this replica.
    ///
    /// The caller must already have verified the bundle's signature. The key
    /// is installed only if the bundle's request id advances past the one
    /// last installed for that sender.
    pub fn install_new_key(&mut self, bundle: &NewKey) -> Result<(), KeyError> {
        let sender = bundle.sender;
        let me = self.me.as_replica().ok_or(KeyError::MissingSlot(sender))?;

        let installed = self
            .principals
            .get(sender)
            .filter(|_| sender != self.me)
            .ok_or(KeyError::UnknownPrincipal(sender))?
            .out_key_request_id;
        if bundle.request_id <= installed {
            return Err(KeyError::StaleRequestId {
                sender,
                request_id: bundle.request_id,
                installed,
            });
        }

        let sealed = bundle.slot(me).ok_or(KeyError::MissingSlot(sender))?;
        let context = seal_context(sender, me, bundle.request_id);
        let key = self.exchange_secret.open(sealed, &context)?;

        if let Some(principal) = self.principals.get_mut(sender) {
            principal.out_key = key;
            principal.out_key_request_id = bundle.request_id;
        }
        Ok(())
    }
}

// ============================================================================
// Test Support
// ============================================================================


#[cfg(test)]
mod tests {
    use super::testing::{keyrings, keyrings_without_sessions};
    use super::*;
    use crate::message::{Prepare, Replier, Request, RequestFlags};
    use bytes::Bytes;
    use pbft_types::{RequestId, SeqNo, ViewNumber};

    fn prepare_from(replica: u32) -> MessagePayload {
        MessagePayload::Prepare(Prepare {
            view: ViewNumber::ZERO,
            seqno: SeqNo::new(1),
            digest: pbft_crypto::sha256(b"batch"),
            replica: ReplicaId::new(replica),
        })
    }

    fn client_request(use_signature: bool) -> MessagePayload {
        MessagePayload::Request(Request::new(
            ClientId::new(0).into(),
            RequestId::new(1),
            RequestFlags {
                read_only: false,
                use_signature,
            },
            Replier::All,
            Bytes::from_static(b"op"),
        ))
    }

    #[test]
    fn authenticator_vector_has_empty_own_slot() {
        let rings = keyrings(4, 0);
        let macs = rings[1].generate_authenticators(&pbft_crypto::sha256(b"x"));

        assert_eq!(macs.len(), 4);
        assert!(macs[1].is_none());
        assert!(macs.iter().enumerate().all(|(i, m)| i == 1 || m.is_some()));
    }

    #[test]
    fn replica_mac_vector_verifies_at_every_peer() {
        let rings = keyrings(4, 0);
        let message = rings[1].mac_message(prepare_from(1));

        for (i, ring) in rings.iter().enumerate() {
            let result = ring.verify_message(&message);
            if i == 1 {
                assert!(result.is_err(), "a replica does not accept its own vector");
            } else {
                assert_eq!(result, Ok(()));
            }
        }
    }

    #[test]
    fn vector_of_wrong_length_rejected() {
        let rings = keyrings(4, 0);
        let mut message = rings[1].mac_message(prepare_from(1));
        if let Authenticator::Macs(macs) = &mut message.auth {
            macs.pop();
        }
        assert!(rings[0].verify_message(&message).is_err());
    }

    #[test]
    fn forged_sender_rejected() {
        let rings = keyrings(4, 0);
        // Replica 2 MACs a Prepare that claims to come from replica 1
        let forged = rings[2].mac_message(prepare_from(1));
        let err = rings[0].verify_message(&forged).expect_err("forged");
        assert!(err.is_authentication());
    }

    #[test]
    fn unestablished_keys_reject_everything() {
        let rings = keyrings_without_sessions(4, 0);
        let message = rings[1].mac_message(prepare_from(1));
        assert!(rings[0].verify_message(&message).is_err());
    }

    #[test]
    fn client_request_macs_and_reply_mac() {
        let rings = keyrings(4, 1);
        let client = &rings[4];

        let request = client.mac_message(client_request(false));
        for replica in &rings[..4] {
            assert_eq!(replica.verify_message(&request), Ok(()));
        }

        let reply = rings[2].mac_message_for(
            client.me(),
            MessagePayload::Reply(crate::message::Reply {
                view: ViewNumber::ZERO,
                request_id: RequestId::new(1),
                requester: client.me(),
                replica: ReplicaId::new(2),
                result_digest: Digest::ZERO,
                result: None,
            }),
        );
        assert_eq!(client.verify_message(&reply), Ok(()));
    }

    #[test]
    fn request_auth_must_match_flags() {
        let rings = keyrings(4, 1);
        let client = &rings[4];

        let signed = client.sign_message(client_request(true));
        assert_eq!(rings[0].verify_message(&signed), Ok(()));

        // Signed, but the flags ask for MACs
        let mismatched = client.sign_message(client_request(false));
        assert!(rings[0].verify_message(&mismatched).is_err());
    }

    #[test]
    fn evidence_messages_must_be_signed() {
        let rings = keyrings(4, 0);
        let payload = MessagePayload::NewKey(NewKey {
            sender: rings[1].me(),
            request_id: 5,
            keys: vec![None; 4],
        });

        assert!(rings[0].verify_message(&rings[1].mac_message(payload.clone())).is_err());
        assert_eq!(rings[0].verify_message(&rings[1].sign_message(payload)), Ok(()));
    }

    #[test]
    fn vote_under_replaced_key_verifies_until_next_refresh() {
        let mut rings = keyrings(4, 0);
        // Replica 1 MACs with the key replica 0 is about to replace.
        let in_flight = rings[1].mac_message(prepare_from(1));

        let bundle = rings[0].new_key_bundle(2_000).expect("seal");
        assert_eq!(rings[0].verify_message(&in_flight), Ok(()));

        rings[1].install_new_key(&bundle).expect("install");
        let fresh = rings[1].mac_message(prepare_from(1));
        assert_eq!(rings[0].verify_message(&fresh), Ok(()));

        // A second refresh retires the oldest key.
        rings[0].new_key_bundle(3_000).expect("seal");
        assert!(rings[0].verify_message(&in_flight).is_err());
    }

    #[test]
    fn reply_under_replaced_client_key_still_verifies() {
        let mut rings = keyrings(4, 1);
        let reply = rings[2].mac_message_for(
            rings[4].me(),
            MessagePayload::Reply(crate::message::Reply {
                view: ViewNumber::ZERO,
                request_id: RequestId::new(1),
                requester: rings[4].me(),
                replica: ReplicaId::new(2),
                result_digest: Digest::ZERO,
                result: None,
            }),
        );

        rings[4].new_key_bundle(2_000).expect("seal");
        assert_eq!(rings[4].verify_message(&reply), Ok(()));
    }

    #[test]
    fn new_key_replay_rejected() {
        let mut rings = keyrings_without_sessions(4, 0);
        let first = rings[1].new_key_bundle(1_000).expect("seal");
        let second = rings[1].new_key_bundle(1_000).expect("seal");
        assert!(second.request_id > first.request_id);

        rings[0].install_new_key(&second).expect("install newer");
        assert_eq!(
            rings[0].install_new_key(&first),
            Err(KeyError::StaleRequestId {
                sender: rings[1].me(),
                request_id: first.request_id,
                installed: second.request_id,
            })
        );
        assert_eq!(
            rings[0].install_new_key(&second),
            Err(KeyError::StaleRequestId {
                sender: rings[1].me(),
                request_id: second.request_id,
                installed: second.request_id,
            })
        );
    }

    #[test]
    fn new_key_request_id_tracks_wall_clock() {
        let mut rings = keyrings_without_sessions(4, 0);
        assert_eq!(rings[0].new_key_bundle(5_000).expect("seal").request_id, 5_000);
        // Clock went backwards: still advances
        assert_eq!(rings[0].new_key_bundle(10).expect("seal").request_id, 5_001);
    }

    #[test]
    fn tampered_bundle_fails_to_open() {
        let mut rings = keyrings_without_sessions(4, 0);
        let mut bundle = rings[1].new_key_bundle(1).expect("seal");
        // Move replica 2's sealed key into replica 0's slot
        bundle.keys[0] = bundle.keys[2].clone();

        assert!(matches!(
            rings[0].install_new_key(&bundle),
            Err(KeyError::Crypto(_))
        ));
        // Nothing was installed, so the same request id is still acceptable
        let fresh = rings[1].new_key_bundle(1).expect("seal");
        assert_eq!(rings[0].install_new_key(&fresh), Ok(()));
    }

    #[test]
    fn by_address_lookup() {
        let rings = keyrings(4, 1);
        let set = rings[0].principals();
        let client = set.get(ClientId::new(0).into()).expect("client");
        assert_eq!(
            set.by_address(client.address()).map(Principal::id),
            Some(client.id())
        );
    }
}
