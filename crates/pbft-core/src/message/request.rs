//! Client requests and replies.

use bytes::Bytes;
use pbft_types::{ClientId, Digest, PrincipalId, ReplicaId, RequestId, ViewNumber};
use serde::{Deserialize, Serialize};

use super::{Authenticator, Message, MessagePayload, MessageTag, encode_content, tagged_digest};

// ============================================================================
// Request
// ============================================================================

/// Per-request options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RequestFlags {
    /// May be answered without agreement.
    pub read_only: bool,
    /// Authenticated with a signature rather than a MAC vector.
    pub use_signature: bool,
}

/// Which replicas send the full result back.
///
/// Every replica replies; the others send only the result digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Replier {
    All,
    Designated(ReplicaId),
}

impl Replier {
    /// True if `replica` should include the full result.
    pub fn includes(self, replica: ReplicaId) -> bool {
        match self {
            Self::All => true,
            Self::Designated(id) => id == replica,
        }
    }
}

/// A client-submitted operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "RequestWire", try_from = "RequestWire")]
pub struct Request {
    pub sender: PrincipalId,
    pub request_id: RequestId,
    pub flags: RequestFlags,
    pub replier: Replier,
    pub command: Bytes,
}

impl Request {
    pub fn new(
        sender: PrincipalId,
        request_id: RequestId,
        flags: RequestFlags,
        replier: Replier,
        command: Bytes,
    ) -> Self {
        Self {
            sender,
            request_id,
            flags,
            replier,
            command,
        }
    }

    /// Digest over the fields replicas must agree on.
    ///
    /// Covers the sender, request id, read-only flag and command. Leaves out
    /// the replier hint, the authentication mode and the authenticator, which
    /// may differ between copies of the same logical request.
    pub fn consensus_digest(&self) -> Digest {
        let (class, index) = match self.sender {
            PrincipalId::Replica(id) => (0u8, u64::from(id.as_u32())),
            PrincipalId::Client(id) => (1u8, u64::from(id.as_u32())),
        };
        pbft_crypto::DigestBuilder::new()
            .update(b"pbft-request")
            .update(&[class])
            .update_u64(index)
            .update_u64(self.request_id.as_u64())
            .update(&[u8::from(self.flags.read_only)])
            .update_digest(&pbft_crypto::sha256(&self.command))
            .finalize()
    }

    /// Length of the canonical content encoding.
    pub fn encoded_len(&self) -> usize {
        encode_content(self).len()
    }
}

// The `extra` bitmap exists only on the wire.
const EXTRA_READ_ONLY: u8 = 0x01;
const EXTRA_SIGNATURE: u8 = 0x02;
const EXTRA_CLIENT_SENDER: u8 = 0x10;
const EXTRA_REPLY_ALL: u8 = 0x20;
const EXTRA_KNOWN: u8 = EXTRA_READ_ONLY | EXTRA_SIGNATURE | EXTRA_CLIENT_SENDER | EXTRA_REPLY_ALL;

#[derive(Serialize, Deserialize)]
struct RequestWire {
    sender: u32,
    request_id: u64,
    extra: u8,
    full_replier: u32,
    command: Bytes,
}

impl From<Request> for RequestWire {
    fn from(request: Request) -> Self {
        let mut extra = 0u8;
        if request.flags.read_only {
            extra |= EXTRA_READ_ONLY;
        }
        if request.flags.use_signature {
            extra |= EXTRA_SIGNATURE;
        }
        let sender = match request.sender {
            PrincipalId::Replica(id) => id.as_u32(),
            PrincipalId::Client(id) => {
                extra |= EXTRA_CLIENT_SENDER;
                id.as_u32()
            }
        };
        let full_replier = match request.replier {
            Replier::All => {
                extra |= EXTRA_REPLY_ALL;
                0
            }
            Replier::Designated(id) => id.as_u32(),
        };
        Self {
            sender,
            request_id: request.request_id.as_u64(),
            extra,
            full_replier,
            command: request.command,
        }
    }
}

/// Reserved bits were set in a request's `extra` field.
#[derive(Debug)]
pub struct InvalidExtraBits(u8);

impl std::fmt::Display for InvalidExtraBits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "reserved request flag bits set: {:#04x}", self.0)
    }
}

impl TryFrom<RequestWire> for Request {
    type Error = InvalidExtraBits;

    fn try_from(wire: RequestWire) -> Result<Self, Self::Error> {
        if wire.extra & !EXTRA_KNOWN != 0 {
            return Err(InvalidExtraBits(wire.extra));
        }
        let sender = if wire.extra & EXTRA_CLIENT_SENDER != 0 {
            PrincipalId::Client(ClientId::new(wire.sender))
        } else {
            PrincipalId::Replica(ReplicaId::new(wire.sender))
        };
        let replier = if wire.extra & EXTRA_REPLY_ALL != 0 {
            Replier::All
        } else {
            Replier::Designated(ReplicaId::new(wire.full_replier))
        };
        Ok(Self {
            sender,
            request_id: RequestId::new(wire.request_id),
            flags: RequestFlags {
                read_only: wire.extra & EXTRA_READ_ONLY != 0,
                use_signature: wire.extra & EXTRA_SIGNATURE != 0,
            },
            replier,
            command: wire.command,
        })
    }
}

/// A request together with the authenticator its sender attached.
///
/// This is the unit replicas store, embed in PrePrepares and forward to the
/// primary; the authenticator travels with the request so every replica can
/// check it against the original sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedRequest {
    pub request: Request,
    pub auth: Authenticator,
}

impl AuthenticatedRequest {
    pub fn new(request: Request, auth: Authenticator) -> Self {
        Self { request, auth }
    }

    /// The digest the sender's authenticator covers.
    pub fn content_digest(&self) -> Digest {
        tagged_digest(MessageTag::Request, &encode_content(&self.request))
    }

    pub fn consensus_digest(&self) -> Digest {
        self.request.consensus_digest()
    }

    pub fn sender(&self) -> PrincipalId {
        self.request.sender
    }

    pub fn request_id(&self) -> RequestId {
        self.request.request_id
    }

    /// Re-wraps as a standalone message (for forwarding).
    pub fn to_message(&self) -> Message {
        Message::with_auth(
            MessagePayload::Request(self.request.clone()),
            self.auth.clone(),
        )
    }
}

// ============================================================================
// Reply
// ============================================================================

/// A replica's answer to an executed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub view: ViewNumber,
    pub request_id: RequestId,
    /// The principal that sent the request.
    pub requester: PrincipalId,
    pub replica: ReplicaId,
    pub result_digest: Digest,
    /// Present only from the designated replier (or from all when asked).
    pub result: Option<Bytes>,
}

impl Reply {
    /// True if the full result is present and matches its digest.
    pub fn has_valid_result(&self) -> bool {
        self.result
            .as_ref()
            .is_some_and(|result| pbft_crypto::sha256(result) == self.result_digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_crypto::Mac;
    use proptest::prelude::*;

    fn request(replier: Replier, use_signature: bool) -> Request {
        Request::new(
            ClientId::new(3).into(),
            RequestId::new(17),
            RequestFlags {
                read_only: false,
                use_signature,
            },
            replier,
            Bytes::from_static(b"transfer 10"),
        )
    }

    #[test]
    fn wire_bitmap_roundtrip() {
        let original = Request::new(
            ReplicaId::new(2).into(),
            RequestId::new(5),
            RequestFlags {
                read_only: true,
                use_signature: true,
            },
            Replier::Designated(ReplicaId::new(1)),
            Bytes::from_static(b"x"),
        );
        let bytes = encode_content(&original);
        let decoded: Request = postcard::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn reserved_bits_rejected() {
        let wire = RequestWire {
            sender: 0,
            request_id: 1,
            extra: 0x40,
            full_replier: 0,
            command: Bytes::new(),
        };
        let bytes = postcard::to_allocvec(&wire).expect("encode");
        assert!(postcard::from_bytes::<Request>(&bytes).is_err());
    }

    #[test]
    fn consensus_digest_ignores_routing_and_auth_mode() {
        let a = request(Replier::All, false);
        let b = request(Replier::Designated(ReplicaId::new(2)), true);

        assert_eq!(a.consensus_digest(), b.consensus_digest());
        // ...but the authenticated content differs
        let a = AuthenticatedRequest::new(a, Authenticator::None);
        let b = AuthenticatedRequest::new(b, Authenticator::Mac(Mac::from_bytes([1; 32])));
        assert_ne!(a.content_digest(), b.content_digest());
    }

    #[test]
    fn consensus_digest_covers_agreement_fields() {
        let base = request(Replier::All, false);

        let mut other_id = base.clone();
        other_id.request_id = RequestId::new(18);
        assert_ne!(base.consensus_digest(), other_id.consensus_digest());

        let mut read_only = base.clone();
        read_only.flags.read_only = true;
        assert_ne!(base.consensus_digest(), read_only.consensus_digest());

        let mut replica_sender = base.clone();
        replica_sender.sender = ReplicaId::new(3).into();
        assert_ne!(base.consensus_digest(), replica_sender.consensus_digest());
    }

    #[test]
    fn replier_selection() {
        assert!(Replier::All.includes(ReplicaId::new(3)));
        assert!(Replier::Designated(ReplicaId::new(1)).includes(ReplicaId::new(1)));
        assert!(!Replier::Designated(ReplicaId::new(1)).includes(ReplicaId::new(2)));
    }

    #[test]
    fn reply_result_validation() {
        let result = Bytes::from_static(b"ok");
        let mut reply = Reply {
            view: ViewNumber::ZERO,
            request_id: RequestId::new(1),
            requester: ClientId::new(0).into(),
            replica: ReplicaId::new(0),
            result_digest: pbft_crypto::sha256(&result),
            result: Some(result),
        };
        assert!(reply.has_valid_result());

        reply.result = Some(Bytes::from_static(b"tampered"));
        assert!(!reply.has_valid_result());

        reply.result = None;
        assert!(!reply.has_valid_result());
    }

    proptest! {
        #[test]
        fn digests_stable_across_encoding(
            id in any::<u64>(),
            client in 0u32..1000,
            read_only in any::<bool>(),
            command in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let request = Request::new(
                ClientId::new(client).into(),
                RequestId::new(id),
                RequestFlags { read_only, use_signature: false },
                Replier::All,
                Bytes::from(command),
            );
            let message = Message::new(MessagePayload::Request(request.clone()));
            let decoded = Message::decode(&message.encode()).expect("decode");

            let MessagePayload::Request(decoded_request) = &decoded.payload else {
                panic!("wrong payload");
            };
            prop_assert_eq!(decoded_request.consensus_digest(), request.consensus_digest());
            prop_assert_eq!(decoded.content_digest(), message.content_digest());
        }
    }
}
