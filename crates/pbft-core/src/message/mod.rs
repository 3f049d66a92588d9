//! Protocol messages.
//!
//! Every message has the same three layers:
//!
//! - **content**: the postcard encoding of the typed payload, without its
//!   authenticator
//! - **content digest**: `SHA-256(tag ‖ content)`, the input to signatures
//!   and MACs
//! - **frame**: `[magic][tag][postcard((content, authenticator))]` (see
//!   [`frame`])
//!
//! Requests and PrePrepares also have a *consensus digest* that ignores
//! authenticators and routing hints, so replicas that obtained the same
//! operation through different paths agree on it.
//!
//! # Message Types
//!
//! | Tag | Message      | Authenticator                         |
//! |-----|--------------|---------------------------------------|
//! | 1   | `Request`    | MAC vector or signature (per request) |
//! | 2   | `Reply`      | single MAC to the client              |
//! | 3   | `PrePrepare` | MAC vector or signature               |
//! | 4   | `Prepare`    | MAC vector or signature               |
//! | 5   | `Commit`     | MAC vector or signature               |
//! | 6   | `Checkpoint` | MAC vector or signature               |
//! | 7   | `Status`     | MAC vector or signature               |
//! | 8   | `ViewChange` | signature                             |
//! | 9   | `NewView`    | signature                             |
//! | 11  | `NewKey`     | signature                             |

pub mod frame;
mod new_key;
mod protocol;
mod request;
mod view_change;

pub use new_key::{NewKey, seal_context};
pub use protocol::{BatchEntry, Checkpoint, Commit, PrePrepare, Prepare, RequestRef, Status};
pub use request::{AuthenticatedRequest, Replier, Reply, Request, RequestFlags};
pub use view_change::{NewView, PreparedEntry, SignedViewChange, ViewChange};

use bytes::Bytes;
use pbft_crypto::{Mac, Signature};
use pbft_types::{Digest, PrincipalId, ViewNumber};
use serde::{Deserialize, Serialize};

use crate::error::FrameError;

// ============================================================================
// Message Tag
// ============================================================================

/// The one-byte message-type tag carried in every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageTag {
    Request = 1,
    Reply = 2,
    PrePrepare = 3,
    Prepare = 4,
    Commit = 5,
    Checkpoint = 6,
    Status = 7,
    ViewChange = 8,
    NewView = 9,
    NewKey = 11,
}

impl MessageTag {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for messages that must carry a signature.
    pub fn requires_signature(self) -> bool {
        matches!(self, Self::ViewChange | Self::NewView | Self::NewKey)
    }
}

impl TryFrom<u8> for MessageTag {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Reply),
            3 => Ok(Self::PrePrepare),
            4 => Ok(Self::Prepare),
            5 => Ok(Self::Commit),
            6 => Ok(Self::Checkpoint),
            7 => Ok(Self::Status),
            8 => Ok(Self::ViewChange),
            9 => Ok(Self::NewView),
            11 => Ok(Self::NewKey),
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

/// Computes `SHA-256(tag ‖ content)`.
pub(crate) fn tagged_digest(tag: MessageTag, content: &[u8]) -> Digest {
    pbft_crypto::DigestBuilder::new()
        .update(&[tag.as_u8()])
        .update(content)
        .finalize()
}

/// Canonical encoding of a message body.
///
/// Every payload type is plain data, so postcard cannot fail on it.
pub(crate) fn encode_content<T: Serialize>(value: &T) -> Vec<u8> {
    postcard::to_allocvec(value)
        .expect("message serialization should never fail (all fields are serializable)")
}

// ============================================================================
// Authenticator
// ============================================================================

/// Proof of origin attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Authenticator {
    /// Not yet authenticated. Never accepted by a receiver.
    #[default]
    None,

    /// Ed25519 signature over the content digest.
    Signature(Signature),

    /// One MAC per replica over the content digest; the sender's own slot is
    /// empty. Length is always `n`.
    Macs(Vec<Option<Mac>>),

    /// A single MAC for a point-to-point replica→client reply.
    Mac(Mac),
}

impl Authenticator {
    pub fn is_signature(&self) -> bool {
        matches!(self, Self::Signature(_))
    }
}

// ============================================================================
// Message Payload
// ============================================================================

/// Closed set of protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    Request(Request),
    Reply(Reply),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(Checkpoint),
    Status(Status),
    ViewChange(ViewChange),
    NewView(NewView),
    NewKey(NewKey),
}

impl MessagePayload {
    pub fn tag(&self) -> MessageTag {
        match self {
            Self::Request(_) => MessageTag::Request,
            Self::Reply(_) => MessageTag::Reply,
            Self::PrePrepare(_) => MessageTag::PrePrepare,
            Self::Prepare(_) => MessageTag::Prepare,
            Self::Commit(_) => MessageTag::Commit,
            Self::Checkpoint(_) => MessageTag::Checkpoint,
            Self::Status(_) => MessageTag::Status,
            Self::ViewChange(_) => MessageTag::ViewChange,
            Self::NewView(_) => MessageTag::NewView,
            Self::NewKey(_) => MessageTag::NewKey,
        }
    }

    /// The principal that claims to have sent this payload.
    pub fn sender(&self) -> PrincipalId {
        match self {
            Self::Request(m) => m.sender,
            Self::Reply(m) => m.replica.into(),
            Self::PrePrepare(m) => m.replica.into(),
            Self::Prepare(m) => m.replica.into(),
            Self::Commit(m) => m.replica.into(),
            Self::Checkpoint(m) => m.replica.into(),
            Self::Status(m) => m.replica.into(),
            Self::ViewChange(m) => m.replica.into(),
            Self::NewView(m) => m.replica.into(),
            Self::NewKey(m) => m.sender,
        }
    }

    /// The view this payload belongs to, if it is view-scoped.
    pub fn view(&self) -> Option<ViewNumber> {
        match self {
            Self::Reply(m) => Some(m.view),
            Self::PrePrepare(m) => Some(m.view),
            Self::Prepare(m) => Some(m.view),
            Self::Commit(m) => Some(m.view),
            Self::Status(m) => Some(m.view),
            Self::ViewChange(m) => Some(m.new_view),
            Self::NewView(m) => Some(m.view),
            Self::Request(_) | Self::Checkpoint(_) | Self::NewKey(_) => None,
        }
    }

    /// Canonical content encoding (everything except the authenticator).
    pub fn content(&self) -> Vec<u8> {
        match self {
            Self::Request(m) => encode_content(m),
            Self::Reply(m) => encode_content(m),
            Self::PrePrepare(m) => encode_content(m),
            Self::Prepare(m) => encode_content(m),
            Self::Commit(m) => encode_content(m),
            Self::Checkpoint(m) => encode_content(m),
            Self::Status(m) => encode_content(m),
            Self::ViewChange(m) => encode_content(m),
            Self::NewView(m) => encode_content(m),
            Self::NewKey(m) => encode_content(m),
        }
    }

    /// Decodes content bytes for `tag`.
    pub fn decode_content(tag: MessageTag, content: &[u8]) -> Result<Self, postcard::Error> {
        Ok(match tag {
            MessageTag::Request => Self::Request(postcard::from_bytes(content)?),
            MessageTag::Reply => Self::Reply(postcard::from_bytes(content)?),
            MessageTag::PrePrepare => Self::PrePrepare(postcard::from_bytes(content)?),
            MessageTag::Prepare => Self::Prepare(postcard::from_bytes(content)?),
            MessageTag::Commit => Self::Commit(postcard::from_bytes(content)?),
            MessageTag::Checkpoint => Self::Checkpoint(postcard::from_bytes(content)?),
            MessageTag::Status => Self::Status(postcard::from_bytes(content)?),
            MessageTag::ViewChange => Self::ViewChange(postcard::from_bytes(content)?),
            MessageTag::NewView => Self::NewView(postcard::from_bytes(content)?),
            MessageTag::NewKey => Self::NewKey(postcard::from_bytes(content)?),
        })
    }

    /// `SHA-256(tag ‖ content)`: what signatures and MACs cover.
    pub fn content_digest(&self) -> Digest {
        tagged_digest(self.tag(), &self.content())
    }
}

// ============================================================================
// Message Envelope
// ============================================================================

/// A payload together with its authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: MessagePayload,
    pub auth: Authenticator,
}

/// Wire body: `(content, authenticator)`.
#[derive(Serialize, Deserialize)]
struct Body {
    content: Bytes,
    auth: Authenticator,
}

impl Message {
    /// Wraps a payload with no authenticator yet.
    pub fn new(payload: MessagePayload) -> Self {
        Self {
            payload,
            auth: Authenticator::None,
        }
    }

    pub fn with_auth(payload: MessagePayload, auth: Authenticator) -> Self {
        Self { payload, auth }
    }

    pub fn tag(&self) -> MessageTag {
        self.payload.tag()
    }

    pub fn sender(&self) -> PrincipalId {
        self.payload.sender()
    }

    pub fn view(&self) -> Option<ViewNumber> {
        self.payload.view()
    }

    pub fn content_digest(&self) -> Digest {
        self.payload.content_digest()
    }

    /// Encodes this message as a wire frame.
    pub fn encode(&self) -> Bytes {
        let body = Body {
            content: Bytes::from(self.payload.content()),
            auth: self.auth.clone(),
        };
        frame::encode_frame(self.tag(), &encode_content(&body))
    }

    /// Parses a wire frame.
    ///
    /// Phase one validates the prefix and tag; phase two decodes the body
    /// and then the typed content.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (tag, raw_body) = frame::decode_frame(bytes)?;
        Self::decode_body(tag, raw_body)
    }

    /// Phase two of parsing: decodes a raw body for an already-routed tag.
    pub fn decode_body(tag: MessageTag, raw_body: &[u8]) -> Result<Self, FrameError> {
        let body: Body =
            postcard::from_bytes(raw_body).map_err(|source| FrameError::Malformed { tag, source })?;
        let payload = MessagePayload::decode_content(tag, &body.content)
            .map_err(|source| FrameError::Malformed { tag, source })?;
        Ok(Self {
            payload,
            auth: body.auth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_crypto::SealedKey;
    use pbft_types::{ClientId, ReplicaId, RequestId, SeqNo};
    use proptest::prelude::*;
    use test_case::test_case;

    fn prepare() -> Message {
        Message::new(MessagePayload::Prepare(Prepare {
            view: ViewNumber::new(2),
            seqno: SeqNo::new(7),
            digest: pbft_crypto::sha256(b"batch"),
            replica: ReplicaId::new(1),
        }))
    }

    #[test_case(1, MessageTag::Request)]
    #[test_case(5, MessageTag::Commit)]
    #[test_case(9, MessageTag::NewView)]
    #[test_case(11, MessageTag::NewKey)]
    fn tag_from_u8(byte: u8, expected: MessageTag) {
        assert_eq!(MessageTag::try_from(byte).expect("known tag"), expected);
        assert_eq!(expected.as_u8(), byte);
    }

    #[test_case(0)]
    #[test_case(10)]
    #[test_case(12)]
    #[test_case(255)]
    fn unknown_tags_rejected(byte: u8) {
        assert!(matches!(
            MessageTag::try_from(byte),
            Err(FrameError::UnknownTag(b)) if b == byte
        ));
    }

    #[test]
    fn content_digest_covers_tag() {
        let prepare = prepare();
        let MessagePayload::Prepare(p) = prepare.payload.clone() else {
            unreachable!()
        };
        let commit = Message::new(MessagePayload::Commit(Commit {
            view: p.view,
            seqno: p.seqno,
            digest: p.digest,
            replica: p.replica,
        }));

        // Same field values, different message type
        assert_eq!(prepare.payload.content(), commit.payload.content());
        assert_ne!(prepare.content_digest(), commit.content_digest());
    }

    #[test]
    fn authenticator_does_not_change_content_digest() {
        let plain = prepare();
        let mut macd = plain.clone();
        macd.auth = Authenticator::Macs(vec![None, Some(Mac::from_bytes([3; 32]))]);
        assert_eq!(plain.content_digest(), macd.content_digest());
    }

    #[test]
    fn encode_decode_preserves_message() {
        let mut message = prepare();
        message.auth = Authenticator::Macs(vec![Some(Mac::from_bytes([9; 32])), None]);

        let decoded = Message::decode(&message.encode()).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn sender_and_view() {
        let message = prepare();
        assert_eq!(message.sender(), PrincipalId::Replica(ReplicaId::new(1)));
        assert_eq!(message.view(), Some(ViewNumber::new(2)));

        let request = Message::new(MessagePayload::Request(Request::new(
            ClientId::new(4).into(),
            RequestId::new(1),
            RequestFlags::default(),
            Replier::All,
            Bytes::from_static(b"op"),
        )));
        assert_eq!(request.sender(), PrincipalId::Client(ClientId::new(4)));
        assert_eq!(request.view(), None);
    }

    #[test]
    fn truncated_body_is_malformed() {
        let bytes = prepare().encode();
        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(
            Message::decode(truncated),
            Err(FrameError::Malformed {
                tag: MessageTag::Prepare,
                ..
            })
        ));
    }

    #[test]
    fn signature_kind_required_for_evidence_messages() {
        assert!(MessageTag::ViewChange.requires_signature());
        assert!(MessageTag::NewView.requires_signature());
        assert!(MessageTag::NewKey.requires_signature());
        assert!(!MessageTag::Prepare.requires_signature());
        assert!(!MessageTag::Request.requires_signature());
    }

    fn digest_of(seed: u8) -> Digest {
        pbft_crypto::sha256(&[seed])
    }

    fn proposal(
        view: u64,
        seqno: u64,
        commands: Vec<Vec<u8>>,
        by_reference: bool,
    ) -> PrePrepare {
        let entries = commands
            .into_iter()
            .enumerate()
            .map(|(i, command)| {
                let request = AuthenticatedRequest::new(
                    Request::new(
                        ClientId::new(i as u32).into(),
                        RequestId::new(seqno),
                        RequestFlags::default(),
                        Replier::All,
                        Bytes::from(command),
                    ),
                    Authenticator::Macs(vec![None, Some(Mac::from_bytes([i as u8; 32]))]),
                );
                if by_reference && i % 2 == 1 {
                    BatchEntry::Reference(RequestRef {
                        sender: request.sender(),
                        request_id: request.request_id(),
                        digest: request.consensus_digest(),
                    })
                } else {
                    BatchEntry::Full(request)
                }
            })
            .collect();
        PrePrepare {
            view: ViewNumber::new(view),
            seqno: SeqNo::new(seqno),
            replica: ReplicaId::new((view % 4) as u32),
            entries,
            non_deterministic: Bytes::new(),
        }
    }

    /// Encodes and decodes, checking the message and its content digest
    /// come back unchanged.
    fn through_the_wire(payload: MessagePayload, auth: Authenticator) -> MessagePayload {
        let message = Message::with_auth(payload, auth);
        let decoded = Message::decode(&message.encode()).expect("decode");
        assert_eq!(decoded, message);
        assert_eq!(decoded.content_digest(), message.content_digest());
        decoded.payload
    }

    fn commands() -> impl Strategy<Value = Vec<Vec<u8>>> {
        proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..4)
    }

    proptest! {
        #[test]
        fn pre_prepare_keeps_its_consensus_digest(
            view in 0u64..1_000,
            seqno in 1u64..1_000_000,
            commands in commands(),
            by_reference in any::<bool>(),
        ) {
            let pp = proposal(view, seqno, commands, by_reference);
            let auth = Authenticator::Macs(vec![Some(Mac::from_bytes([7; 32])), None]);
            let MessagePayload::PrePrepare(decoded) =
                through_the_wire(MessagePayload::PrePrepare(pp.clone()), auth)
            else {
                panic!("wrong payload");
            };
            prop_assert_eq!(decoded.consensus_digest(), pp.consensus_digest());
        }

        #[test]
        fn commit_and_checkpoint_survive_the_wire(
            view in any::<u64>(),
            seqno in any::<u64>(),
            seed in any::<u8>(),
            replica in 0u32..64,
        ) {
            let commit = MessagePayload::Commit(Commit {
                view: ViewNumber::new(view),
                seqno: SeqNo::new(seqno),
                digest: digest_of(seed),
                replica: ReplicaId::new(replica),
            });
            let checkpoint = MessagePayload::Checkpoint(Checkpoint {
                seqno: SeqNo::new(seqno),
                state_digest: digest_of(seed.wrapping_add(1)),
                replica: ReplicaId::new(replica),
            });
            let signature = Authenticator::Signature(Signature::from_bytes([seed; 64]));
            prop_assert_eq!(through_the_wire(commit.clone(), signature), commit);
            prop_assert_eq!(through_the_wire(checkpoint.clone(), Authenticator::None), checkpoint);
        }

        #[test]
        fn status_survives_the_wire(
            view in any::<u64>(),
            has_new_view in any::<bool>(),
            last_stable in any::<u64>(),
            last_executed in any::<u64>(),
            prepared in proptest::collection::vec(any::<u64>(), 0..16),
            committed in proptest::collection::vec(any::<u64>(), 0..16),
        ) {
            let status = MessagePayload::Status(Status {
                view: ViewNumber::new(view),
                has_new_view,
                last_stable: SeqNo::new(last_stable),
                last_executed: SeqNo::new(last_executed),
                prepared: prepared.into_iter().map(SeqNo::new).collect(),
                committed: committed.into_iter().map(SeqNo::new).collect(),
                replica: ReplicaId::new(3),
            });
            let auth = Authenticator::Macs(vec![Some(Mac::from_bytes([1; 32])); 4]);
            prop_assert_eq!(through_the_wire(status.clone(), auth), status);
        }

        #[test]
        fn view_change_and_new_view_survive_the_wire(
            view in 1u64..1_000,
            last_stable in 0u64..1_000,
            batches in proptest::collection::vec(commands(), 0..4),
            seed in any::<u8>(),
        ) {
            let prepared: Vec<PreparedEntry> = batches
                .into_iter()
                .enumerate()
                .map(|(i, commands)| {
                    let seqno = last_stable + 1 + i as u64;
                    let pre_prepare = proposal(view - 1, seqno, commands, true);
                    PreparedEntry {
                        seqno: SeqNo::new(seqno),
                        view: ViewNumber::new(view - 1),
                        digest: pre_prepare.consensus_digest(),
                        pre_prepare,
                    }
                })
                .collect();
            let view_change = ViewChange {
                new_view: ViewNumber::new(view),
                replica: ReplicaId::new(2),
                last_stable: SeqNo::new(last_stable),
                stable_digest: digest_of(seed),
                prepared,
            };
            let signature = Signature::from_bytes([seed; 64]);

            let MessagePayload::ViewChange(decoded) = through_the_wire(
                MessagePayload::ViewChange(view_change.clone()),
                Authenticator::Signature(signature),
            ) else {
                panic!("wrong payload");
            };
            prop_assert_eq!(decoded.content_digest(), view_change.content_digest());
            prop_assert!(decoded.prepared.iter().all(PreparedEntry::is_consistent));

            let new_view = MessagePayload::NewView(NewView {
                view: ViewNumber::new(view),
                replica: ReplicaId::new(1),
                min_s: SeqNo::new(last_stable),
                stable_digest: digest_of(seed),
                pre_prepares: view_change
                    .prepared
                    .iter()
                    .map(|entry| {
                        entry.pre_prepare.reproposed(ViewNumber::new(view), ReplicaId::new(1))
                    })
                    .collect(),
                view_changes: vec![SignedViewChange { view_change, signature }],
            });
            prop_assert_eq!(
                through_the_wire(new_view.clone(), Authenticator::Signature(signature)),
                new_view
            );
        }

        #[test]
        fn new_key_survives_the_wire(
            request_id in any::<u64>(),
            sealed in proptest::collection::vec(
                proptest::option::of(proptest::collection::vec(any::<u8>(), 0..80)),
                1..8,
            ),
            seed in any::<u8>(),
        ) {
            let keys = sealed
                .into_iter()
                .map(|ciphertext| {
                    ciphertext.map(|ciphertext| SealedKey {
                        ephemeral_public: [seed; 32],
                        nonce: std::array::from_fn(|i| seed ^ i as u8),
                        ciphertext,
                    })
                })
                .collect();
            let bundle = MessagePayload::NewKey(NewKey {
                sender: ClientId::new(1).into(),
                request_id,
                keys,
            });
            let auth = Authenticator::Signature(Signature::from_bytes([seed; 64]));
            prop_assert_eq!(through_the_wire(bundle.clone(), auth), bundle);
        }
    }
}
