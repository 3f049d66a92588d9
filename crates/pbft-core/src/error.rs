//! Error types for the agreement core.
//!
//! None of these errors is fatal to a replica except
//! [`RuntimeError::TransportFatal`]. Every other failure drops the offending
//! message at the boundary where it was detected, before any state mutation.

use pbft_crypto::CryptoError;
use pbft_types::{PrincipalId, RequestId, SeqNo, ViewNumber};
use thiserror::Error;

use crate::message::MessageTag;

/// Errors raised while parsing a datagram into a message.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Datagram shorter than the frame prefix.
    #[error("frame too short: {len} bytes")]
    TooShort { len: usize },

    /// The 3-byte magic/version prefix did not match.
    #[error("bad frame magic: {0:02x?}")]
    BadMagic([u8; 3]),

    /// The message-type tag is not one we know.
    #[error("unknown message tag: {0}")]
    UnknownTag(u8),

    /// The frame carried no body.
    #[error("empty body for {0:?}")]
    EmptyBody(MessageTag),

    /// The body did not decode as `(content, authenticator)` or the content
    /// did not decode as the tagged message type.
    #[error("malformed {tag:?} body: {source}")]
    Malformed {
        tag: MessageTag,
        #[source]
        source: postcard::Error,
    },
}

/// Errors raised by the certificate log.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogError {
    /// The sequence number is outside `[head, head + capacity)`.
    #[error("seqno {seqno} outside log window [{head}, {head}+{capacity})")]
    OutOfWindow {
        seqno: SeqNo,
        head: SeqNo,
        capacity: u64,
    },
}

/// Why a protocol message was dropped.
///
/// Handlers validate into a `Rejection` and log it; rejections never
/// propagate out of the state machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Bad signature or MAC, unestablished key, or wrong authenticator kind.
    #[error("authentication failed for {sender}: {reason}")]
    AuthenticationFailure {
        sender: PrincipalId,
        reason: &'static str,
    },

    /// The message breaks a protocol rule (wrong sender role, conflicting
    /// proposal, vote outside the proper view or watermark window).
    #[error("protocol violation from {sender}: {reason}")]
    ProtocolViolation {
        sender: PrincipalId,
        reason: &'static str,
    },

    /// The request id does not advance past the last one answered.
    #[error("stale request {request_id} from {sender} (last replied {last_replied})")]
    StaleRequest {
        sender: PrincipalId,
        request_id: RequestId,
        last_replied: RequestId,
    },

    /// The message belongs to a view this replica has left.
    #[error("message for old view {view} (current {current})")]
    OldView {
        view: ViewNumber,
        current: ViewNumber,
    },
}

impl Rejection {
    /// True for authentication failures; used to pick the metric to bump.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::AuthenticationFailure { .. })
    }
}

/// Errors raised when installing a peer's session key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("unknown principal {0}")]
    UnknownPrincipal(PrincipalId),

    /// The bundle's request id does not advance past the installed one.
    #[error("stale key bundle from {sender}: request id {request_id} <= {installed}")]
    StaleRequestId {
        sender: PrincipalId,
        request_id: u64,
        installed: u64,
    },

    /// The bundle has no sealed key for this node.
    #[error("key bundle from {0} has no slot for this node")]
    MissingSlot(PrincipalId),

    #[error("failed to open sealed key: {0}")]
    Crypto(#[from] CryptoError),
}

/// Errors raised by the client protocol.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// A previous request is still waiting for its reply quorum.
    #[error("request {0} still outstanding")]
    RequestOutstanding(RequestId),
}

/// Errors that terminate the replica run loop.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The transport lost its connection; the operator must restart.
    #[error("transport connection lost")]
    TransportFatal,

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
