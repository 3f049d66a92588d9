//! Wire framing.
//!
//! ```text
//! ┌──────────────┬─────────┬────────────────────────────────────┐
//! │ magic (3 B)  │ tag (1) │ body: postcard((content, auth))     │
//! │ 00 01 55     │         │                                     │
//! └──────────────┴─────────┴────────────────────────────────────┘
//! ```
//!
//! The prefix is validated before anything else so the dispatcher can route
//! on the tag without decoding the body.

use bytes::{BufMut, Bytes, BytesMut};

use super::MessageTag;
use crate::error::FrameError;

/// Magic/version prefix of every frame.
pub const MAGIC: [u8; 3] = [0x00, 0x01, 0x55];

/// Bytes before the body.
pub const HEADER_LENGTH: usize = MAGIC.len() + 1;

/// Builds a frame from a tag and an encoded body.
pub fn encode_frame(tag: MessageTag, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LENGTH + body.len());
    buf.put_slice(&MAGIC);
    buf.put_u8(tag.as_u8());
    buf.put_slice(body);
    buf.freeze()
}

/// Validates the frame prefix and splits off the raw body.
pub fn decode_frame(bytes: &[u8]) -> Result<(MessageTag, &[u8]), FrameError> {
    if bytes.len() < HEADER_LENGTH {
        return Err(FrameError::TooShort { len: bytes.len() });
    }

    let magic = [bytes[0], bytes[1], bytes[2]];
    if magic != MAGIC {
        return Err(FrameError::BadMagic(magic));
    }

    let tag = MessageTag::try_from(bytes[3])?;
    let body = &bytes[HEADER_LENGTH..];
    if body.is_empty() {
        return Err(FrameError::EmptyBody(tag));
    }

    Ok((tag, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn frame_roundtrip() {
        let frame = encode_frame(MessageTag::Commit, b"body");
        assert_eq!(&frame[..4], &[0x00, 0x01, 0x55, 5]);

        let (tag, body) = decode_frame(&frame).expect("valid frame");
        assert_eq!(tag, MessageTag::Commit);
        assert_eq!(body, b"body");
    }

    #[test_case(&[] ; "empty datagram")]
    #[test_case(&[0x00, 0x01, 0x55] ; "prefix only")]
    fn too_short(bytes: &[u8]) {
        assert!(matches!(
            decode_frame(bytes),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn bad_magic() {
        let err = decode_frame(&[0x00, 0x02, 0x55, 4, 1]).expect_err("bad magic");
        assert!(matches!(err, FrameError::BadMagic([0x00, 0x02, 0x55])));
    }

    #[test]
    fn unknown_tag() {
        let err = decode_frame(&[0x00, 0x01, 0x55, 42, 1]).expect_err("unknown tag");
        assert!(matches!(err, FrameError::UnknownTag(42)));
    }

    #[test]
    fn empty_body() {
        let err = decode_frame(&[0x00, 0x01, 0x55, 4]).expect_err("empty body");
        assert!(matches!(err, FrameError::EmptyBody(MessageTag::Prepare)));
    }
}
