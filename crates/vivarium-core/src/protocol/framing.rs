//! Frame codec for the 17-byte-header wire protocol.
//!
//! Implements [`tokio_util::codec`] traits so the transport can wrap a
//! stream in `Framed<_, FrameCodec>` and work in whole messages. The
//! decoder validates the magic and the declared payload length before
//! any allocation happens; a frame that fails either check is
//! unrecoverable and the caller is expected to drop the connection.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{ProtocolError, ProtocolResult};
use super::{Message, HEADER_LEN, MAGIC, MAX_PAYLOAD_SIZE};

/// Codec translating between byte streams and [`Message`] frames.
///
/// Frames of payload length 0 are valid; frames above 1 MiB are not.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Message>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic { actual: magic });
        }

        let agent_id = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);
        let opcode = src[8];
        let payload_len = u64::from_le_bytes([
            src[9], src[10], src[11], src[12], src[13], src[14], src[15], src[16],
        ]);

        // Validate before reserving anything for the payload.
        if payload_len > MAX_PAYLOAD_SIZE as u64 {
            return Err(ProtocolError::PayloadTooLarge { size: payload_len });
        }

        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_PAYLOAD_SIZE
        let payload_len = payload_len as usize;

        let total = HEADER_LEN + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Message {
            agent_id,
            opcode,
            payload,
        }))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> ProtocolResult<()> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: item.payload.len() as u64,
            });
        }

        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u32_le(MAGIC);
        dst.put_u32_le(item.agent_id);
        dst.put_u8(item.opcode);
        dst.put_u64_le(item.payload.len() as u64);
        dst.extend_from_slice(&item.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::protocol::SyscallOp;

    fn encode(msg: Message) -> BytesMut {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn encode_decode_round_trip() {
        let msg = Message::new(42, SyscallOp::Noop, Bytes::from_static(b"ping"));
        let mut buf = encode(msg.clone());

        assert_eq!(buf.len(), HEADER_LEN + 4);
        assert_eq!(&buf[..4], &MAGIC.to_le_bytes());

        let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_payload_is_legal() {
        let msg = Message::new(1, SyscallOp::Hello, Bytes::new());
        let mut buf = encode(msg.clone());
        assert_eq!(buf.len(), HEADER_LEN);

        let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn partial_header_waits() {
        let mut buf = BytesMut::from(&MAGIC.to_le_bytes()[..]);
        let result = FrameCodec::new().decode(&mut buf).unwrap();
        assert!(result.is_none());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn partial_payload_waits() {
        let msg = Message::new(1, SyscallOp::Noop, Bytes::from_static(b"0123456789"));
        let mut buf = encode(msg);
        buf.truncate(HEADER_LEN + 5);

        let result = FrameCodec::new().decode(&mut buf).unwrap();
        assert!(result.is_none());
        assert_eq!(buf.len(), HEADER_LEN + 5);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0xDEAD_BEEF);
        buf.put_u32_le(0);
        buf.put_u8(0);
        buf.put_u64_le(0);

        let result = FrameCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::BadMagic { .. })));
    }

    #[test]
    fn max_payload_is_legal_one_past_is_not() {
        let msg = Message::new(1, SyscallOp::Noop, vec![0xAB; MAX_PAYLOAD_SIZE]);
        let mut buf = encode(msg);
        let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), MAX_PAYLOAD_SIZE);

        // Hand-build a header declaring one byte too many.
        let mut buf = BytesMut::new();
        buf.put_u32_le(MAGIC);
        buf.put_u32_le(1);
        buf.put_u8(0);
        buf.put_u64_le(MAX_PAYLOAD_SIZE as u64 + 1);
        let result = FrameCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[test]
    fn oversized_encode_is_rejected() {
        let msg = Message::new(1, SyscallOp::Noop, vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        let mut buf = BytesMut::new();
        let result = FrameCodec::new().encode(msg, &mut buf);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let first = Message::new(1, SyscallOp::Noop, Bytes::from_static(b"a"));
        let second = Message::new(1, SyscallOp::Hello, Bytes::from_static(b"bb"));

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(buf.is_empty());
    }
}
