//! Length-prefixed framing of protocol messages.
//!
//! Frame layout: a u32 big-endian length covering everything after itself,
//! then a u16 big-endian message tag, then the JSON-encoded payload. The
//! maximum payload size is negotiated by configuration and enforced in both
//! directions.

use crate::messages::{Message, MessageTag};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const HEADER_LEN: usize = 4;
const TAG_LEN: usize = 2;

/// Default maximum payload size accepted or produced by a framer.
pub const DEFAULT_MAX_PAYLOAD: usize = 1 << 26; // 64 MiB

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = crate::Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> crate::Result<()> {
        let payload = msg
            .encode_payload()
            .expect("protocol messages always serialize");

        if payload.len() > self.max_payload {
            return Err(crate::Error::FrameTooLarge(payload.len()));
        }
        dst.reserve(HEADER_LEN + TAG_LEN + payload.len());
        dst.put_u32((TAG_LEN + payload.len()) as u32);
        dst.put_u16(msg.tag().to_u16());
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> crate::Result<Option<Message>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if frame_len < TAG_LEN {
            return Err(crate::Error::TruncatedHeader);
        }
        if frame_len - TAG_LEN > self.max_payload {
            return Err(crate::Error::FrameTooLarge(frame_len - TAG_LEN));
        }
        if src.len() < HEADER_LEN + frame_len {
            // Reserve for the rest of the frame and wait for more input.
            src.reserve(HEADER_LEN + frame_len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let tag = src.get_u16();
        let payload = src.split_to(frame_len - TAG_LEN);

        let tag = MessageTag::from_u16(tag).ok_or(crate::Error::UnknownTag(tag))?;
        Message::decode_payload(tag, &payload).map(Some)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::messages::{HeloRequest, StreamEndResponse};
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_frames_wait_for_more_input() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();

        codec
            .encode(Message::Helo(HeloRequest { version: 4 }), &mut buf)
            .unwrap();
        let full = buf.clone();

        // Feed the frame one byte at a time; only the final byte yields a message.
        let mut partial = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            partial.put_u8(*byte);
            let decoded = codec.decode(&mut partial).unwrap();
            if i + 1 < full.len() {
                assert!(decoded.is_none());
            } else {
                assert_eq!(decoded, Some(Message::Helo(HeloRequest { version: 4 })));
            }
        }
        assert!(partial.is_empty());
    }

    #[test]
    fn oversized_frames_are_rejected_without_buffering() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(1024 + TAG_LEN as u32);
        buf.put_u16(MessageTag::ResponseStream.to_u16());

        match codec.decode(&mut buf) {
            Err(crate::Error::FrameTooLarge(1024)) => (),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn back_to_back_frames_decode_individually() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();

        codec.encode(Message::EndStream, &mut buf).unwrap();
        codec
            .encode(
                Message::StreamEnd(StreamEndResponse { err: None }),
                &mut buf,
            )
            .unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::EndStream));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::StreamEnd(StreamEndResponse { err: None }))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
