//! Length-delimited framing codec for the agent protocol.
//!
//! 4-byte big-endian length prefix followed by the MessagePack frame body.

use bytes::BytesMut;
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::frame::Frame;

/// Maximum frame size (16 MiB). Oversized frames are a protocol violation.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Codec for protocol frames.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let frame = Frame::decode(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.inner.encode(bytes.into(), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBody;

    #[test]
    fn codec_roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = Frame {
            seq: 7,
            body: FrameBody::Heartbeat { load: 0.5 },
        };
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().expect("one frame");
        assert_eq!(decoded, frame);
        assert!(codec.decode(&mut buf).unwrap().is_none(), "buffer drained");
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame {
                    seq: 1,
                    body: FrameBody::Heartbeat { load: 1.0 },
                },
                &mut buf,
            )
            .unwrap();

        // Feed all but the last byte; the decoder must hold.
        let full = buf.split();
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 1..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        for seq in 0..3u64 {
            codec
                .encode(
                    Frame {
                        seq,
                        body: FrameBody::Heartbeat { load: seq as f64 },
                    },
                    &mut buf,
                )
                .unwrap();
        }
        for seq in 0..3u64 {
            let frame = codec.decode(&mut buf).unwrap().expect("frame");
            assert_eq!(frame.seq, seq);
        }
    }

    #[test]
    fn garbage_payload_is_invalid_data() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        // Valid length prefix, invalid MessagePack payload.
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(&[0xc1, 0xc1, 0xc1, 0xc1]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
