//! Length-prefixed, tagged frames.
//!
//! Each frame is a 4-byte big-endian length followed by a tag byte and the
//! body: JSON for call headers and statuses, raw bytes for data.

use std::io;

use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::Frame;

/// Largest frame accepted on the wire.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const TAG_CALL: u8 = 0x01;
const TAG_DATA: u8 = 0x02;
const TAG_STATUS: u8 = 0x03;

pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(mut body) = self.inner.decode(src)? else {
            return Ok(None);
        };
        if body.is_empty() {
            return Err(invalid("empty frame"));
        }
        let tag = body.split_to(1)[0];
        let frame = match tag {
            TAG_CALL => Frame::Call(serde_json::from_slice(&body).map_err(|e| invalid(e.to_string()))?),
            TAG_DATA => Frame::Data(body.freeze()),
            TAG_STATUS => Frame::Status(serde_json::from_slice(&body).map_err(|e| invalid(e.to_string()))?),
            other => return Err(invalid(format!("unknown frame tag {other:#04x}"))),
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (tag, body) = match &item {
            Frame::Call(header) => (
                TAG_CALL,
                Bytes::from(serde_json::to_vec(header).map_err(|e| invalid(e.to_string()))?),
            ),
            Frame::Data(bytes) => (TAG_DATA, bytes.clone()),
            Frame::Status(status) => (
                TAG_STATUS,
                Bytes::from(serde_json::to_vec(status).map_err(|e| invalid(e.to_string()))?),
            ),
        };
        let mut framed = BytesMut::with_capacity(body.len() + 1);
        framed.put_u8(tag);
        framed.put_slice(&body);
        tracing::trace!(kind = item.kind(), len = framed.len(), "Encoding frame");
        self.inner.encode(framed.freeze(), dst)
    }
}
