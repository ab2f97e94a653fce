//! Frame serialization.

use super::frame::{Frame, HEADER_SIZE, MAGIC};
use bytes::{BufMut, Bytes, BytesMut};

/// Stateless frame encoder.
pub struct Encoder;

impl Encoder {
    /// Append the encoded frame to `dst`.
    ///
    /// The payload is copied, so `dst` never aliases the frame's buffer.
    pub fn encode(frame: &Frame, dst: &mut BytesMut) {
        dst.reserve(frame.encoded_len());
        dst.put_u16(MAGIC);
        dst.put_u8(frame.version().as_u8());
        dst.put_u8(frame.message_type().as_u8());
        dst.put_u64(frame.id());
        dst.put_i64(frame.timestamp());
        dst.put_u32(frame.length());
        dst.put_slice(frame.payload());
    }

    /// Encode a frame into a freshly allocated buffer.
    pub fn encode_to_bytes(frame: &Frame) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + frame.payload().len());
        Self::encode(frame, &mut buf);
        buf.freeze()
    }
}
