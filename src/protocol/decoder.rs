//! Stream reassembly.
//!
//! TCP delivers a byte stream, not messages: one read may hold several
//! frames, one frame, or a fragment of one. The decoder buffers unconsumed
//! bytes and hands out a frame only once its whole payload has arrived.
//!
//! The header is parsed from a borrowed view of the buffer, so nothing is
//! consumed until the complete frame is present. A short read simply leaves
//! the buffer as it was and the header is parsed again on the next attempt.

use super::frame::{Frame, MessageType, ProtocolError, Version, HEADER_SIZE, MAGIC, MAX_MESSAGE_SIZE};
use bytes::{Buf, BytesMut};

/// Initial capacity of the reassembly buffer.
const INITIAL_CAPACITY: usize = 16 * 1024;

/// Outcome of a single decode attempt.
#[derive(Debug)]
pub enum DecodeResult {
    /// A complete, validated frame.
    Complete(Frame),
    /// Not enough buffered bytes yet. Not an error.
    NeedData,
    /// Protocol violation; the stream cannot be resynchronized.
    Error(ProtocolError),
}

/// Header fields read ahead of the payload.
struct RawHeader {
    magic: u16,
    version: u8,
    message_type: u8,
    id: u64,
    timestamp: i64,
    length: u32,
}

impl RawHeader {
    fn peek(buf: &[u8]) -> Self {
        let mut buf = &buf[..HEADER_SIZE];
        Self {
            magic: buf.get_u16(),
            version: buf.get_u8(),
            message_type: buf.get_u8(),
            id: buf.get_u64(),
            timestamp: buf.get_i64(),
            length: buf.get_u32(),
        }
    }
}

/// Per-connection frame decoder.
pub struct Decoder {
    buffer: BytesMut,
    max_message_size: u32,
    failed: Option<ProtocolError>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    /// Create a decoder with a lower payload bound. Values above
    /// [`MAX_MESSAGE_SIZE`] are clamped to it.
    pub fn with_max_message_size(max_message_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_message_size: max_message_size.min(MAX_MESSAGE_SIZE),
            failed: None,
        }
    }

    /// Append a chunk of received bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        if self.failed.is_none() {
            self.buffer.extend_from_slice(chunk);
        }
    }

    /// The reassembly buffer, for reading from a socket straight into it.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Number of bytes waiting to be decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn max_message_size(&self) -> u32 {
        self.max_message_size
    }

    /// Whether a protocol violation has been seen.
    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    /// Attempt to decode one frame from the buffered bytes.
    pub fn decode(&mut self) -> DecodeResult {
        if let Some(err) = &self.failed {
            return DecodeResult::Error(err.clone());
        }

        if self.buffer.len() < HEADER_SIZE {
            return DecodeResult::NeedData;
        }

        let header = RawHeader::peek(&self.buffer);

        if header.magic != MAGIC {
            return self.fail(ProtocolError::BadMagic(header.magic));
        }
        if header.length > self.max_message_size {
            return self.fail(ProtocolError::MessageTooLarge {
                length: header.length as u64,
                max: self.max_message_size,
            });
        }

        let total = HEADER_SIZE + header.length as usize;
        // Don't reserve `total` up front: a peer announcing a huge length
        // must send the bytes before we hold memory for them.
        if self.buffer.len() < total {
            return DecodeResult::NeedData;
        }

        let version = match Version::try_from(header.version) {
            Ok(v) => v,
            Err(e) => return self.fail(e),
        };
        let message_type = match MessageType::try_from(header.message_type) {
            Ok(t) => t,
            Err(e) => return self.fail(e),
        };

        self.buffer.advance(HEADER_SIZE);
        let payload = self.buffer.split_to(header.length as usize).freeze();

        DecodeResult::Complete(Frame::from_parts(
            version,
            message_type,
            header.id,
            header.timestamp,
            payload,
        ))
    }

    /// Iterate over the frames currently decodable.
    ///
    /// Stops at the first `NeedData`; a protocol error is yielded once and
    /// ends the iteration.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames {
            decoder: self,
            done: false,
        }
    }

    /// Append a chunk and collect every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        self.extend(chunk);
        self.frames().collect()
    }

    fn fail(&mut self, err: ProtocolError) -> DecodeResult {
        self.buffer.clear();
        self.failed = Some(err.clone());
        DecodeResult::Error(err)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`Decoder::frames`].
pub struct Frames<'a> {
    decoder: &'a mut Decoder,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.decoder.decode() {
            DecodeResult::Complete(frame) => Some(Ok(frame)),
            DecodeResult::NeedData => {
                self.done = true;
                None
            }
            DecodeResult::Error(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Encoder;
    use bytes::{BufMut, Bytes};

    fn header(magic: u16, version: u8, kind: u8, id: u64, ts: i64, length: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.put_u16(magic);
        buf.put_u8(version);
        buf.put_u8(kind);
        buf.put_u64(id);
        buf.put_i64(ts);
        buf.put_u32(length);
        buf
    }

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::new(MessageType::Normal, 1, 1_700_000_000_000, "Hello, world!").unwrap(),
            Frame::heartbeat(2, 1_700_000_000_001),
            Frame::new(MessageType::Normal, 3, -5, Bytes::new()).unwrap(),
            Frame::new(MessageType::Normal, u64::MAX, i64::MIN, vec![7u8; 300]).unwrap(),
            Frame::new(MessageType::Normal, 5, 0, "tail").unwrap(),
        ]
    }

    fn encode_all(frames: &[Frame]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for frame in frames {
            Encoder::encode(frame, &mut buf);
        }
        buf.to_vec()
    }

    #[test]
    fn test_hello_world_scenario() {
        let mut bytes = header(0x0040, 1, 1, 0, 0, 13);
        bytes.extend_from_slice(b"Hello, world!");

        let mut decoder = Decoder::new();
        decoder.extend(&bytes);
        match decoder.decode() {
            DecodeResult::Complete(frame) => {
                assert_eq!(frame.magic(), b'@' as u16);
                assert_eq!(frame.version(), Version::V1);
                assert_eq!(frame.message_type(), MessageType::Normal);
                assert_eq!(frame.length(), 13);
                assert_eq!(frame.payload().as_ref(), b"Hello, world!");
            }
            other => panic!("Expected Complete, got {other:?}"),
        }
        assert_eq!(decoder.buffered(), 0);
        assert!(matches!(decoder.decode(), DecodeResult::NeedData));
    }

    #[test]
    fn test_round_trip() {
        for frame in sample_frames() {
            let mut decoder = Decoder::new();
            let decoded = decoder.push(&Encoder::encode_to_bytes(&frame)).unwrap();
            assert_eq!(decoded, vec![frame]);
        }
    }

    #[test]
    fn test_zero_length_payload() {
        let mut decoder = Decoder::new();
        decoder.extend(&header(MAGIC, 1, 1, 77, 88, 0));
        match decoder.decode() {
            DecodeResult::Complete(frame) => {
                assert_eq!(frame.length(), 0);
                assert!(frame.payload().is_empty());
                assert_eq!(frame.id(), 77);
                assert_eq!(frame.timestamp(), 88);
            }
            other => panic!("Expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_short_header_needs_data() {
        let mut decoder = Decoder::new();
        decoder.extend(&header(MAGIC, 1, 1, 0, 0, 4)[..HEADER_SIZE - 1]);
        assert!(matches!(decoder.decode(), DecodeResult::NeedData));
        assert_eq!(decoder.buffered(), HEADER_SIZE - 1);
    }

    #[test]
    fn test_short_read_is_idempotent() {
        let frame = Frame::new(MessageType::Normal, 10, 20, "abcdef").unwrap();
        let bytes = Encoder::encode_to_bytes(&frame);
        let (head, last) = bytes.split_at(bytes.len() - 1);

        let mut decoder = Decoder::new();
        decoder.extend(head);
        for _ in 0..3 {
            assert!(matches!(decoder.decode(), DecodeResult::NeedData));
            assert_eq!(decoder.buffered(), head.len());
        }

        decoder.extend(last);
        assert_eq!(decoder.frames().collect::<Result<Vec<_>, _>>().unwrap(), vec![frame]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let frames = sample_frames();
        let stream = encode_all(&frames);

        let mut decoder = Decoder::new();
        let mut decoded = Vec::new();
        for byte in &stream {
            decoded.extend(decoder.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(decoded, frames);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_arbitrary_chunking() {
        let frames = sample_frames();
        let stream = encode_all(&frames);

        // Fixed chunk sizes from tiny to larger than the whole stream, plus
        // a varying pattern that straddles header and payload boundaries.
        let mut plans: Vec<Vec<usize>> = (1..=40).map(|n| vec![n]).collect();
        plans.push(vec![stream.len()]);
        plans.push(vec![3, 21, 1, 50, 2, 24, 7, 500]);
        plans.push(vec![HEADER_SIZE, 13, HEADER_SIZE + 1, 5]);

        for plan in plans {
            let mut decoder = Decoder::new();
            let mut decoded = Vec::new();
            let mut offset = 0;
            let mut step = 0;
            while offset < stream.len() {
                let size = plan[step % plan.len()];
                let end = (offset + size).min(stream.len());
                decoded.extend(decoder.push(&stream[offset..end]).unwrap());
                offset = end;
                step += 1;
            }
            assert_eq!(decoded, frames, "chunk plan {plan:?}");
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn test_several_frames_in_one_chunk() {
        let frames = sample_frames();
        let mut decoder = Decoder::new();
        assert_eq!(decoder.push(&encode_all(&frames)).unwrap(), frames);
    }

    #[test]
    fn test_length_above_max_rejected() {
        let mut decoder = Decoder::new();
        decoder.extend(&header(MAGIC, 1, 1, 0, 0, MAX_MESSAGE_SIZE + 1));
        match decoder.decode() {
            DecodeResult::Error(ProtocolError::MessageTooLarge { length, max }) => {
                assert_eq!(length, MAX_MESSAGE_SIZE as u64 + 1);
                assert_eq!(max, MAX_MESSAGE_SIZE);
            }
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_negative_length_rejected() {
        // A signed reader would see -1 here.
        let mut decoder = Decoder::new();
        decoder.extend(&header(MAGIC, 1, 1, 0, 0, u32::MAX));
        assert!(matches!(
            decoder.decode(),
            DecodeResult::Error(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_custom_max_is_checked_before_payload_arrives() {
        let mut decoder = Decoder::with_max_message_size(8);
        assert_eq!(decoder.max_message_size(), 8);
        let result = decoder.push(&header(MAGIC, 1, 1, 0, 0, 9));
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge { length: 9, max: 8 })));
    }

    #[test]
    fn test_max_is_clamped() {
        let decoder = Decoder::with_max_message_size(u32::MAX);
        assert_eq!(decoder.max_message_size(), MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut decoder = Decoder::new();
        let result = decoder.push(&header(MAGIC, 2, 1, 0, 0, 0));
        assert_eq!(result, Err(ProtocolError::UnknownVersion(2)));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut bytes = header(MAGIC, 1, 9, 0, 0, 2);
        bytes.extend_from_slice(b"hi");
        let mut decoder = Decoder::new();
        assert_eq!(decoder.push(&bytes), Err(ProtocolError::UnknownMessageType(9)));
    }

    #[test]
    fn test_unknown_type_waits_for_payload() {
        // Enum fields are validated once the frame is complete.
        let mut decoder = Decoder::new();
        decoder.extend(&header(MAGIC, 1, 9, 0, 0, 2));
        assert!(matches!(decoder.decode(), DecodeResult::NeedData));
        decoder.extend(b"hi");
        assert!(matches!(
            decoder.decode(),
            DecodeResult::Error(ProtocolError::UnknownMessageType(9))
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut decoder = Decoder::new();
        let result = decoder.push(&header(0x4040, 1, 1, 0, 0, 0));
        assert_eq!(result, Err(ProtocolError::BadMagic(0x4040)));
    }

    #[test]
    fn test_error_is_latched() {
        let good = Encoder::encode_to_bytes(&Frame::heartbeat(1, 1));
        let mut bytes = header(MAGIC, 3, 1, 0, 0, 0);
        bytes.extend_from_slice(&good);

        let mut decoder = Decoder::new();
        let mut frames = decoder.frames();
        assert!(frames.next().is_none());

        decoder.extend(&bytes);
        let results: Vec<_> = decoder.frames().collect();
        assert_eq!(results, vec![Err(ProtocolError::UnknownVersion(3))]);
        assert!(decoder.is_failed());
        assert_eq!(decoder.buffered(), 0);

        // Later bytes are never decoded.
        decoder.extend(&good);
        assert_eq!(decoder.buffered(), 0);
        assert!(matches!(
            decoder.decode(),
            DecodeResult::Error(ProtocolError::UnknownVersion(3))
        ));
    }

    #[test]
    fn test_frames_before_violation_are_emitted() {
        let good = Frame::new(MessageType::Normal, 1, 1, "ok").unwrap();
        let mut bytes = Encoder::encode_to_bytes(&good).to_vec();
        bytes.extend_from_slice(&header(MAGIC, 1, 1, 0, 0, MAX_MESSAGE_SIZE + 1));

        let mut decoder = Decoder::new();
        decoder.extend(&bytes);
        let results: Vec<_> = decoder.frames().collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], Ok(good));
        assert!(matches!(results[1], Err(ProtocolError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_consumed_bytes_are_released() {
        let frame = Frame::new(MessageType::Normal, 1, 1, vec![1u8; 1000]).unwrap();
        let bytes = Encoder::encode_to_bytes(&frame);

        let mut decoder = Decoder::new();
        for _ in 0..100 {
            decoder.extend(&bytes);
            decoder.extend(&bytes[..10]);
            assert_eq!(decoder.frames().count(), 1);
            assert_eq!(decoder.buffered(), 10);
            decoder.extend(&bytes[10..]);
            assert_eq!(decoder.frames().count(), 1);
            assert_eq!(decoder.buffered(), 0);
        }
    }
}
