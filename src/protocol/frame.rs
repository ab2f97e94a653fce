//! Frame definition and header field types.

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Protocol marker, the ASCII `'@'` written as a big-endian short.
pub const MAGIC: u16 = 0x0040;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 2 + 1 + 1 + 8 + 8 + 4;

/// Hard upper bound on a payload length (1 GiB).
pub const MAX_MESSAGE_SIZE: u32 = 1 << 30;

/// Protocol violations. Every variant is fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("bad magic 0x{0:04x}")]
    BadMagic(u16),

    #[error("unknown protocol version {0}")]
    UnknownVersion(u8),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("message length {length} exceeds maximum {max}")]
    MessageTooLarge { length: u64, max: u32 },
}

/// Protocol version tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Version {
    V1 = 1,
}

impl Version {
    pub const CURRENT: Version = Version::V1;

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Version {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Version::V1),
            other => Err(ProtocolError::UnknownVersion(other)),
        }
    }
}

/// Kind of message carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Keep-alive probe, never handed to the responder.
    Heartbeat = 0,
    /// Application data.
    Normal = 1,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Heartbeat),
            1 => Ok(MessageType::Normal),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// A complete application-level message.
///
/// The wire `length` field is not stored: it is always `payload.len()`,
/// and construction refuses payloads above [`MAX_MESSAGE_SIZE`].
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    version: Version,
    message_type: MessageType,
    id: u64,
    timestamp: i64,
    payload: Bytes,
}

impl Frame {
    /// Build a frame with the current protocol version.
    pub fn new(
        message_type: MessageType,
        id: u64,
        timestamp: i64,
        payload: impl Into<Bytes>,
    ) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        if payload.len() as u64 > MAX_MESSAGE_SIZE as u64 {
            return Err(ProtocolError::MessageTooLarge {
                length: payload.len() as u64,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(Self::from_parts(Version::CURRENT, message_type, id, timestamp, payload))
    }

    /// Build a heartbeat frame. Heartbeats carry no payload.
    pub fn heartbeat(id: u64, timestamp: i64) -> Self {
        Self::from_parts(Version::CURRENT, MessageType::Heartbeat, id, timestamp, Bytes::new())
    }

    /// Used by the decoder once the length bound has been checked.
    pub(crate) fn from_parts(
        version: Version,
        message_type: MessageType,
        id: u64,
        timestamp: i64,
        payload: Bytes,
    ) -> Self {
        Self {
            version,
            message_type,
            id,
            timestamp,
            payload,
        }
    }

    pub fn magic(&self) -> u16 {
        MAGIC
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Payload length as written in the header.
    pub fn length(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Take ownership of the payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Total encoded size (header + payload).
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

// Payloads can be large; show the length rather than the bytes.
impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("version", &self.version)
            .field("type", &self.message_type)
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("length", &self.payload.len())
            .finish()
    }
}
