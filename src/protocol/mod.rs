//! Wire protocol: frame definition, stream decoder and encoder.
//!
//! Every message is a 24-byte big-endian header followed by the payload:
//!
//! ```text
//! ┌───────┬─────────┬──────┬──────┬───────────┬────────┬─────────┐
//! │ magic │ version │ type │  id  │ timestamp │ length │ payload │
//! │  2    │    1    │  1   │  8   │     8     │   4    │ length  │
//! └───────┴─────────┴──────┴──────┴───────────┴────────┴─────────┘
//! ```

pub mod decoder;
pub mod encoder;
pub mod frame;

pub use decoder::{DecodeResult, Decoder};
pub use encoder::Encoder;
pub use frame::{Frame, MessageType, ProtocolError, Version, HEADER_SIZE, MAGIC, MAX_MESSAGE_SIZE};
