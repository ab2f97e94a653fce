//! easywire: a length-prefixed binary message server over TCP.
//!
//! Frames carry a fixed 24-byte header followed by an opaque payload. The
//! server decodes frames from each connection, hands `Normal` messages to a
//! [`Responder`](responder::Responder), answers heartbeats, and watches every
//! connection for inactivity. [`Client`](client::Client) speaks the same
//! protocol from the other side.

pub mod client;
pub mod config;
pub mod handler;
pub mod liveness;
pub mod protocol;
pub mod registry;
pub mod responder;
pub mod server;
