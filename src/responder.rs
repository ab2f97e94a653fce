//! Application-level message handling.
//!
//! A [`Responder`] sees every validated `Normal` frame of every connection
//! and may answer it. It is shared by all connection tasks, so per-connection
//! state does not belong here.

use crate::liveness::IdleEvent;
use crate::protocol::{Frame, MessageType, ProtocolError};
use crate::registry::ConnectionId;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

/// Error returned by a responder.
#[derive(Debug, Error)]
pub enum ResponderError {
    /// The message broke the protocol; the connection is closed.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// Processing failed; the connection stays open and nothing is sent.
    #[error("application error: {0}")]
    Application(Box<dyn std::error::Error + Send + Sync>),
}

impl ResponderError {
    pub fn application<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        ResponderError::Application(err.into())
    }
}

/// What to do about an idle connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    Ignore,
    Heartbeat,
    Close,
}

/// Application callbacks invoked by connection handlers.
pub trait Responder: Send + Sync + 'static {
    /// Handle one decoded frame. `Ok(Some(frame))` is written back to the
    /// sender.
    ///
    /// A panic is caught by the connection handler and treated like a
    /// [`ResponderError::Application`] error.
    fn on_message(&self, conn: ConnectionId, frame: Frame) -> Result<Option<Frame>, ResponderError>;

    /// Decide what happens to an idle connection. Only consulted when the
    /// idle policy delegates to the responder.
    fn on_idle(&self, conn: ConnectionId, event: IdleEvent) -> IdleAction {
        let _ = (conn, event);
        IdleAction::Ignore
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Answers every message with a fixed payload.
pub struct ReplyResponder {
    reply: Bytes,
}

impl ReplyResponder {
    pub fn new(reply: impl Into<Bytes>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

impl Default for ReplyResponder {
    fn default() -> Self {
        Self::new(&b"Response"[..])
    }
}

impl Responder for ReplyResponder {
    fn on_message(&self, conn: ConnectionId, frame: Frame) -> Result<Option<Frame>, ResponderError> {
        debug!(
            conn_id = %conn,
            id = frame.id(),
            length = frame.length(),
            payload = %String::from_utf8_lossy(frame.payload()),
            "Received message"
        );
        let reply = Frame::new(MessageType::Normal, frame.id(), now_millis(), self.reply.clone())?;
        Ok(Some(reply))
    }
}

/// Sends every payload back to its sender.
pub struct EchoResponder;

impl Responder for EchoResponder {
    fn on_message(&self, conn: ConnectionId, frame: Frame) -> Result<Option<Frame>, ResponderError> {
        debug!(conn_id = %conn, id = frame.id(), length = frame.length(), "Echoing message");
        let id = frame.id();
        let reply = Frame::new(MessageType::Normal, id, now_millis(), frame.into_payload())?;
        Ok(Some(reply))
    }
}
