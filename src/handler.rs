//! Per-connection handler.
//!
//! One handler drives one connection from accept to close:
//!
//! ```text
//! Connecting ──► Active ──► Closing ──► Closed
//! ```
//!
//! While active it reads into the frame decoder, dispatches decoded frames,
//! writes replies and queued frames, and reacts to idle events. Every exit
//! path (peer EOF, I/O error, protocol violation, idle close, close request)
//! runs the same teardown exactly once.
//!
//! A write to a peer that stops reading may never complete. Pending writes
//! keep watching the idle deadlines and the close signal, so such a
//! connection can still be closed.

use crate::liveness::{IdleConfig, IdleEvent, IdleState, LivenessMonitor};
use crate::protocol::{DecodeResult, Decoder, Encoder, Frame, MessageType, ProtocolError, MAX_MESSAGE_SIZE};
use crate::registry::{outbound_queue, ConnectionId, ConnectionRegistry, Inbox, Outbound, OUTBOUND_QUEUE_SIZE};
use crate::responder::{now_millis, IdleAction, Responder, ResponderError};
use bytes::BytesMut;
use clap::ValueEnum;
use serde::Deserialize;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// What the handler does when the liveness monitor reports idleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IdlePolicy {
    /// Log the event and keep the connection.
    Ignore,
    /// Send a heartbeat frame to the peer.
    Heartbeat,
    /// Close the connection.
    Close,
    /// Ask the responder.
    Delegate,
}

/// How incoming heartbeats are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatPolicy {
    /// Answer with a heartbeat carrying the same id.
    Reply,
    Ignore,
}

/// Settings shared by all connection handlers.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub max_message_size: u32,
    pub idle: IdleConfig,
    pub idle_policy: IdlePolicy,
    pub heartbeat: HeartbeatPolicy,
    /// Frames that may wait for a connection before senders are refused.
    pub outbound_queue: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            idle: IdleConfig::default(),
            idle_policy: IdlePolicy::Ignore,
            heartbeat: HeartbeatPolicy::Reply,
            outbound_queue: OUTBOUND_QUEUE_SIZE,
        }
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, not yet registered.
    Connecting,
    /// Registered and serving frames.
    Active,
    /// Tearing down.
    Closing,
    /// Terminal.
    Closed,
}

/// Why a connection ended.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed its end of the stream.
    PeerClosed,
    /// Reading or writing failed.
    Transport(io::Error),
    /// The peer sent an invalid frame.
    Protocol(ProtocolError),
    /// The responder flagged a message as a protocol violation.
    Responder(ProtocolError),
    /// Closed by the idle policy.
    Idle(IdleState),
    /// Closed on request through the registry.
    Requested,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::Transport(e) => write!(f, "transport error: {e}"),
            CloseReason::Protocol(e) => write!(f, "protocol violation: {e}"),
            CloseReason::Responder(e) => write!(f, "rejected by responder: {e}"),
            CloseReason::Idle(state) => write!(f, "idle ({state})"),
            CloseReason::Requested => write!(f, "close requested"),
        }
    }
}

/// Drives a single connection.
pub struct ConnectionHandler {
    peer: SocketAddr,
    state: ConnState,
    id: Option<ConnectionId>,
    registry: Arc<ConnectionRegistry>,
    responder: Arc<dyn Responder>,
    config: Arc<HandlerConfig>,
    decoder: Decoder,
    monitor: LivenessMonitor,
    write_buf: BytesMut,
    heartbeat_seq: u64,
}

impl ConnectionHandler {
    pub fn new(
        peer: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        responder: Arc<dyn Responder>,
        config: Arc<HandlerConfig>,
    ) -> Self {
        Self {
            peer,
            state: ConnState::Connecting,
            id: None,
            registry,
            responder,
            decoder: Decoder::with_max_message_size(config.max_message_size),
            monitor: LivenessMonitor::disabled(),
            write_buf: BytesMut::with_capacity(BUFFER_SIZE),
            heartbeat_seq: 0,
            config,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Serve the connection until it closes.
    pub async fn run<S>(mut self, stream: S) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outbound, mut inbox) = outbound_queue(self.config.outbound_queue.max(1));

        let id = self.activate(outbound);
        let reason = self.serve(id, &mut reader, &mut writer, &mut inbox).await;
        self.close(&reason);

        if let Err(e) = writer.shutdown().await {
            trace!(conn_id = %id, error = %e, "Shutdown failed");
        }
        reason
    }

    fn activate(&mut self, outbound: Outbound) -> ConnectionId {
        let id = self.registry.add(self.peer, outbound);
        self.id = Some(id);
        self.monitor = LivenessMonitor::new(self.config.idle, Instant::now());
        self.state = ConnState::Active;

        info!(
            conn_id = %id,
            peer = %self.peer,
            connections = self.registry.len(),
            "Client connected"
        );
        id
    }

    /// Unregister and stop idle tracking. Only the first call has an effect.
    fn close(&mut self, reason: &CloseReason) {
        if self.state != ConnState::Active {
            return;
        }
        self.state = ConnState::Closing;
        self.monitor.stop();
        let id = self.id.take();
        if let Some(id) = id {
            self.registry.remove(id);
        }
        self.state = ConnState::Closed;

        let conn_id = id.map(|id| id.as_usize());
        match reason {
            CloseReason::Protocol(_) | CloseReason::Responder(_) => {
                warn!(conn_id, peer = %self.peer, reason = %reason, "Dropping client");
            }
            CloseReason::Transport(_) => {
                debug!(conn_id, peer = %self.peer, reason = %reason, "Connection error");
            }
            _ => {}
        }
        info!(
            conn_id,
            peer = %self.peer,
            reason = %reason,
            connections = self.registry.len(),
            "Client disconnected"
        );
    }

    async fn serve<R, W>(
        &mut self,
        id: ConnectionId,
        reader: &mut R,
        writer: &mut W,
        inbox: &mut Inbox,
    ) -> CloseReason
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let buffer = self.decoder.buffer_mut();
            if buffer.capacity() - buffer.len() < BUFFER_SIZE / 4 {
                buffer.reserve(BUFFER_SIZE);
            }
            let deadline = self.monitor.next_deadline();

            tokio::select! {
                read = reader.read_buf(self.decoder.buffer_mut()) => match read {
                    Ok(0) => {
                        if self.decoder.buffered() > 0 {
                            debug!(
                                conn_id = %id,
                                discarded = self.decoder.buffered(),
                                "Peer closed mid-frame"
                            );
                        }
                        return CloseReason::PeerClosed;
                    }
                    Ok(n) => {
                        trace!(conn_id = %id, bytes = n, "Read");
                        self.monitor.record_read(Instant::now());
                        if let Err(reason) = self.process_frames(id, writer, inbox).await {
                            return reason;
                        }
                    }
                    Err(e) => return CloseReason::Transport(e),
                },

                frame = inbox.frames.recv() => match frame {
                    Some(frame) => {
                        if let Err(reason) = self.write_frame(id, writer, inbox, &frame).await {
                            return reason;
                        }
                    }
                    None => return CloseReason::Requested,
                },

                _ = inbox.close.notified() => return CloseReason::Requested,

                _ = sleep_until(deadline) => {
                    for event in self.monitor.poll_expired(Instant::now()) {
                        if let Err(reason) = self.on_idle(id, event, writer, inbox).await {
                            return reason;
                        }
                    }
                }
            }
        }
    }

    /// Dispatch every complete frame in the decoder.
    async fn process_frames<W>(&mut self, id: ConnectionId, writer: &mut W, inbox: &Inbox) -> Result<(), CloseReason>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            match self.decoder.decode() {
                DecodeResult::Complete(frame) => self.dispatch(id, frame, writer, inbox).await?,
                DecodeResult::NeedData => return Ok(()),
                DecodeResult::Error(e) => return Err(CloseReason::Protocol(e)),
            }
        }
    }

    async fn dispatch<W>(
        &mut self,
        id: ConnectionId,
        frame: Frame,
        writer: &mut W,
        inbox: &Inbox,
    ) -> Result<(), CloseReason>
    where
        W: AsyncWrite + Unpin,
    {
        trace!(conn_id = %id, frame = ?frame, "Received frame");

        let reply = match frame.message_type() {
            MessageType::Heartbeat => match self.config.heartbeat {
                HeartbeatPolicy::Reply => Some(Frame::heartbeat(frame.id(), now_millis())),
                HeartbeatPolicy::Ignore => None,
            },
            MessageType::Normal => match self.respond(id, frame) {
                Ok(reply) => reply,
                Err(ResponderError::Protocol(e)) => return Err(CloseReason::Responder(e)),
                Err(ResponderError::Application(e)) => {
                    warn!(conn_id = %id, error = %e, "Responder failed, no reply sent");
                    None
                }
            },
        };

        if let Some(reply) = reply {
            self.write_frame(id, writer, inbox, &reply).await?;
        }
        Ok(())
    }

    // A panicking responder is treated like one that returned an error.
    fn respond(&self, id: ConnectionId, frame: Frame) -> Result<Option<Frame>, ResponderError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.responder.on_message(id, frame)))
            .unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("unknown panic");
                Err(ResponderError::application(format!("responder panicked: {message}")))
            })
    }

    fn idle_action(&self, id: ConnectionId, event: IdleEvent) -> IdleAction {
        let action = match self.config.idle_policy {
            IdlePolicy::Ignore => IdleAction::Ignore,
            IdlePolicy::Heartbeat => IdleAction::Heartbeat,
            IdlePolicy::Close => IdleAction::Close,
            IdlePolicy::Delegate => self.responder.on_idle(id, event),
        };
        debug!(
            conn_id = %id,
            state = %event.state,
            first = event.first,
            action = ?action,
            "Connection idle"
        );
        action
    }

    async fn on_idle<W>(&mut self, id: ConnectionId, event: IdleEvent, writer: &mut W, inbox: &Inbox) -> Result<(), CloseReason>
    where
        W: AsyncWrite + Unpin,
    {
        match self.idle_action(id, event) {
            IdleAction::Ignore => Ok(()),
            IdleAction::Heartbeat => {
                self.heartbeat_seq += 1;
                let ping = Frame::heartbeat(self.heartbeat_seq, now_millis());
                self.write_frame(id, writer, inbox, &ping).await
            }
            IdleAction::Close => Err(CloseReason::Idle(event.state)),
        }
    }

    /// Write one frame. While the write is pending, idle deadlines keep
    /// firing and a close request aborts it.
    async fn write_frame<W>(
        &mut self,
        id: ConnectionId,
        writer: &mut W,
        inbox: &Inbox,
        frame: &Frame,
    ) -> Result<(), CloseReason>
    where
        W: AsyncWrite + Unpin,
    {
        self.write_buf.clear();
        Encoder::encode(frame, &mut self.write_buf);

        let buf = &self.write_buf;
        let write = async {
            writer.write_all(buf).await?;
            writer.flush().await
        };
        tokio::pin!(write);

        loop {
            let deadline = self.monitor.next_deadline();

            tokio::select! {
                written = &mut write => {
                    written.map_err(CloseReason::Transport)?;
                    break;
                }

                _ = inbox.close.notified() => return Err(CloseReason::Requested),

                _ = sleep_until(deadline) => {
                    for event in self.monitor.poll_expired(Instant::now()) {
                        match self.idle_action(id, event) {
                            IdleAction::Close => return Err(CloseReason::Idle(event.state)),
                            // The previous frame is still going out.
                            IdleAction::Heartbeat | IdleAction::Ignore => {
                                trace!(conn_id = %id, state = %event.state, "Write still pending");
                            }
                        }
                    }
                }
            }
        }

        self.monitor.record_write(Instant::now());
        Ok(())
    }
}

// A task cancelled mid-run never reaches `close`.
impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.registry.remove(id);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
