//! Client side of the protocol.
//!
//! A [`Client`] owns one stream, encodes outgoing frames and decodes replies
//! with the same codec the server uses. It is generic over the stream so it
//! also drives in-memory pipes.

use crate::protocol::{DecodeResult, Decoder, Encoder, Frame, MessageType, ProtocolError};
use crate::responder::now_millis;
use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A connection to an easywire server.
pub struct Client<S = TcpStream> {
    stream: S,
    decoder: Decoder,
    write_buf: BytesMut,
    next_id: u64,
}

impl Client<TcpStream> {
    /// Connect to a server with SO_KEEPALIVE enabled.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        SockRef::from(&stream).set_keepalive(true)?;
        info!(peer = %stream.peer_addr()?, "Connected to server");
        Ok(Self::new(stream))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            write_buf: BytesMut::new(),
            next_id: 0,
        }
    }

    /// The underlying stream, for writing raw bytes.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Encode and send a frame.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), ClientError> {
        self.write_buf.clear();
        Encoder::encode(frame, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        debug!(id = frame.id(), length = frame.length(), "Message sent");
        Ok(())
    }

    /// Send a `Normal` message with the next id and the current time.
    ///
    /// Returns the id it was sent with.
    pub async fn send_message(&mut self, payload: impl Into<Bytes>) -> Result<u64, ClientError> {
        let id = self.next_id;
        let frame = Frame::new(MessageType::Normal, id, now_millis(), payload)?;
        self.send(&frame).await?;
        self.next_id += 1;
        Ok(id)
    }

    /// Wait for the next frame. `None` once the server has closed the
    /// connection.
    pub async fn recv(&mut self) -> Result<Option<Frame>, ClientError> {
        loop {
            match self.decoder.decode() {
                DecodeResult::Complete(frame) => {
                    debug!(
                        id = frame.id(),
                        message_type = ?frame.message_type(),
                        payload = %String::from_utf8_lossy(frame.payload()),
                        "Received frame"
                    );
                    return Ok(Some(frame));
                }
                DecodeResult::Error(e) => {
                    warn!(error = %e, "Invalid frame from server");
                    return Err(e.into());
                }
                DecodeResult::NeedData => {}
            }

            if self.stream.read_buf(self.decoder.buffer_mut()).await? == 0 {
                info!(discarded = self.decoder.buffered(), "Disconnected from server");
                return Ok(None);
            }
        }
    }

    /// Shut down the write side and drop the connection.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
