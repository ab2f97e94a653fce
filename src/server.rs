//! TCP server: listener setup and the accept loop.
//!
//! Each accepted connection gets its own task running a
//! [`ConnectionHandler`]; the server itself only owns the listener, the
//! connection limit and the shared registry.

use crate::config::{Config, ResponderKind};
use crate::handler::{ConnectionHandler, HandlerConfig};
use crate::registry::ConnectionRegistry;
use crate::responder::{EchoResponder, ReplyResponder, Responder};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<ConnectionRegistry>,
    responder: Arc<dyn Responder>,
    handler_config: Arc<HandlerConfig>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a server using the configured built-in responder.
    pub fn new(config: Config) -> Self {
        let responder: Arc<dyn Responder> = match config.responder {
            ResponderKind::Reply => Arc::new(ReplyResponder::new(config.reply_text.clone())),
            ResponderKind::Echo => Arc::new(EchoResponder),
        };
        Self::with_responder(config, responder)
    }

    /// Create a server with a custom responder.
    pub fn with_responder(config: Config, responder: Arc<dyn Responder>) -> Self {
        Server {
            registry: Arc::new(ConnectionRegistry::with_capacity(config.max_connections)),
            handler_config: Arc::new(config.handler.clone()),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            responder,
            config,
        }
    }

    /// The set of active connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Bind the listening socket.
    pub fn bind(self) -> io::Result<BoundServer> {
        let addr: SocketAddr = self
            .config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::from_std(create_listener(addr, self.config.backlog)?)?;

        info!(address = %listener.local_addr()?, "Server listening");
        Ok(BoundServer {
            server: self,
            listener,
        })
    }
}

/// A server with its listener bound.
pub struct BoundServer {
    server: Server,
    listener: TcpListener,
}

impl BoundServer {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.server.registry
    }

    /// Accept connections until `shutdown` completes, then ask every open
    /// connection to close.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.accept() => accepted?,
            }
        }

        let closing = self.server.registry.close_all();
        info!(connections = closing, "Server shutting down");
        Ok(())
    }

    async fn accept(&self) -> io::Result<()> {
        // Wait for a connection slot
        let permit = Arc::clone(&self.server.connection_limit)
            .acquire_owned()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        match self.listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "New connection");
                if let Err(e) = self.configure(&stream) {
                    warn!(peer = %peer, error = %e, "Failed to set socket options");
                }

                let handler = ConnectionHandler::new(
                    peer,
                    Arc::clone(&self.server.registry),
                    Arc::clone(&self.server.responder),
                    Arc::clone(&self.server.handler_config),
                );
                tokio::spawn(async move {
                    let reason = handler.run(stream).await;
                    debug!(peer = %peer, reason = %reason, "Connection task finished");
                    drop(permit);
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
        Ok(())
    }

    fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.server.config.nodelay)?;
        SockRef::from(stream).set_keepalive(self.server.config.keepalive)?;
        Ok(())
    }
}

/// Create a non-blocking listening socket with the given backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket.into())
}
