//! Registry of active connections.
//!
//! The registry is the only structure shared between connection tasks.
//! Each member is reachable through its outbound queue, which the owning
//! task drains in order; nothing else ever writes to a connection's socket.

use crate::protocol::Frame;
use slab::Slab;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Default number of frames that may wait in a connection's outbound queue.
pub const OUTBOUND_QUEUE_SIZE: usize = 128;

/// Identifier of a registered connection.
///
/// Identifiers are reused once a connection has been removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(usize);

impl ConnectionId {
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending side of a connection's command channels.
///
/// Frames go through a bounded queue that the connection task drains in
/// order. A close request bypasses the queue so it reaches a task that is
/// stuck writing to a peer that no longer reads.
#[derive(Debug, Clone)]
pub struct Outbound {
    frames: mpsc::Sender<Frame>,
    close: Arc<Notify>,
}

impl Outbound {
    /// Queue a frame without waiting.
    ///
    /// Returns `false` if the queue is full or the task has gone away.
    pub fn try_send(&self, frame: Frame) -> bool {
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Outbound queue full, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the task to close. Frames still queued are discarded.
    pub fn close(&self) -> bool {
        if self.frames.is_closed() {
            return false;
        }
        self.close.notify_one();
        true
    }
}

/// Receiving side, owned by the connection task.
#[derive(Debug)]
pub struct Inbox {
    pub(crate) frames: mpsc::Receiver<Frame>,
    pub(crate) close: Arc<Notify>,
}

/// Create the command channels for one connection.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn outbound_queue(capacity: usize) -> (Outbound, Inbox) {
    let (tx, rx) = mpsc::channel(capacity);
    let close = Arc::new(Notify::new());
    (
        Outbound {
            frames: tx,
            close: Arc::clone(&close),
        },
        Inbox { frames: rx, close },
    )
}

struct Member {
    peer: SocketAddr,
    outbound: Outbound,
}

/// Thread-safe set of active connections.
pub struct ConnectionRegistry {
    members: Mutex<Slab<Member>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a registry with room for `capacity` connections before it
    /// needs to grow.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            members: Mutex::new(Slab::with_capacity(capacity)),
        }
    }

    // A panic while holding the lock leaves the slab itself intact.
    fn lock(&self) -> MutexGuard<'_, Slab<Member>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection and its outbound queue.
    pub fn add(&self, peer: SocketAddr, outbound: Outbound) -> ConnectionId {
        let id = ConnectionId(self.lock().insert(Member { peer, outbound }));
        trace!(conn_id = %id, peer = %peer, "Registered connection");
        id
    }

    /// Remove a connection.
    ///
    /// Returns `false` if it was not registered.
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.lock().try_remove(id.0).is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains(id.0)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Peer address of a registered connection.
    pub fn peer(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.lock().get(id.0).map(|m| m.peer)
    }

    /// Visit every member, in no particular order.
    ///
    /// The callback runs on a snapshot taken under the lock, so it may call
    /// back into the registry.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(ConnectionId, SocketAddr),
    {
        let snapshot: Vec<(usize, SocketAddr)> =
            self.lock().iter().map(|(key, m)| (key, m.peer)).collect();
        for (key, peer) in snapshot {
            f(ConnectionId(key), peer);
        }
    }

    /// Queue a frame for one connection.
    ///
    /// Returns `false` if the connection is unknown or its queue is full.
    pub fn send(&self, id: ConnectionId, frame: Frame) -> bool {
        match self.lock().get(id.0) {
            Some(member) => member.outbound.try_send(frame),
            None => false,
        }
    }

    /// Queue a frame for every connection.
    ///
    /// Returns how many connections accepted it. Members whose queue is
    /// full are skipped.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        self.lock()
            .iter()
            .filter(|(_, m)| m.outbound.try_send(frame.clone()))
            .count()
    }

    /// Ask a connection to close.
    pub fn close(&self, id: ConnectionId) -> bool {
        match self.lock().get(id.0) {
            Some(member) => member.outbound.close(),
            None => false,
        }
    }

    /// Ask every connection to close.
    pub fn close_all(&self) -> usize {
        self.lock()
            .iter()
            .filter(|(_, m)| m.outbound.close())
            .count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use std::thread;
    use tokio::sync::mpsc::error::TryRecvError;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn member() -> (Outbound, Inbox) {
        outbound_queue(OUTBOUND_QUEUE_SIZE)
    }

    #[test]
    fn test_add_remove() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());

        let (tx1, _rx1) = member();
        let (tx2, _rx2) = member();
        let id1 = registry.add(peer(1000), tx1);
        let id2 = registry.add(peer(1001), tx2);

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(id1));
        assert_eq!(registry.peer(id2), Some(peer(1001)));

        assert!(registry.remove(id1));
        assert!(!registry.remove(id1));
        assert!(!registry.contains(id1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_accounting() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 50;
        const REMOVED_PER_THREAD: usize = 20;

        let registry = Arc::new(ConnectionRegistry::new());

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let ids: Vec<_> = (0..PER_THREAD)
                        .map(|i| registry.add(peer((t * PER_THREAD + i) as u16), member().0))
                        .collect();
                    for id in ids.into_iter().take(REMOVED_PER_THREAD) {
                        assert!(registry.remove(id));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            registry.len(),
            THREADS * PER_THREAD - THREADS * REMOVED_PER_THREAD
        );
    }

    #[test]
    fn test_for_each_visits_all() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = member();
        let (tx2, _rx2) = member();
        registry.add(peer(1), tx1);
        registry.add(peer(2), tx2);

        let mut ports: Vec<u16> = Vec::new();
        registry.for_each(|_, addr| ports.push(addr.port()));
        ports.sort_unstable();
        assert_eq!(ports, vec![1, 2]);
    }

    #[test]
    fn test_for_each_can_reenter() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = member();
        registry.add(peer(1), tx);

        registry.for_each(|id, _| {
            assert!(registry.remove(id));
        });
        assert!(registry.is_empty());
    }

    #[test]
    fn test_broadcast_and_send() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = member();
        let (tx2, rx2) = member();
        let id1 = registry.add(peer(1), tx1);
        registry.add(peer(2), tx2);

        // A member whose task has gone away no longer accepts commands.
        drop(rx2);

        let frame = Frame::new(MessageType::Normal, 1, 0, "all").unwrap();
        assert_eq!(registry.broadcast(&frame), 1);
        assert_eq!(rx1.frames.try_recv(), Ok(frame));

        assert!(registry.send(id1, Frame::heartbeat(2, 0)));
        assert_eq!(rx1.frames.try_recv(), Ok(Frame::heartbeat(2, 0)));
        assert_eq!(rx1.frames.try_recv(), Err(TryRecvError::Empty));

        registry.remove(id1);
        assert!(!registry.send(id1, Frame::heartbeat(3, 0)));
    }

    #[test]
    fn test_full_queue_stops_accepting() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = outbound_queue(4);
        let id = registry.add(peer(1), tx);

        let accepted = (0..100)
            .map(|i| registry.broadcast(&Frame::heartbeat(i, 0)))
            .sum::<usize>();
        assert_eq!(accepted, 4);
        assert!(!registry.send(id, Frame::heartbeat(100, 0)));

        // Draining makes room again.
        assert_eq!(rx.frames.try_recv().map(|f| f.id()), Ok(0));
        assert!(registry.send(id, Frame::heartbeat(101, 0)));
    }

    #[tokio::test]
    async fn test_close_bypasses_full_queue() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = outbound_queue(1);
        let id = registry.add(peer(1), tx);
        assert_eq!(registry.broadcast(&Frame::heartbeat(1, 0)), 1);
        assert_eq!(registry.broadcast(&Frame::heartbeat(2, 0)), 0);

        assert!(registry.close(id));
        rx.close.notified().await;

        assert_eq!(registry.close_all(), 1);
        rx.close.notified().await;

        drop(rx);
        assert!(!registry.close(id));
        registry.remove(id);
        assert!(!registry.close(id));
    }
}
