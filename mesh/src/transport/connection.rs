//! A single peer connection
//!
//! Owned by the transport. Writes go through an unbounded queue drained by
//! the connection's writer task, so `send` never blocks the caller and a dead
//! connection just drops the line.

use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{peer_directory::SocketKey, protocol::Envelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published by the transport on its event channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened {
        id: u64,
        direction: Direction,
        remote: SocketAddr,
        peer: Option<SocketKey>,
    },
    /// Emitted exactly once per connection
    Closed {
        id: u64,
        direction: Direction,
        peer: Option<SocketKey>,
        closed_locally: bool,
    },
}

pub struct Connection {
    id: u64,
    direction: Direction,
    remote_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<String>,
    authenticated: AtomicBool,
    peer: RwLock<Option<SocketKey>>,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
    closed_locally: AtomicBool,
    auto_reconnect: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("remote_addr", &self.remote_addr)
            .field("peer", &*self.peer.read())
            .field("authenticated", &self.is_authenticated())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        direction: Direction,
        remote_addr: SocketAddr,
        outbound: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            direction,
            remote_addr,
            outbound,
            authenticated: AtomicBool::new(false),
            peer: RwLock::new(None),
            last_activity: Mutex::new(Instant::now()),
            cancel,
            closed_locally: AtomicBool::new(false),
            auto_reconnect: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Resolved peer identity key, if known
    pub fn peer(&self) -> Option<SocketKey> {
        self.peer.read().clone()
    }

    pub fn bind_peer(&self, key: SocketKey) {
        let mut peer = self.peer.write();
        if peer.as_ref() != Some(&key) {
            debug!(conn = self.id, peer = %key, "Bound connection to peer");
            *peer = Some(key);
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Queue one envelope. Returns false when the connection is gone.
    pub fn send(&self, envelope: &Envelope) -> bool {
        let line = match envelope.encode() {
            Ok(line) => line,
            Err(e) => {
                warn!(conn = self.id, "Failed to encode envelope: {}", e);
                return false;
            }
        };
        if self.is_closed() || self.outbound.send(line).is_err() {
            debug!(conn = self.id, action = envelope.action(), "Dropping send on closed connection");
            return false;
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn close_locally(&self) {
        self.closed_locally.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    pub(crate) fn was_closed_locally(&self) -> bool {
        self.closed_locally.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::Release);
    }

    pub(crate) fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::Acquire)
    }

    /// A connection with no socket behind it. Lines sent on it arrive on the
    /// returned receiver.
    #[cfg(test)]
    pub(crate) fn detached() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<String>) {
        use std::sync::atomic::AtomicU64;

        static NEXT: AtomicU64 = AtomicU64::new(1_000_000);
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self::new(
            NEXT.fetch_add(1, Ordering::Relaxed),
            Direction::Inbound,
            SocketAddr::from(([127, 0, 0, 1], 0)),
            tx,
            CancellationToken::new(),
        );
        (std::sync::Arc::new(conn), rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Action, RequestEnvelope};

    #[test]
    fn test_send_queues_encoded_line() {
        let (conn, mut rx) = Connection::detached();
        assert!(conn.send(&RequestEnvelope::new(Action::CheckRoots, None).into()));

        let line = rx.try_recv().unwrap();
        assert_eq!(line, r#"{"action":"check-roots","payload":null}"#);
    }

    #[test]
    fn test_send_after_close_is_dropped() {
        let (conn, mut rx) = Connection::detached();
        conn.close_locally();
        assert!(conn.is_closed());
        assert!(conn.was_closed_locally());
        assert!(!conn.send(&RequestEnvelope::new(Action::Ping, None).into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_bind_peer() {
        let (conn, _rx) = Connection::detached();
        assert!(conn.peer().is_none());
        conn.bind_peer(SocketKey::new("10.0.0.2", 7000));
        assert_eq!(conn.peer().unwrap().to_string(), "10.0.0.2:7000");
        assert!(!conn.is_authenticated());
        conn.mark_authenticated();
        assert!(conn.is_authenticated());
    }

    #[test]
    fn test_touch_resets_idle_time() {
        let (conn, _rx) = Connection::detached();
        std::thread::sleep(Duration::from_millis(30));
        assert!(conn.idle_for() >= Duration::from_millis(30));

        conn.touch();
        assert!(conn.idle_for() < Duration::from_millis(30));
    }
}
