//! Peer transport
//!
//! Newline-delimited JSON over persistent TCP connections. Every accepted or
//! dialed socket gets a reader task (one envelope per line, dispatched through
//! the router, reply written before the next read) and a writer task draining
//! the connection's send queue. Both tasks hold a permit from the worker pool,
//! which is sized to `max_connections`.
//!
//! Teardown is terminal. It removes the connection from the table exactly
//! once and publishes [`ConnectionEvent::Closed`]. Reconnection, when enabled
//! for an outbound slot, is a brand new connection.

mod connection;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

pub use connection::{Connection, ConnectionEvent, Direction};
use dashmap::DashMap;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore},
};
use tokio_util::sync::CancellationToken;
use tracing as log;
use tracing::Instrument;

use crate::{
    config::MeshConfig,
    error::{MeshError, MeshResult},
    metrics,
    peer_directory::SocketKey,
    protocol::{Envelope, RequestEnvelope},
    router::MessageRouter,
};

const EVENT_CAPACITY: usize = 256;

/// Best-effort fan-out of a request to every connected peer
pub trait Broadcaster: Send + Sync {
    /// Returns the number of connections the request was queued on.
    fn broadcast(&self, request: &RequestEnvelope) -> usize;
}

pub struct Transport {
    config: Arc<MeshConfig>,
    router: Arc<MessageRouter>,
    connections: DashMap<u64, Arc<Connection>>,
    next_id: AtomicU64,
    workers: Arc<Semaphore>,
    events: broadcast::Sender<ConnectionEvent>,
    dial_attempts: AtomicU64,
    shutdown: CancellationToken,
    weak_self: Weak<Transport>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("connections", &self.connections.len())
            .field("available_workers", &self.workers.available_permits())
            .field("dial_attempts", &self.dial_attempts())
            .finish()
    }
}

impl Transport {
    pub fn new(
        config: Arc<MeshConfig>,
        router: Arc<MessageRouter>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let workers = Arc::new(Semaphore::new(config.max_connections));
        Arc::new_cyclic(|weak_self| Self {
            config,
            router,
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            workers,
            events,
            dial_attempts: AtomicU64::new(0),
            shutdown,
            weak_self: weak_self.clone(),
        })
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Bind the peer listener without accepting yet.
    pub async fn bind(&self, port: u16) -> MeshResult<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let addr = listener.local_addr()?;
        log::info!("Peer listener bound on {}", addr);
        Ok((listener, addr))
    }

    /// Accept connections on a bound listener until shutdown.
    pub fn serve(&self, listener: TcpListener) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move { this.accept_loop(listener).await });
    }

    /// Bind and start accepting. Returns the bound address.
    pub async fn listen(&self, port: u16) -> MeshResult<SocketAddr> {
        let (listener, addr) = self.bind(port).await?;
        self.serve(listener);
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let permit = tokio::select! {
                permit = self.workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown.cancelled() => break,
            };

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        log::debug!("Accepted peer connection from {}", remote);
                        self.register(stream, remote, Direction::Inbound, None, permit);
                    }
                    Err(e) => log::warn!("Accept failed: {}", e),
                },
                _ = self.shutdown.cancelled() => break,
            }
        }
        log::info!("Peer listener stopped");
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// One dial attempt, no retry.
    pub async fn dial(&self, key: &SocketKey) -> MeshResult<Arc<Connection>> {
        let permit = self
            .workers
            .clone()
            .try_acquire_owned()
            .map_err(|_| MeshError::ConnectionLimit(self.config.max_connections))?;

        self.dial_attempts.fetch_add(1, Ordering::Relaxed);
        let connect = TcpStream::connect((key.host.as_str(), key.port));
        let stream = match tokio::time::timeout(self.config.connect_timeout(), connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                metrics::record_dial_attempt(false);
                return Err(e.into());
            }
            Err(_) => {
                metrics::record_dial_attempt(false);
                return Err(MeshError::ConnectTimeout(key.to_string()));
            }
        };
        metrics::record_dial_attempt(true);

        let remote = stream.peer_addr()?;
        Ok(self.register(stream, remote, Direction::Outbound, Some(key.clone()), permit))
    }

    /// Connect under the reconnect budget and keep the slot auto-reconnecting.
    /// Reuses an existing live connection to the same peer.
    pub async fn connect_to_peer(&self, key: &SocketKey) -> MeshResult<Arc<Connection>> {
        self.establish(key, true).await
    }

    /// Connect under the reconnect budget for a one-shot exchange.
    pub async fn connect_once(&self, key: &SocketKey) -> MeshResult<Arc<Connection>> {
        self.establish(key, false).await
    }

    async fn establish(&self, key: &SocketKey, auto_reconnect: bool) -> MeshResult<Arc<Connection>> {
        let attempts = self.config.reconnect_attempts;
        for attempt in 1..=attempts {
            if let Some(existing) = self.connection_for(key) {
                return Ok(existing);
            }
            if self.shutdown.is_cancelled() {
                return Err(MeshError::NotConnected(key.to_string()));
            }

            match self.dial(key).await {
                Ok(conn) => {
                    conn.set_auto_reconnect(auto_reconnect);
                    log::debug!(peer = %key, attempt, "Connected to peer");
                    return Ok(conn);
                }
                Err(e @ MeshError::ConnectionLimit(_)) => return Err(e),
                Err(e) => {
                    log::debug!(peer = %key, attempt, attempts, "Dial failed: {}", e);
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                    _ = self.shutdown.cancelled() => {
                        return Err(MeshError::NotConnected(key.to_string()));
                    }
                }
            }
        }

        log::warn!(peer = %key, attempts, "Abandoning outbound slot, reconnect budget exhausted");
        Err(MeshError::ReconnectExhausted {
            peer: key.to_string(),
            attempts,
        })
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    fn register(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        direction: Direction,
        peer: Option<SocketKey>,
        permit: OwnedSemaphorePermit,
    ) -> Arc<Connection> {
        let _ = stream.set_nodelay(true);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let conn = Arc::new(Connection::new(
            id,
            direction,
            remote,
            tx,
            self.shutdown.child_token(),
        ));
        if let Some(key) = peer.clone() {
            conn.bind_peer(key);
        }
        self.connections.insert(id, conn.clone());

        metrics::record_connection_opened(direction);
        metrics::set_open_connections(self.connections.len());
        let _ = self.events.send(ConnectionEvent::Opened {
            id,
            direction,
            remote,
            peer,
        });

        let span = log::info_span!("connection", id, direction = %direction, remote = %remote);
        tokio::spawn(write_loop(conn.clone(), write_half, rx).instrument(span.clone()));
        if let Some(this) = self.weak_self.upgrade() {
            tokio::spawn(this.read_loop(conn.clone(), read_half, permit).instrument(span));
        }
        conn
    }

    async fn read_loop(
        self: Arc<Self>,
        conn: Arc<Connection>,
        read_half: OwnedReadHalf,
        _permit: OwnedSemaphorePermit,
    ) {
        log::debug!("Read loop started");
        let mut lines = BufReader::new(read_half).lines();
        let cancel = conn.cancel_token().clone();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = cancel.cancelled() => break,
            };

            match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    conn.touch();
                    let envelope = match Envelope::decode(&line) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            log::warn!("Closing connection: {}", e);
                            break;
                        }
                    };
                    log::trace!(action = envelope.action(), "Received envelope");
                    if let Some(reply) = self.router.dispatch(&conn, envelope) {
                        conn.send(&reply.into());
                    }
                }
                Ok(None) => {
                    log::debug!("Peer closed the connection");
                    break;
                }
                Err(e) => {
                    log::debug!("Read failed: {}", e);
                    break;
                }
            }
        }

        self.teardown(&conn);
    }

    /// Remove a connection and publish its closure. Safe to call more than
    /// once; only the first call has any effect.
    fn teardown(&self, conn: &Arc<Connection>) {
        if self.connections.remove(&conn.id()).is_none() {
            return;
        }
        conn.cancel_token().cancel();

        let peer = conn.peer();
        let closed_locally = conn.was_closed_locally();
        log::debug!(
            peer = ?peer,
            closed_locally,
            "Connection {} closed",
            conn.id()
        );
        metrics::record_connection_closed(conn.direction());
        metrics::set_open_connections(self.connections.len());
        let _ = self.events.send(ConnectionEvent::Closed {
            id: conn.id(),
            direction: conn.direction(),
            peer: peer.clone(),
            closed_locally,
        });

        let reconnect = conn.direction() == Direction::Outbound
            && conn.auto_reconnect()
            && !closed_locally
            && !self.shutdown.is_cancelled();
        if let (true, Some(key), Some(this)) = (reconnect, peer, self.weak_self.upgrade()) {
            log::info!(peer = %key, "Outbound connection lost, reconnecting");
            tokio::spawn(async move {
                if let Err(e) = this.connect_to_peer(&key).await {
                    log::debug!(peer = %key, "Reconnect gave up: {}", e);
                }
            });
        }
    }

    /// Close one connection from this side.
    pub fn close(&self, conn: &Arc<Connection>) {
        conn.close_locally();
        self.teardown(conn);
    }

    pub fn disconnect(&self, key: &SocketKey) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|entry| entry.value().peer().as_ref() == Some(key))
            .map(|entry| entry.value().clone())
            .collect();
        for conn in &targets {
            self.close(conn);
        }
        targets.len()
    }

    pub fn disconnect_all(&self) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in &targets {
            self.close(conn);
        }
        if !targets.is_empty() {
            log::info!("Closed {} connections", targets.len());
        }
        targets.len()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.disconnect_all();
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send a request on a specific connection and note its reply as
    /// outstanding.
    pub fn send_request_on(&self, conn: &Arc<Connection>, request: RequestEnvelope) -> bool {
        if conn.is_closed() {
            return false;
        }
        // noted before queueing so a fast reply always finds its entry
        self.router.note_request_sent(&request, 1);
        conn.send(&request.into())
    }

    /// Send to a peer over any live connection. No-op when not connected.
    pub fn send(&self, key: &SocketKey, envelope: &Envelope) -> bool {
        match self.connection_for(key) {
            Some(conn) => conn.send(envelope),
            None => {
                log::debug!(peer = %key, action = envelope.action(), "Not connected, dropping send");
                false
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn connection_for(&self, key: &SocketKey) -> Option<Arc<Connection>> {
        self.connections
            .iter()
            .find(|entry| !entry.value().is_closed() && entry.value().peer().as_ref() == Some(key))
            .map(|entry| entry.value().clone())
    }

    pub fn is_connected(&self, key: &SocketKey) -> bool {
        self.connection_for(key).is_some()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connected_peers(&self) -> Vec<SocketKey> {
        let mut peers: Vec<SocketKey> = self
            .connections
            .iter()
            .filter_map(|entry| entry.value().peer())
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn dial_attempts(&self) -> u64 {
        self.dial_attempts.load(Ordering::Relaxed)
    }
}

impl Broadcaster for Transport {
    fn broadcast(&self, request: &RequestEnvelope) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .connections()
            .into_iter()
            .filter(|conn| !conn.is_closed())
            .collect();
        self.router.note_request_sent(request, targets.len());
        let envelope = Envelope::Request(request.clone());
        let sent = targets
            .iter()
            .filter(|conn| conn.send(&envelope))
            .count();
        log::trace!(action = %request.action, sent, "Broadcast request");
        sent
    }
}

async fn write_loop(
    conn: Arc<Connection>,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    let cancel = conn.cancel_token().clone();
    loop {
        tokio::select! {
            biased;
            line = rx.recv() => {
                let Some(line) = line else { break };
                if let Err(e) = write_line(&mut write_half, &line).await {
                    log::debug!("Write failed: {}", e);
                    cancel.cancel();
                    break;
                }
            }
            _ = cancel.cancelled() => {
                // flush what was queued before the close
                while let Ok(line) = rx.try_recv() {
                    if write_line(&mut write_half, &line).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = write_half.shutdown().await;
}

async fn write_line(write_half: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    write_half.write_all(line.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    write_half.flush().await
}
