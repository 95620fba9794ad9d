//! The node event loop and application boundary.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use murk_core::{KeyPair, NodeId};
use murk_dht::{DhtConfig, DhtService};
use murk_proto::{Frame, Packet};
use murk_session::{Session, SessionConfig, SessionError};
use murk_stream::{StreamConfig, StreamConnection, StreamError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::socket::DatagramSocket;
use crate::{HANDSHAKE_RETRY_SECS, MAX_DATAGRAM_SIZE, MAX_HANDSHAKE_ATTEMPTS, TICK_INTERVAL_MS};

/// Identifies one connection at the application boundary.
pub type ConnectionHandle = u64;

/// Node errors surfaced to the application.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stream transport failure
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Session failure
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// No connection with that handle
    #[error("Unknown connection handle: {0}")]
    UnknownConnection(ConnectionHandle),

    /// The node task is gone
    #[error("Node shut down")]
    ChannelClosed,
}

/// Why a connection ended, as reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close from either side
    Normal,
    /// Retransmissions or the session timer gave up on the peer
    Timeout,
    /// The handshake never completed
    HandshakeFailed,
}

/// Events delivered to the application.
#[derive(Debug)]
pub enum NodeEvent {
    /// Reassembled application data arrived on a connection.
    Data {
        /// Which connection
        handle: ConnectionHandle,
        /// The delivered bytes, in order
        bytes: Vec<u8>,
    },
    /// A connection ended.
    ConnectionClosed {
        /// Which connection
        handle: ConnectionHandle,
        /// Why it ended
        reason: CloseReason,
    },
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Event loop tick interval
    pub tick_interval: Duration,
    /// Delay between handshake retries
    pub handshake_retry: Duration,
    /// Handshake attempts before giving up
    pub max_handshake_attempts: u32,
    /// Session layer configuration
    pub session: SessionConfig,
    /// Stream layer configuration
    pub stream: StreamConfig,
    /// DHT configuration
    pub dht: DhtConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(TICK_INTERVAL_MS),
            handshake_retry: Duration::from_secs(HANDSHAKE_RETRY_SECS),
            max_handshake_attempts: MAX_HANDSHAKE_ATTEMPTS,
            session: SessionConfig::default(),
            stream: StreamConfig::default(),
            dht: DhtConfig::default(),
        }
    }
}

enum Command {
    Connect {
        peer: NodeId,
        addr: Option<SocketAddr>,
        reply: oneshot::Sender<ConnectionHandle>,
    },
    Send {
        handle: ConnectionHandle,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    Close {
        handle: ConnectionHandle,
    },
    Bootstrap {
        node_id: NodeId,
        addr: SocketAddr,
    },
    Shutdown,
}

/// The application's handle to a running node.
pub struct NodeHandle {
    local_id: NodeId,
    commands: mpsc::Sender<Command>,
    events: mpsc::Receiver<NodeEvent>,
    task: JoinHandle<()>,
}

impl NodeHandle {
    /// Returns the node's identity.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Opens a connection toward a peer.
    ///
    /// With an address hint the handshake starts immediately; without one
    /// the node first resolves the peer through a DHT lookup.
    pub async fn connect(
        &self,
        peer: NodeId,
        addr: Option<SocketAddr>,
    ) -> Result<ConnectionHandle, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { peer, addr, reply })
            .await
            .map_err(|_| NodeError::ChannelClosed)?;
        rx.await.map_err(|_| NodeError::ChannelClosed)
    }

    /// Sends bytes reliably on a connection.
    pub async fn send(
        &self,
        handle: ConnectionHandle,
        bytes: Vec<u8>,
    ) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                handle,
                bytes,
                reply,
            })
            .await
            .map_err(|_| NodeError::ChannelClosed)?;
        rx.await.map_err(|_| NodeError::ChannelClosed)?
    }

    /// Requests an orderly close of a connection.
    pub async fn close(&self, handle: ConnectionHandle) -> Result<(), NodeError> {
        self.commands
            .send(Command::Close { handle })
            .await
            .map_err(|_| NodeError::ChannelClosed)
    }

    /// Seeds the routing table from a known node and starts a self-lookup.
    pub async fn bootstrap(
        &self,
        node_id: NodeId,
        addr: SocketAddr,
    ) -> Result<(), NodeError> {
        self.commands
            .send(Command::Bootstrap { node_id, addr })
            .await
            .map_err(|_| NodeError::ChannelClosed)
    }

    /// Receives the next event; `None` once the node task has ended.
    pub async fn next_event(&mut self) -> Option<NodeEvent> {
        self.events.recv().await
    }

    /// Stops the node task.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        let _ = self.task.await;
    }
}

/// Node entry point.
pub struct Node;

impl Node {
    /// Spawns the event loop over the given socket and returns the
    /// application handle.
    pub fn spawn<S: DatagramSocket>(
        keypair: KeyPair,
        socket: S,
        config: NodeConfig,
    ) -> NodeHandle {
        let local_id = keypair.public;
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);

        let inner = NodeInner {
            socket: Arc::new(socket),
            dht: DhtService::new(keypair.clone(), config.dht.clone()),
            keypair,
            config,
            peers: HashMap::new(),
            by_node: HashMap::new(),
            by_addr: HashMap::new(),
            next_handle: 1,
            pending_lookups: HashMap::new(),
            events: event_tx,
        };
        let task = tokio::spawn(inner.run(command_rx));

        NodeHandle {
            local_id,
            commands: command_tx,
            events: event_rx,
            task,
        }
    }
}

struct Peer {
    handle: ConnectionHandle,
    node_id: NodeId,
    addr: Option<SocketAddr>,
    session: Session,
    stream: StreamConnection,
    handshake_attempts: u32,
    last_handshake_at: Option<Instant>,
    /// Messages queued until the session is established
    pending_sends: Vec<Vec<u8>>,
}

struct NodeInner<S: DatagramSocket> {
    socket: Arc<S>,
    keypair: KeyPair,
    config: NodeConfig,
    dht: DhtService,
    peers: HashMap<ConnectionHandle, Peer>,
    by_node: HashMap<NodeId, ConnectionHandle>,
    by_addr: HashMap<SocketAddr, ConnectionHandle>,
    next_handle: ConnectionHandle,
    /// Lookup target -> connection waiting on its result
    pending_lookups: HashMap<NodeId, ConnectionHandle>,
    events: mpsc::Sender<NodeEvent>,
}

impl<S: DatagramSocket> NodeInner<S> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let socket = Arc::clone(&self.socket);
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.on_command(command).await,
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.on_datagram(&buf[..len], from).await,
                        Err(error) => {
                            warn!(%error, "Socket receive failed");
                        }
                    }
                }
                _ = tick.tick() => self.on_tick().await,
            }
        }
        debug!("Node event loop stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { peer, addr, reply } => {
                let handle = self.connect(peer, addr).await;
                let _ = reply.send(handle);
            }
            Command::Send {
                handle,
                bytes,
                reply,
            } => {
                let result = self.queue_send(handle, bytes);
                self.flush_peer(handle).await;
                let _ = reply.send(result);
            }
            Command::Close { handle } => {
                if let Some(peer) = self.peers.get_mut(&handle) {
                    peer.stream.close(Instant::now());
                }
                self.flush_peer(handle).await;
            }
            Command::Bootstrap { node_id, addr } => {
                let outbound = self.dht.bootstrap(node_id, addr);
                self.transmit_packets(outbound).await;
            }
            Command::Shutdown => {}
        }
    }

    async fn connect(&mut self, peer_id: NodeId, addr: Option<SocketAddr>) -> ConnectionHandle {
        if let Some(handle) = self.by_node.get(&peer_id) {
            return *handle;
        }

        let addr = addr.or_else(|| self.dht.known_addr(&peer_id));
        let handle = self.insert_peer(peer_id, addr);
        match addr {
            Some(_) => self.start_handshake(handle).await,
            None => {
                debug!(peer = %peer_id, "Resolving peer through DHT lookup");
                self.pending_lookups.insert(peer_id, handle);
                let outbound = self.dht.start_lookup(peer_id);
                self.transmit_packets(outbound).await;
            }
        }
        handle
    }

    fn insert_peer(&mut self, node_id: NodeId, addr: Option<SocketAddr>) -> ConnectionHandle {
        let handle = self.next_handle;
        self.next_handle += 1;

        let peer = Peer {
            handle,
            node_id,
            addr,
            session: Session::new(self.keypair.clone(), node_id, self.config.session.clone()),
            stream: StreamConnection::new(self.config.stream.clone()),
            handshake_attempts: 0,
            last_handshake_at: None,
            pending_sends: Vec::new(),
        };
        self.by_node.insert(node_id, handle);
        if let Some(addr) = addr {
            self.by_addr.insert(addr, handle);
        }
        self.peers.insert(handle, peer);
        handle
    }

    fn queue_send(&mut self, handle: ConnectionHandle, bytes: Vec<u8>) -> Result<(), NodeError> {
        let peer = self
            .peers
            .get_mut(&handle)
            .ok_or(NodeError::UnknownConnection(handle))?;
        if peer.session.is_established() {
            peer.stream.send(&bytes)?;
        } else {
            peer.pending_sends.push(bytes);
        }
        Ok(())
    }

    async fn start_handshake(&mut self, handle: ConnectionHandle) {
        let packet = match self.peers.get_mut(&handle) {
            Some(peer) => match (peer.addr, peer.session.initiate()) {
                (Some(addr), Ok(packet)) => {
                    peer.handshake_attempts += 1;
                    peer.last_handshake_at = Some(Instant::now());
                    Some((addr, packet))
                }
                _ => None,
            },
            None => None,
        };
        if let Some((addr, packet)) = packet {
            self.transmit(addr, &packet).await;
        }
    }

    async fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let packet = match Packet::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(error) => {
                trace!(%from, %error, "Dropping malformed datagram");
                return;
            }
        };

        match &packet {
            Packet::Dht { .. } => {
                let outbound = self.dht.handle_packet(&packet, from);
                self.transmit_packets(outbound).await;
            }
            Packet::Handshake { sender, .. } => {
                self.on_handshake(*sender, &packet, from).await;
            }
            Packet::Data { .. } => {
                self.on_data(&packet, from).await;
            }
        }
    }

    async fn on_handshake(&mut self, sender: NodeId, packet: &Packet, from: SocketAddr) {
        let handle = match self.by_node.get(&sender) {
            Some(handle) => *handle,
            // Unsolicited handshake: an incoming connection.
            None => self.insert_peer(sender, Some(from)),
        };

        let (reply, established) = match self.peers.get_mut(&handle) {
            Some(peer) => {
                // Learn or refresh the peer's address from the datagram.
                if peer.addr != Some(from) {
                    if let Some(old) = peer.addr {
                        self.by_addr.remove(&old);
                    }
                    peer.addr = Some(from);
                    self.by_addr.insert(from, handle);
                }
                let reply = peer.session.handle_handshake(packet);
                (reply, peer.session.is_established())
            }
            None => (None, false),
        };

        if let Some(reply) = reply {
            self.transmit(from, &reply).await;
        }
        if established {
            self.flush_pending_sends(handle);
            self.flush_peer(handle).await;
        }
    }

    async fn on_data(&mut self, packet: &Packet, from: SocketAddr) {
        let handle = match self.by_addr.get(&from) {
            Some(handle) => *handle,
            None => {
                trace!(%from, "Data from unknown address");
                return;
            }
        };

        let now = Instant::now();
        let mut delivered = Vec::new();
        if let Some(peer) = self.peers.get_mut(&handle) {
            let plaintext = match peer.session.decrypt(packet) {
                Ok(plaintext) => plaintext,
                Err(SessionError::Replayed(counter)) => {
                    trace!(counter, "Dropping replayed packet");
                    return;
                }
                Err(error) => {
                    trace!(%error, "Dropping undecryptable packet");
                    return;
                }
            };
            let frame = match Frame::from_bytes(&plaintext) {
                Ok(frame) => frame,
                Err(error) => {
                    trace!(%error, "Dropping malformed frame");
                    return;
                }
            };
            delivered = peer.stream.handle_frame(&frame, now);
        }

        for bytes in delivered {
            let _ = self.events.send(NodeEvent::Data { handle, bytes }).await;
        }
        self.flush_peer(handle).await;
    }

    async fn on_tick(&mut self) {
        let outbound = self.dht.tick();
        self.transmit_packets(outbound).await;
        self.resolve_lookups().await;
        self.drive_handshakes().await;

        let handles: Vec<ConnectionHandle> = self.peers.keys().copied().collect();
        for handle in handles {
            self.drive_peer(handle).await;
        }
    }

    /// Completed lookups unblock connections that were waiting on an address.
    async fn resolve_lookups(&mut self) {
        for (target, candidates) in self.dht.take_completed_lookups() {
            let handle = match self.pending_lookups.remove(&target) {
                Some(handle) => handle,
                None => continue,
            };
            let addr = candidates
                .iter()
                .find(|(node_id, _)| *node_id == target)
                .map(|(_, addr)| *addr)
                .or_else(|| self.dht.known_addr(&target));

            match addr {
                Some(addr) => {
                    if let Some(peer) = self.peers.get_mut(&handle) {
                        peer.addr = Some(addr);
                        self.by_addr.insert(addr, handle);
                    }
                    self.start_handshake(handle).await;
                }
                None => {
                    debug!(peer = %target, "Lookup finished without finding the peer");
                    self.close_peer(handle, CloseReason::HandshakeFailed).await;
                }
            }
        }
    }

    async fn drive_handshakes(&mut self) {
        let now = Instant::now();
        let mut retries = Vec::new();
        let mut failures = Vec::new();

        for peer in self.peers.values() {
            if peer.session.is_established() || peer.last_handshake_at.is_none() {
                continue;
            }
            let due = peer
                .last_handshake_at
                .map(|at| now.duration_since(at) >= self.config.handshake_retry)
                .unwrap_or(false);
            if !due {
                continue;
            }
            if peer.handshake_attempts >= self.config.max_handshake_attempts {
                failures.push(peer.handle);
            } else {
                retries.push(peer.handle);
            }
        }

        for handle in retries {
            self.start_handshake(handle).await;
        }
        for handle in failures {
            debug!(handle, "Handshake gave up");
            self.close_peer(handle, CloseReason::HandshakeFailed).await;
        }
    }

    /// Per-peer timer work: session expiry, stream retransmission and acks,
    /// close-linger completion.
    async fn drive_peer(&mut self, handle: ConnectionHandle) {
        let now = Instant::now();

        let expired = self
            .peers
            .get_mut(&handle)
            .map(|peer| peer.session.check_timeout())
            .unwrap_or(false);
        if expired {
            self.close_peer(handle, CloseReason::Timeout).await;
            return;
        }

        self.flush_peer(handle).await;

        let finished = self
            .peers
            .get_mut(&handle)
            .and_then(|peer| peer.stream.poll_close(now));
        if let Some(reason) = finished {
            let reason = match reason {
                murk_stream::CloseReason::Normal => CloseReason::Normal,
                murk_stream::CloseReason::Timeout => CloseReason::Timeout,
            };
            self.close_peer(handle, reason).await;
        }
    }

    fn flush_pending_sends(&mut self, handle: ConnectionHandle) {
        if let Some(peer) = self.peers.get_mut(&handle) {
            let pending = std::mem::take(&mut peer.pending_sends);
            for bytes in pending {
                if let Err(error) = peer.stream.send(&bytes) {
                    warn!(handle, %error, "Dropping queued message");
                }
            }
        }
    }

    /// Encrypts and transmits whatever frames the peer's stream has ready.
    async fn flush_peer(&mut self, handle: ConnectionHandle) {
        let now = Instant::now();
        let mut datagrams = Vec::new();

        if let Some(peer) = self.peers.get_mut(&handle) {
            if !peer.session.is_established() {
                return;
            }
            let addr = match peer.addr {
                Some(addr) => addr,
                None => return,
            };
            for frame in peer.stream.poll_transmit(now) {
                match peer.session.encrypt(&frame.to_bytes()) {
                    Ok(packet) => datagrams.push((addr, packet)),
                    Err(error) => {
                        trace!(handle, %error, "Frame not sent");
                        break;
                    }
                }
            }
        }

        for (addr, packet) in &datagrams {
            self.transmit(*addr, packet).await;
        }
    }

    async fn close_peer(&mut self, handle: ConnectionHandle, reason: CloseReason) {
        if let Some(mut peer) = self.peers.remove(&handle) {
            peer.session.close();
            self.by_node.remove(&peer.node_id);
            if let Some(addr) = peer.addr {
                self.by_addr.remove(&addr);
            }
            let _ = self
                .events
                .send(NodeEvent::ConnectionClosed { handle, reason })
                .await;
        }
    }

    async fn transmit_packets(&self, packets: Vec<(SocketAddr, Packet)>) {
        for (addr, packet) in &packets {
            self.transmit(*addr, packet).await;
        }
    }

    async fn transmit(&self, addr: SocketAddr, packet: &Packet) {
        let bytes = packet.to_bytes();
        if let Err(error) = self.socket.send_to(&bytes, addr).await {
            warn!(%addr, %error, "Datagram send failed");
        }
    }
}
