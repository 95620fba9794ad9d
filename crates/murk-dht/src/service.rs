//! DHT service: query handling and periodic maintenance.
//!
//! The service owns the routing table and the in-flight lookups. It does no
//! I/O itself: handlers and `tick` return the packets to transmit, and the
//! node event loop owns the socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use murk_core::{
    derive_packet_key, open_xchacha20poly1305, seal_xchacha20poly1305, KeyPair, NodeId, NONCE_SIZE,
};
use murk_proto::{DhtBody, NodeAddr, Packet, PacketTag, MAX_NODES_PER_RESPONSE};
use tracing::{debug, trace};

use crate::lookup::{Candidate, Lookup, LookupStatus};
use crate::routing::{RoutingTable, RoutingTableConfig};
use crate::{DEFAULT_PING_TIMEOUT_SECS, MAX_PING_FAILURES};

/// A packet to transmit, with its destination.
pub type Outbound = (SocketAddr, Packet);

/// DHT service configuration.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Routing table configuration
    pub routing: RoutingTableConfig,
    /// Time before an unanswered ping counts as a failure
    pub ping_timeout: Duration,
    /// Time before an unanswered lookup query excludes the node
    pub query_timeout: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            routing: RoutingTableConfig::default(),
            ping_timeout: Duration::from_secs(DEFAULT_PING_TIMEOUT_SECS),
            query_timeout: Duration::from_secs(DEFAULT_PING_TIMEOUT_SECS),
        }
    }
}

struct PendingPing {
    node_id: NodeId,
    sent_at: Instant,
}

struct PendingQuery {
    node_id: NodeId,
    target: NodeId,
    sent_at: Instant,
}

/// The DHT service.
pub struct DhtService {
    local: KeyPair,
    table: RoutingTable,
    config: DhtConfig,
    /// Cached static-static packet keys per peer
    packet_keys: HashMap<NodeId, [u8; 32]>,
    pending_pings: HashMap<u64, PendingPing>,
    pending_queries: HashMap<u64, PendingQuery>,
    lookups: HashMap<NodeId, Lookup>,
    completed: Vec<(NodeId, Vec<Candidate>)>,
}

impl DhtService {
    /// Creates a new DHT service around the local identity.
    pub fn new(local: KeyPair, config: DhtConfig) -> Self {
        let table = RoutingTable::new(local.public, config.routing.clone());
        Self {
            local,
            table,
            config,
            packet_keys: HashMap::new(),
            pending_pings: HashMap::new(),
            pending_queries: HashMap::new(),
            lookups: HashMap::new(),
            completed: Vec::new(),
        }
    }

    /// Returns the local node ID.
    pub fn local_id(&self) -> &NodeId {
        self.table.local_id()
    }

    /// Returns the routing table.
    pub fn routing_table(&self) -> &RoutingTable {
        &self.table
    }

    /// Looks up a peer's last known address in the routing table.
    pub fn known_addr(&self, node_id: &NodeId) -> Option<SocketAddr> {
        self.table.get(node_id).map(|e| e.addr)
    }

    /// Seeds the routing table from a known node and starts a self-lookup
    /// to populate nearby buckets.
    pub fn bootstrap(&mut self, node_id: NodeId, addr: SocketAddr) -> Vec<Outbound> {
        self.table.insert(node_id, addr);
        self.start_lookup(*self.local_id())
    }

    /// Starts an iterative lookup for a target, returning its first queries.
    ///
    /// If a lookup for the target is already running this is a no-op.
    pub fn start_lookup(&mut self, target: NodeId) -> Vec<Outbound> {
        if self.lookups.contains_key(&target) {
            return Vec::new();
        }

        let seeds: Vec<Candidate> = self
            .table
            .find_closest(&target, self.table.config().bucket_size)
            .into_iter()
            .map(|e| (e.node_id, e.addr))
            .collect();

        let mut lookup = Lookup::new(target, seeds);
        let out = self.issue_queries(&mut lookup);
        if lookup.status() == LookupStatus::Complete {
            self.completed.push((target, lookup.result()));
        } else {
            self.lookups.insert(target, lookup);
        }
        out
    }

    /// Drains lookups that have converged since the last call.
    pub fn take_completed_lookups(&mut self) -> Vec<(NodeId, Vec<Candidate>)> {
        std::mem::take(&mut self.completed)
    }

    /// Handles an incoming DHT packet, returning any responses to send.
    ///
    /// Packets that fail to authenticate are dropped silently.
    pub fn handle_packet(&mut self, packet: &Packet, from: SocketAddr) -> Vec<Outbound> {
        let (tag, sender, nonce, sealed_body) = match packet {
            Packet::Dht {
                tag,
                sender,
                nonce,
                sealed_body,
            } => (*tag, *sender, nonce, sealed_body),
            _ => return Vec::new(),
        };

        if sender == *self.local_id() {
            return Vec::new();
        }

        let body = match self.open_body(tag, &sender, nonce, sealed_body) {
            Some(body) => body,
            None => {
                trace!(%sender, ?tag, "Dropping DHT packet that failed to authenticate");
                return Vec::new();
            }
        };

        // Any authentic packet proves liveness.
        self.table.insert(sender, from);
        self.table.touch(&sender);

        match body {
            DhtBody::Ping { ping_id } => {
                vec![(from, self.seal_body(&sender, DhtBody::Pong { ping_id }))]
            }
            DhtBody::Pong { ping_id } => {
                match self.pending_pings.remove(&ping_id) {
                    Some(pending) if pending.node_id == sender => {}
                    Some(pending) => {
                        // Echoed id from the wrong peer: restore and ignore.
                        self.pending_pings.insert(ping_id, pending);
                    }
                    None => debug!(%sender, ping_id, "Pong with unknown ping id"),
                }
                Vec::new()
            }
            DhtBody::FindNode { target, ping_id } => {
                let nodes: Vec<NodeAddr> = self
                    .table
                    .find_closest(&target, MAX_NODES_PER_RESPONSE)
                    .into_iter()
                    .filter(|e| e.node_id != sender)
                    .map(|e| NodeAddr {
                        node_id: e.node_id,
                        addr: e.addr,
                    })
                    .collect();
                vec![(from, self.seal_body(&sender, DhtBody::Nodes { nodes, ping_id }))]
            }
            DhtBody::Nodes { nodes, ping_id } => {
                let pending = match self.pending_queries.remove(&ping_id) {
                    Some(p) if p.node_id == sender => p,
                    Some(p) => {
                        self.pending_queries.insert(ping_id, p);
                        return Vec::new();
                    }
                    None => {
                        debug!(%sender, ping_id, "Nodes response with unknown ping id");
                        return Vec::new();
                    }
                };

                let local_id = *self.local_id();
                let candidates: Vec<Candidate> = nodes
                    .iter()
                    .filter(|n| n.node_id != local_id)
                    .map(|n| (n.node_id, n.addr))
                    .collect();

                let mut out = Vec::new();
                if let Some(mut lookup) = self.lookups.remove(&pending.target) {
                    lookup.on_response(&sender, &candidates);
                    if lookup.round_complete() {
                        out = self.issue_queries(&mut lookup);
                    }
                    if lookup.status() == LookupStatus::Complete {
                        self.completed.push((pending.target, lookup.result()));
                    } else {
                        self.lookups.insert(pending.target, lookup);
                    }
                }
                out
            }
        }
    }

    /// Periodic maintenance: liveness re-pings, ping/query timeouts, lookup
    /// progression, eviction of unresponsive nodes.
    pub fn tick(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        let now = Instant::now();

        // Expire unanswered pings; evict after too many consecutive misses.
        let expired_pings: Vec<u64> = self
            .pending_pings
            .iter()
            .filter(|(_, p)| now.duration_since(p.sent_at) > self.config.ping_timeout)
            .map(|(id, _)| *id)
            .collect();
        for ping_id in expired_pings {
            if let Some(pending) = self.pending_pings.remove(&ping_id) {
                if let Some(failures) = self.table.record_ping_failure(&pending.node_id) {
                    if failures >= MAX_PING_FAILURES {
                        debug!(node = %pending.node_id, failures, "Evicting unresponsive node");
                        self.table.remove(&pending.node_id);
                        self.packet_keys.remove(&pending.node_id);
                    }
                }
            }
        }

        // Expire unanswered lookup queries.
        let expired_queries: Vec<u64> = self
            .pending_queries
            .iter()
            .filter(|(_, q)| now.duration_since(q.sent_at) > self.config.query_timeout)
            .map(|(id, _)| *id)
            .collect();
        for ping_id in expired_queries {
            if let Some(pending) = self.pending_queries.remove(&ping_id) {
                if let Some(lookup) = self.lookups.get_mut(&pending.target) {
                    lookup.on_timeout(&pending.node_id);
                }
            }
        }

        // Progress lookups whose round has resolved.
        let targets: Vec<NodeId> = self.lookups.keys().copied().collect();
        for target in targets {
            if let Some(mut lookup) = self.lookups.remove(&target) {
                if lookup.round_complete() {
                    out.extend(self.issue_queries(&mut lookup));
                }
                if lookup.status() == LookupStatus::Complete {
                    self.completed.push((target, lookup.result()));
                } else {
                    self.lookups.insert(target, lookup);
                }
            }
        }

        // Re-ping quiet nodes.
        for entry in self.table.nodes_needing_ping() {
            let ping_id = rand::random::<u64>();
            self.table.mark_pinged(&entry.node_id);
            self.pending_pings.insert(
                ping_id,
                PendingPing {
                    node_id: entry.node_id,
                    sent_at: now,
                },
            );
            out.push((
                entry.addr,
                self.seal_body(&entry.node_id, DhtBody::Ping { ping_id }),
            ));
        }

        out
    }

    fn issue_queries(&mut self, lookup: &mut Lookup) -> Vec<Outbound> {
        let target = *lookup.target();
        let mut out = Vec::new();
        for (node_id, addr) in lookup.next_batch() {
            let ping_id = rand::random::<u64>();
            self.pending_queries.insert(
                ping_id,
                PendingQuery {
                    node_id,
                    target,
                    sent_at: Instant::now(),
                },
            );
            out.push((
                addr,
                self.seal_body(&node_id, DhtBody::FindNode { target, ping_id }),
            ));
        }
        out
    }

    fn packet_key(&mut self, peer: &NodeId) -> [u8; 32] {
        let secret = &self.local.secret;
        *self
            .packet_keys
            .entry(*peer)
            .or_insert_with(|| derive_packet_key(secret, peer))
    }

    fn seal_body(&mut self, peer: &NodeId, body: DhtBody) -> Packet {
        let tag = body.tag();
        let key = self.packet_key(peer);
        let nonce = random_nonce();
        let aad = seal_aad(tag, self.local_id());

        // Body layouts are bounded and the key/nonce sizes are fixed, so
        // sealing cannot fail; an empty body on error keeps us total.
        let plaintext = body.to_bytes().map(|b| b.to_vec()).unwrap_or_default();
        let sealed_body =
            seal_xchacha20poly1305(&key, &nonce, &plaintext, &aad).unwrap_or_default();

        Packet::Dht {
            tag,
            sender: *self.local_id(),
            nonce,
            sealed_body,
        }
    }

    fn open_body(
        &mut self,
        tag: PacketTag,
        sender: &NodeId,
        nonce: &[u8; NONCE_SIZE],
        sealed_body: &[u8],
    ) -> Option<DhtBody> {
        let key = self.packet_key(sender);
        let aad = seal_aad(tag, sender);
        let plaintext = open_xchacha20poly1305(&key, nonce, sealed_body, &aad).ok()?;
        DhtBody::from_bytes(tag, &plaintext).ok()
    }
}

fn seal_aad(tag: PacketTag, sender: &NodeId) -> [u8; 33] {
    let mut aad = [0u8; 33];
    aad[0] = tag as u8;
    aad[1..].copy_from_slice(sender.as_bytes());
    aad
}

fn random_nonce() -> [u8; NONCE_SIZE] {
    use rand::RngCore;
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn service() -> DhtService {
        DhtService::new(KeyPair::generate(), DhtConfig::default())
    }

    #[test]
    fn test_ping_pong_between_services() {
        let mut a = service();
        let mut b = service();
        let a_id = *a.local_id();
        let b_id = *b.local_id();

        // a pings b directly.
        let ping = a.seal_body(&b_id, DhtBody::Ping { ping_id: 99 });
        let responses = b.handle_packet(&ping, addr(1000));
        assert_eq!(responses.len(), 1);

        // b now knows a.
        assert!(b.routing_table().get(&a_id).is_some());

        // The pong routes back and authenticates.
        let (_, pong) = &responses[0];
        a.pending_pings.insert(
            99,
            PendingPing {
                node_id: b_id,
                sent_at: Instant::now(),
            },
        );
        a.handle_packet(pong, addr(2000));
        assert!(a.pending_pings.is_empty());
        assert!(a.routing_table().get(&b_id).is_some());
    }

    #[test]
    fn test_find_node_returns_closest() {
        let mut a = service();
        let mut b = service();
        let b_id = *b.local_id();

        // b knows some nodes.
        for i in 1..=6u8 {
            b.routing_table().insert(NodeId::new([i; 32]), addr(i as u16));
        }

        let target = NodeId::random();
        let query = a.seal_body(&b_id, DhtBody::FindNode { target, ping_id: 5 });
        let responses = b.handle_packet(&query, addr(1000));
        assert_eq!(responses.len(), 1);

        // Decode the response on a's side.
        a.pending_queries.insert(
            5,
            PendingQuery {
                node_id: b_id,
                target,
                sent_at: Instant::now(),
            },
        );
        let (_, nodes_packet) = &responses[0];
        match nodes_packet {
            Packet::Dht {
                tag,
                sender,
                nonce,
                sealed_body,
            } => {
                let body = a.open_body(*tag, sender, nonce, sealed_body).unwrap();
                match body {
                    DhtBody::Nodes { nodes, ping_id } => {
                        assert_eq!(ping_id, 5);
                        assert!(!nodes.is_empty());
                        assert!(nodes.len() <= MAX_NODES_PER_RESPONSE);
                    }
                    other => panic!("expected Nodes, got {other:?}"),
                }
            }
            other => panic!("expected DHT packet, got {other:?}"),
        }
    }

    #[test]
    fn test_tampered_packet_dropped_silently() {
        let mut a = service();
        let mut b = service();
        let b_id = *b.local_id();

        let ping = a.seal_body(&b_id, DhtBody::Ping { ping_id: 1 });
        let tampered = match ping {
            Packet::Dht {
                tag,
                sender,
                nonce,
                mut sealed_body,
            } => {
                sealed_body[0] ^= 0xff;
                Packet::Dht {
                    tag,
                    sender,
                    nonce,
                    sealed_body,
                }
            }
            other => panic!("expected DHT packet, got {other:?}"),
        };

        assert!(b.handle_packet(&tampered, addr(1)).is_empty());
        // Sender not learned from an unauthentic packet.
        assert!(b.routing_table().get(a.local_id()).is_none());

        // Still dropped on redelivery.
        assert!(b.handle_packet(&tampered, addr(1)).is_empty());
    }

    #[test]
    fn test_bootstrap_starts_self_lookup() {
        let mut a = service();
        let seed_id = NodeId::random();

        let out = a.bootstrap(seed_id, addr(7));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, addr(7));
        assert!(matches!(
            out[0].1,
            Packet::Dht {
                tag: PacketTag::DhtFindNode,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_ping_id_ignored() {
        let mut a = service();
        let mut b = service();

        // Unsolicited pong: authentic but uncorrelated.
        let a_id = *a.local_id();
        let pong = b.seal_body(&a_id, DhtBody::Pong { ping_id: 1234 });
        let out = a.handle_packet(&pong, addr(1));
        assert!(out.is_empty());
    }
}
