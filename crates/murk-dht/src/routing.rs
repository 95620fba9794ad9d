//! Kademlia routing table.
//!
//! The routing table organizes known peers by XOR distance from the local
//! identity. Bucket index is the position of the highest differing bit, so
//! closer peers cluster in higher-resolution buckets and memory is bounded
//! at O(k * 256).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use murk_core::NodeId;
use parking_lot::RwLock;

use crate::{DEFAULT_K, DEFAULT_PING_INTERVAL_SECS, DEFAULT_STALE_TIMEOUT_SECS};

/// Configuration for the routing table.
#[derive(Debug, Clone)]
pub struct RoutingTableConfig {
    /// Bucket size (k)
    pub bucket_size: usize,
    /// Time before an unseen entry is considered stale (replaceable)
    pub stale_timeout_secs: u64,
    /// Time between liveness re-pings
    pub ping_interval_secs: u64,
}

impl Default for RoutingTableConfig {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_K,
            stale_timeout_secs: DEFAULT_STALE_TIMEOUT_SECS,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
        }
    }
}

/// A peer known to the routing table.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    /// Node identifier (long-term public key)
    pub node_id: NodeId,
    /// UDP address
    pub addr: SocketAddr,
    /// Last time we heard from this node
    pub last_seen: Instant,
    /// Outstanding liveness ping, if any
    pub last_pinged: Option<Instant>,
    /// Consecutive unanswered pings
    pub ping_failures: u32,
}

impl NodeEntry {
    /// Creates a new entry, freshly seen.
    pub fn new(node_id: NodeId, addr: SocketAddr) -> Self {
        Self {
            node_id,
            addr,
            last_seen: Instant::now(),
            last_pinged: None,
            ping_failures: 0,
        }
    }

    /// Marks the node as just heard from, clearing ping state.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.last_pinged = None;
        self.ping_failures = 0;
    }

    /// Records an unanswered ping.
    pub fn record_ping_failure(&mut self) {
        self.last_pinged = None;
        self.ping_failures += 1;
    }

    /// Returns true if the node has not been heard from within the timeout.
    pub fn is_stale(&self, timeout_secs: u64) -> bool {
        self.last_seen.elapsed().as_secs() > timeout_secs
    }

    /// Returns true if the node is due a liveness re-ping.
    pub fn needs_ping(&self, interval_secs: u64) -> bool {
        self.last_pinged.is_none() && self.last_seen.elapsed().as_secs() > interval_secs
    }
}

/// A k-bucket holding up to k nodes at one distance range.
///
/// Entries are kept in recency order, most recently seen last. A candidate
/// for a full bucket replaces the least-recently-seen entry only when that
/// entry is stale; otherwise the candidate is dropped — the bucket is
/// considered saturated with live peers.
#[derive(Debug)]
pub struct Bucket {
    nodes: VecDeque<NodeEntry>,
    bucket_size: usize,
}

impl Bucket {
    /// Creates a new bucket.
    pub fn new(bucket_size: usize) -> Self {
        Self {
            nodes: VecDeque::with_capacity(bucket_size),
            bucket_size,
        }
    }

    /// Returns the number of nodes in this bucket.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if this bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns true if this bucket is full.
    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.bucket_size
    }

    /// Returns all nodes in this bucket.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.iter()
    }

    /// Gets a node by ID.
    pub fn get(&self, node_id: &NodeId) -> Option<&NodeEntry> {
        self.nodes.iter().find(|n| n.node_id == *node_id)
    }

    /// Gets a mutable reference to a node by ID.
    pub fn get_mut(&mut self, node_id: &NodeId) -> Option<&mut NodeEntry> {
        self.nodes.iter_mut().find(|n| n.node_id == *node_id)
    }

    /// Places or refreshes a node.
    ///
    /// Returns true if the node is now present in the bucket.
    pub fn insert(&mut self, entry: NodeEntry, stale_timeout_secs: u64) -> bool {
        // Existing entry: refresh address and recency, move to the back.
        if let Some(pos) = self.nodes.iter().position(|n| n.node_id == entry.node_id) {
            if let Some(mut existing) = self.nodes.remove(pos) {
                existing.touch();
                existing.addr = entry.addr;
                self.nodes.push_back(existing);
            }
            return true;
        }

        if !self.is_full() {
            self.nodes.push_back(entry);
            return true;
        }

        // Full bucket: the front entry is the least recently seen. Replace
        // it only if it has gone stale; otherwise drop the candidate.
        let front_stale = self
            .nodes
            .front()
            .map(|n| n.is_stale(stale_timeout_secs))
            .unwrap_or(false);
        if front_stale {
            self.nodes.pop_front();
            self.nodes.push_back(entry);
            return true;
        }

        false
    }

    /// Removes a node from this bucket.
    pub fn remove(&mut self, node_id: &NodeId) -> Option<NodeEntry> {
        let pos = self.nodes.iter().position(|n| n.node_id == *node_id)?;
        self.nodes.remove(pos)
    }
}

/// Kademlia routing table.
///
/// Every known peer maps to exactly one bucket, determined purely by the
/// XOR distance between its id and the local identity.
pub struct RoutingTable {
    local_id: NodeId,
    /// K-buckets, index = 255 - leading_zeros(distance)
    buckets: Vec<RwLock<Bucket>>,
    config: RoutingTableConfig,
}

impl RoutingTable {
    /// Creates a new routing table.
    pub fn new(local_id: NodeId, config: RoutingTableConfig) -> Self {
        let buckets = (0..256)
            .map(|_| RwLock::new(Bucket::new(config.bucket_size)))
            .collect();

        Self {
            local_id,
            buckets,
            config,
        }
    }

    /// Returns the local node ID.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RoutingTableConfig {
        &self.config
    }

    /// Computes the bucket index for a node ID.
    ///
    /// Deterministic for a fixed local identity: the same pair always
    /// routes to the same index. Returns None for the local id itself.
    pub fn bucket_index(&self, node_id: &NodeId) -> Option<usize> {
        if *node_id == self.local_id {
            return None;
        }

        let distance = NodeId::new(self.local_id.xor_distance(node_id));
        Some(255 - distance.leading_zeros() as usize)
    }

    /// Places or refreshes a node. Returns true if it is now tracked.
    pub fn insert(&self, node_id: NodeId, addr: SocketAddr) -> bool {
        match self.bucket_index(&node_id) {
            Some(index) => self.buckets[index]
                .write()
                .insert(NodeEntry::new(node_id, addr), self.config.stale_timeout_secs),
            None => false,
        }
    }

    /// Removes a node.
    pub fn remove(&self, node_id: &NodeId) -> Option<NodeEntry> {
        let index = self.bucket_index(node_id)?;
        self.buckets[index].write().remove(node_id)
    }

    /// Gets a node entry by ID.
    pub fn get(&self, node_id: &NodeId) -> Option<NodeEntry> {
        let index = self.bucket_index(node_id)?;
        self.buckets[index].read().get(node_id).cloned()
    }

    /// Marks a node as just heard from.
    pub fn touch(&self, node_id: &NodeId) {
        if let Some(index) = self.bucket_index(node_id) {
            if let Some(entry) = self.buckets[index].write().get_mut(node_id) {
                entry.touch();
            }
        }
    }

    /// Marks a node as having an outstanding liveness ping.
    pub fn mark_pinged(&self, node_id: &NodeId) {
        if let Some(index) = self.bucket_index(node_id) {
            if let Some(entry) = self.buckets[index].write().get_mut(node_id) {
                entry.last_pinged = Some(Instant::now());
            }
        }
    }

    /// Records an unanswered ping; returns the failure count if tracked.
    pub fn record_ping_failure(&self, node_id: &NodeId) -> Option<u32> {
        let index = self.bucket_index(node_id)?;
        let mut bucket = self.buckets[index].write();
        let entry = bucket.get_mut(node_id)?;
        entry.record_ping_failure();
        Some(entry.ping_failures)
    }

    /// Finds up to `count` known nodes, ascending by XOR distance to target.
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<NodeEntry> {
        let mut nodes: Vec<NodeEntry> = Vec::new();

        for bucket in &self.buckets {
            for entry in bucket.read().nodes() {
                nodes.push(entry.clone());
            }
        }

        nodes.sort_by(|a, b| {
            let dist_a = target.xor_distance(&a.node_id);
            let dist_b = target.xor_distance(&b.node_id);
            dist_a.cmp(&dist_b)
        });

        nodes.truncate(count);
        nodes
    }

    /// Returns the nodes that are due a liveness re-ping.
    pub fn nodes_needing_ping(&self) -> Vec<NodeEntry> {
        let mut due = Vec::new();
        for bucket in &self.buckets {
            for entry in bucket.read().nodes() {
                if entry.needs_ping(self.config.ping_interval_secs) {
                    due.push(entry.clone());
                }
            }
        }
        due
    }

    /// Returns the total number of tracked nodes.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().len()).sum()
    }

    /// Returns true if no nodes are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_bucket_insert_and_refresh() {
        let mut bucket = Bucket::new(3);

        let id = NodeId::new([0x42; 32]);
        assert!(bucket.insert(NodeEntry::new(id, addr(1)), 160));
        assert_eq!(bucket.len(), 1);

        // Re-insert refreshes the address, not the count.
        assert!(bucket.insert(NodeEntry::new(id, addr(2)), 160));
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.get(&id).unwrap().addr, addr(2));
    }

    #[test]
    fn test_bucket_drops_when_saturated_with_live_peers() {
        let mut bucket = Bucket::new(2);
        bucket.insert(NodeEntry::new(NodeId::new([1; 32]), addr(1)), 160);
        bucket.insert(NodeEntry::new(NodeId::new([2; 32]), addr(2)), 160);
        assert!(bucket.is_full());

        // All entries fresh: candidate is dropped.
        assert!(!bucket.insert(NodeEntry::new(NodeId::new([3; 32]), addr(3)), 160));
        assert_eq!(bucket.len(), 2);
        assert!(bucket.get(&NodeId::new([3; 32])).is_none());
    }

    #[test]
    fn test_bucket_replaces_exactly_the_stalest_entry() {
        let mut bucket = Bucket::new(2);
        let stale_id = NodeId::new([1; 32]);
        let fresh_id = NodeId::new([2; 32]);

        let mut stale = NodeEntry::new(stale_id, addr(1));
        stale.last_seen = Instant::now() - Duration::from_secs(300);
        bucket.insert(stale, 160);
        bucket.insert(NodeEntry::new(fresh_id, addr(2)), 160);

        let newcomer = NodeId::new([3; 32]);
        assert!(bucket.insert(NodeEntry::new(newcomer, addr(3)), 160));
        assert_eq!(bucket.len(), 2);
        assert!(bucket.get(&stale_id).is_none());
        assert!(bucket.get(&fresh_id).is_some());
        assert!(bucket.get(&newcomer).is_some());
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let mut bucket = Bucket::new(4);
        for i in 0..20u8 {
            bucket.insert(NodeEntry::new(NodeId::new([i + 1; 32]), addr(1)), 160);
        }
        assert_eq!(bucket.len(), 4);
    }

    #[test]
    fn test_bucket_index_deterministic() {
        let local = NodeId::new([0x00; 32]);
        let table = RoutingTable::new(local, RoutingTableConfig::default());

        let far = NodeId::new([0xFF; 32]);
        assert_eq!(table.bucket_index(&far), Some(255));
        assert_eq!(table.bucket_index(&far), Some(255));

        let mut near = [0x00; 32];
        near[31] = 0x01;
        assert_eq!(table.bucket_index(&NodeId::new(near)), Some(0));

        // Self maps nowhere.
        assert_eq!(table.bucket_index(&local), None);
    }

    #[test]
    fn test_bucket_index_distribution() {
        let local = NodeId::new([0x00; 32]);
        let table = RoutingTable::new(local, RoutingTableConfig::default());

        let mut id = [0x00; 32];
        id[0] = 0x80;
        assert_eq!(table.bucket_index(&NodeId::new(id)), Some(255));

        id = [0x00; 32];
        id[1] = 0x80;
        assert_eq!(table.bucket_index(&NodeId::new(id)), Some(247));
    }

    #[test]
    fn test_insert_self_rejected() {
        let local = NodeId::random();
        let table = RoutingTable::new(local, RoutingTableConfig::default());
        assert!(!table.insert(local, addr(1)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_find_closest_sorted() {
        let table = RoutingTable::new(NodeId::random(), RoutingTableConfig::default());
        for _ in 0..50 {
            table.insert(NodeId::random(), addr(1));
        }

        let target = NodeId::random();
        let closest = table.find_closest(&target, 10);
        assert!(closest.len() <= 10);

        for i in 1..closest.len() {
            let prev = target.xor_distance(&closest[i - 1].node_id);
            let curr = target.xor_distance(&closest[i].node_id);
            assert!(prev <= curr, "nodes not sorted by distance");
        }
    }

    #[test]
    fn test_find_closest_degraded_on_sparse_table() {
        let table = RoutingTable::new(NodeId::random(), RoutingTableConfig::default());
        table.insert(NodeId::random(), addr(1));
        table.insert(NodeId::random(), addr(2));

        // Fewer results than requested is valid.
        let closest = table.find_closest(&NodeId::random(), 8);
        assert_eq!(closest.len(), 2);
    }

    #[test]
    fn test_remove() {
        let table = RoutingTable::new(NodeId::random(), RoutingTableConfig::default());
        let id = NodeId::random();
        table.insert(id, addr(1));
        assert!(table.get(&id).is_some());

        assert!(table.remove(&id).is_some());
        assert!(table.get(&id).is_none());
    }

    #[test]
    fn test_ping_failure_tracking() {
        let table = RoutingTable::new(NodeId::random(), RoutingTableConfig::default());
        let id = NodeId::random();
        table.insert(id, addr(1));

        assert_eq!(table.record_ping_failure(&id), Some(1));
        assert_eq!(table.record_ping_failure(&id), Some(2));

        // Hearing from the node again clears failures.
        table.touch(&id);
        assert_eq!(table.get(&id).unwrap().ping_failures, 0);
    }
}
