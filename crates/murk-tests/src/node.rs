//! Test node and network wrappers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use murk_core::{KeyPair, NodeId};
use murk_node::{
    ConnectionHandle, DatagramSocket, Node, NodeConfig, NodeError, NodeEvent, NodeHandle,
};
use tracing::info;

use crate::harness::Fabric;

/// A node attached to the test fabric.
pub struct TestNode {
    /// The node's identity
    pub node_id: NodeId,
    /// Its fabric address
    pub addr: SocketAddr,
    handle: NodeHandle,
}

impl TestNode {
    /// Spawns a node on the fabric.
    pub fn spawn(fabric: &Arc<Fabric>, config: NodeConfig) -> Self {
        let socket = fabric.open_socket();
        let addr = socket
            .local_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
        let handle = Node::spawn(KeyPair::generate(), socket, config);
        Self {
            node_id: handle.local_id(),
            addr,
            handle,
        }
    }

    /// Connects to another test node by direct address.
    pub async fn connect_to(&self, other: &TestNode) -> Result<ConnectionHandle, NodeError> {
        self.handle.connect(other.node_id, Some(other.addr)).await
    }

    /// Connects by identity alone; the node resolves the address via DHT.
    pub async fn connect_to_id(&self, peer: NodeId) -> Result<ConnectionHandle, NodeError> {
        self.handle.connect(peer, None).await
    }

    /// Sends bytes on a connection.
    pub async fn send(
        &self,
        connection: ConnectionHandle,
        bytes: Vec<u8>,
    ) -> Result<(), NodeError> {
        self.handle.send(connection, bytes).await
    }

    /// Closes a connection.
    pub async fn close(&self, connection: ConnectionHandle) -> Result<(), NodeError> {
        self.handle.close(connection).await
    }

    /// Seeds this node's routing table from another node.
    pub async fn bootstrap_from(&self, other: &TestNode) -> Result<(), NodeError> {
        self.handle.bootstrap(other.node_id, other.addr).await
    }

    /// Receives the next event, with a deadline.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<NodeEvent> {
        tokio::time::timeout(timeout, self.handle.next_event())
            .await
            .ok()
            .flatten()
    }

    /// Collects data events until `expected` bytes arrived or the deadline
    /// passes. Other events are discarded.
    pub async fn collect_data(&mut self, expected: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut received = Vec::new();
        while received.len() < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.next_event(remaining).await {
                Some(NodeEvent::Data { bytes, .. }) => received.extend(bytes),
                Some(_) => {}
                None => break,
            }
        }
        received
    }

    /// Waits for a close event on any connection.
    pub async fn wait_for_close(&mut self, timeout: Duration) -> Option<NodeEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.next_event(remaining).await {
                Some(event @ NodeEvent::ConnectionClosed { .. }) => return Some(event),
                Some(_) => {}
                None => return None,
            }
        }
    }
}

/// A network of test nodes over one fabric.
pub struct TestNetwork {
    /// The shared fabric
    pub fabric: Arc<Fabric>,
    nodes: Vec<TestNode>,
}

impl TestNetwork {
    /// Creates an empty network with a lossless fabric.
    pub fn new() -> Self {
        Self {
            fabric: Fabric::new(),
            nodes: Vec::new(),
        }
    }

    /// Creates a network with `count` nodes.
    pub fn with_nodes(count: usize, config: NodeConfig) -> Self {
        let mut network = Self::new();
        for _ in 0..count {
            network.add_node(config.clone());
        }
        network
    }

    /// Adds one node.
    pub fn add_node(&mut self, config: NodeConfig) -> &TestNode {
        let node = TestNode::spawn(&self.fabric, config);
        info!(node_id = %node.node_id, total = self.nodes.len() + 1, "Added node to test network");
        self.nodes.push(node);
        self.nodes.last().unwrap_or_else(|| unreachable!())
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Node by index.
    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    /// Mutable node by index (for event consumption).
    pub fn node_mut(&mut self, index: usize) -> &mut TestNode {
        &mut self.nodes[index]
    }

    /// Bootstraps every node against node 0.
    pub async fn bootstrap_all(&self) -> Result<(), NodeError> {
        for node in &self.nodes[1..] {
            node.bootstrap_from(&self.nodes[0]).await?;
        }
        Ok(())
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}
