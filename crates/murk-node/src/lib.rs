//! Murk Node - the running peer.
//!
//! Owns the UDP socket, the DHT service, and the per-peer session and
//! stream state, all driven by a single event loop: one datagram or one
//! timer tick mutates state at a time, so no per-peer locking is needed.
//! Applications talk to the node through a command channel and receive
//! data and lifecycle events back over an event channel.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod node;
pub mod socket;

pub use node::{CloseReason, ConnectionHandle, Node, NodeConfig, NodeError, NodeEvent, NodeHandle};
pub use socket::{DatagramSocket, UdpDatagramSocket};

/// Event loop tick interval in milliseconds.
pub const TICK_INTERVAL_MS: u64 = 50;

/// Seconds between handshake retries.
pub const HANDSHAKE_RETRY_SECS: u64 = 1;

/// Handshake attempts before the connection is reported failed.
pub const MAX_HANDSHAKE_ATTEMPTS: u32 = 10;

/// Largest datagram the node will read off the socket.
pub const MAX_DATAGRAM_SIZE: usize = 2048;
