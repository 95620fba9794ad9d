//! Murk Proto - Wire packet formats.
//!
//! Two layers of framing:
//! - [`packet`]: the outer datagram packets that travel on the UDP port
//!   (handshake, data, DHT query/response). The first byte of every datagram
//!   is a packet-type tag; unrecognized tags are dropped silently by
//!   consumers.
//! - [`frame`]: the stream frames carried *inside* the encrypted payload of
//!   data packets (data segments, selective acks, the kill signal).
//!
//! All multi-byte integers are big-endian. Layouts are fixed and must not
//! change: interoperability depends on them being bit-exact.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod frame;
pub mod packet;

pub use frame::{Frame, MAX_SACK_ENTRIES};
pub use packet::{
    DhtBody, NodeAddr, Packet, PacketError, PacketTag, HANDSHAKE_NONCE_SIZE, MAX_NODES_PER_RESPONSE,
};
