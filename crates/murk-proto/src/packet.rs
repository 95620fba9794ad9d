//! Outer datagram packets.
//!
//! Wire layouts (big-endian integers):
//!
//! ```text
//! Handshake:  [0x10][sender pk: 32][base nonce: 24][sealed ephemeral: 48]
//! Data:       [0x1a][counter: 8][ciphertext || tag: >= 16]
//! DHT:        [tag][sender pk: 32][nonce: 24][sealed body: >= 16]
//! ```
//!
//! DHT bodies (plaintext, before sealing):
//!
//! ```text
//! Ping/Pong:  [ping id: 8]
//! FindNode:   [target pk: 32][ping id: 8]
//! Nodes:      [count: 1][count x (pk: 32, ip tag: 1, ip: 4|16, port: 2)][ping id: 8]
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use murk_core::{NodeId, NONCE_SIZE, TAG_SIZE};

/// Size of the nonce carried in handshake and DHT packets.
pub const HANDSHAKE_NONCE_SIZE: usize = NONCE_SIZE;

/// Sealed ephemeral key size: 32-byte key plus AEAD tag.
pub const SEALED_EPHEMERAL_SIZE: usize = 32 + TAG_SIZE;

/// Maximum node candidates in one Nodes response, so it always fits one MTU.
pub const MAX_NODES_PER_RESPONSE: usize = 4;

/// Packet decoding errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Datagram shorter than its layout requires
    #[error("Packet truncated: needed {expected} more bytes, got {available}")]
    Truncated {
        /// Bytes the layout still required
        expected: usize,
        /// Bytes actually available
        available: usize,
    },

    /// First byte is not a known packet-type tag
    #[error("Unknown packet tag: 0x{0:02x}")]
    UnknownTag(u8),

    /// Address family byte is not IPv4 or IPv6
    #[error("Unknown address tag: 0x{0:02x}")]
    UnknownAddressTag(u8),

    /// Node count exceeds the per-packet cap
    #[error("Too many nodes in response: {0}")]
    TooManyNodes(usize),

    /// Empty datagram
    #[error("Empty packet")]
    Empty,
}

/// Packet-type tags: the first byte of every datagram on the shared port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketTag {
    /// DHT liveness check
    DhtPing = 0x00,
    /// DHT liveness reply
    DhtPong = 0x01,
    /// DHT routing query
    DhtFindNode = 0x02,
    /// DHT routing response (node candidates)
    DhtNodes = 0x04,
    /// Session handshake
    Handshake = 0x10,
    /// Encrypted session data
    Data = 0x1a,
}

impl TryFrom<u8> for PacketTag {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, PacketError> {
        match value {
            0x00 => Ok(Self::DhtPing),
            0x01 => Ok(Self::DhtPong),
            0x02 => Ok(Self::DhtFindNode),
            0x04 => Ok(Self::DhtNodes),
            0x10 => Ok(Self::Handshake),
            0x1a => Ok(Self::Data),
            other => Err(PacketError::UnknownTag(other)),
        }
    }
}

impl PacketTag {
    /// Returns true for the four DHT packet tags.
    pub fn is_dht(&self) -> bool {
        matches!(
            self,
            Self::DhtPing | Self::DhtPong | Self::DhtFindNode | Self::DhtNodes
        )
    }
}

/// A decoded outer datagram packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Session handshake: the sender's identity, a base nonce, and the
    /// sender's ephemeral public key sealed to the recipient's identity.
    Handshake {
        /// Sender long-term public key
        sender: NodeId,
        /// Base nonce for the handshake seal (and the session nonce prefix)
        nonce: [u8; HANDSHAKE_NONCE_SIZE],
        /// AEAD-sealed ephemeral public key (32 + 16 bytes)
        sealed_ephemeral: Vec<u8>,
    },

    /// Encrypted session data carrying stream frames.
    Data {
        /// Monotonic per-session nonce counter
        counter: u64,
        /// AEAD ciphertext including the 16-byte authentication tag
        ciphertext: Vec<u8>,
    },

    /// DHT query or response with an AEAD-sealed body.
    Dht {
        /// One of the four DHT tags
        tag: PacketTag,
        /// Sender long-term public key
        sender: NodeId,
        /// Seal nonce
        nonce: [u8; HANDSHAKE_NONCE_SIZE],
        /// AEAD-sealed [`DhtBody`]
        sealed_body: Vec<u8>,
    },
}

impl Packet {
    /// Returns this packet's tag.
    pub fn tag(&self) -> PacketTag {
        match self {
            Packet::Handshake { .. } => PacketTag::Handshake,
            Packet::Data { .. } => PacketTag::Data,
            Packet::Dht { tag, .. } => *tag,
        }
    }

    /// Serializes the packet to wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match self {
            Packet::Handshake {
                sender,
                nonce,
                sealed_ephemeral,
            } => {
                buf.put_u8(PacketTag::Handshake as u8);
                buf.put_slice(sender.as_bytes());
                buf.put_slice(nonce);
                buf.put_slice(sealed_ephemeral);
            }
            Packet::Data { counter, ciphertext } => {
                buf.put_u8(PacketTag::Data as u8);
                buf.put_u64(*counter);
                buf.put_slice(ciphertext);
            }
            Packet::Dht {
                tag,
                sender,
                nonce,
                sealed_body,
            } => {
                buf.put_u8(*tag as u8);
                buf.put_slice(sender.as_bytes());
                buf.put_slice(nonce);
                buf.put_slice(sealed_body);
            }
        }
        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        match self {
            Packet::Handshake { sealed_ephemeral, .. } => {
                1 + 32 + HANDSHAKE_NONCE_SIZE + sealed_ephemeral.len()
            }
            Packet::Data { ciphertext, .. } => 1 + 8 + ciphertext.len(),
            Packet::Dht { sealed_body, .. } => 1 + 32 + HANDSHAKE_NONCE_SIZE + sealed_body.len(),
        }
    }

    /// Deserializes a packet from wire bytes.
    ///
    /// Never panics on arbitrary input; malformed datagrams yield an error
    /// the caller is expected to drop silently.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        if buf.is_empty() {
            return Err(PacketError::Empty);
        }

        let tag = PacketTag::try_from(buf.get_u8())?;
        match tag {
            PacketTag::Handshake => {
                let sender = get_node_id(&mut buf)?;
                let nonce = get_nonce(&mut buf)?;
                need(&buf, SEALED_EPHEMERAL_SIZE)?;
                let sealed_ephemeral = buf.to_vec();
                Ok(Packet::Handshake {
                    sender,
                    nonce,
                    sealed_ephemeral,
                })
            }
            PacketTag::Data => {
                need(&buf, 8 + TAG_SIZE)?;
                let counter = buf.get_u64();
                Ok(Packet::Data {
                    counter,
                    ciphertext: buf.to_vec(),
                })
            }
            _ => {
                let sender = get_node_id(&mut buf)?;
                let nonce = get_nonce(&mut buf)?;
                need(&buf, TAG_SIZE)?;
                Ok(Packet::Dht {
                    tag,
                    sender,
                    nonce,
                    sealed_body: buf.to_vec(),
                })
            }
        }
    }
}

/// A node candidate in a DHT response: identity plus transport address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAddr {
    /// Node identity (long-term public key)
    pub node_id: NodeId,
    /// UDP address the node was last seen at
    pub addr: SocketAddr,
}

const ADDR_TAG_V4: u8 = 0x04;
const ADDR_TAG_V6: u8 = 0x06;

impl NodeAddr {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.node_id.as_bytes());
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(ADDR_TAG_V4);
                buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(ADDR_TAG_V6);
                buf.put_slice(&ip.octets());
            }
        }
        buf.put_u16(self.addr.port());
    }

    fn decode(buf: &mut Bytes) -> Result<Self, PacketError> {
        let node_id = get_node_id(buf)?;
        need(buf, 1)?;
        let ip = match buf.get_u8() {
            ADDR_TAG_V4 => {
                need(buf, 4)?;
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            ADDR_TAG_V6 => {
                need(buf, 16)?;
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => return Err(PacketError::UnknownAddressTag(other)),
        };
        need(buf, 2)?;
        let port = buf.get_u16();
        Ok(Self {
            node_id,
            addr: SocketAddr::new(ip, port),
        })
    }
}

/// Plaintext body of a DHT packet, sealed before transmission.
///
/// The ping id ties responses to pending requests; a response with an
/// unknown ping id is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtBody {
    /// Liveness check
    Ping {
        /// Request correlation id
        ping_id: u64,
    },
    /// Liveness reply, echoing the ping's id
    Pong {
        /// Echoed correlation id
        ping_id: u64,
    },
    /// Ask for the nodes closest to a target key
    FindNode {
        /// Lookup target
        target: NodeId,
        /// Request correlation id
        ping_id: u64,
    },
    /// Node candidates closest to a previously requested target
    Nodes {
        /// Up to [`MAX_NODES_PER_RESPONSE`] candidates
        nodes: Vec<NodeAddr>,
        /// Echoed correlation id
        ping_id: u64,
    },
}

impl DhtBody {
    /// Returns the packet tag this body travels under.
    pub fn tag(&self) -> PacketTag {
        match self {
            DhtBody::Ping { .. } => PacketTag::DhtPing,
            DhtBody::Pong { .. } => PacketTag::DhtPong,
            DhtBody::FindNode { .. } => PacketTag::DhtFindNode,
            DhtBody::Nodes { .. } => PacketTag::DhtNodes,
        }
    }

    /// Serializes the body to plaintext bytes (pre-seal).
    pub fn to_bytes(&self) -> Result<Bytes, PacketError> {
        let mut buf = BytesMut::new();
        match self {
            DhtBody::Ping { ping_id } | DhtBody::Pong { ping_id } => {
                buf.put_u64(*ping_id);
            }
            DhtBody::FindNode { target, ping_id } => {
                buf.put_slice(target.as_bytes());
                buf.put_u64(*ping_id);
            }
            DhtBody::Nodes { nodes, ping_id } => {
                if nodes.len() > MAX_NODES_PER_RESPONSE {
                    return Err(PacketError::TooManyNodes(nodes.len()));
                }
                buf.put_u8(nodes.len() as u8);
                for node in nodes {
                    node.encode(&mut buf);
                }
                buf.put_u64(*ping_id);
            }
        }
        Ok(buf.freeze())
    }

    /// Deserializes a body for the given DHT tag.
    pub fn from_bytes(tag: PacketTag, bytes: &[u8]) -> Result<Self, PacketError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        match tag {
            PacketTag::DhtPing => {
                need(&buf, 8)?;
                Ok(DhtBody::Ping {
                    ping_id: buf.get_u64(),
                })
            }
            PacketTag::DhtPong => {
                need(&buf, 8)?;
                Ok(DhtBody::Pong {
                    ping_id: buf.get_u64(),
                })
            }
            PacketTag::DhtFindNode => {
                let target = get_node_id(&mut buf)?;
                need(&buf, 8)?;
                Ok(DhtBody::FindNode {
                    target,
                    ping_id: buf.get_u64(),
                })
            }
            PacketTag::DhtNodes => {
                need(&buf, 1)?;
                let count = buf.get_u8() as usize;
                if count > MAX_NODES_PER_RESPONSE {
                    return Err(PacketError::TooManyNodes(count));
                }
                let mut nodes = Vec::with_capacity(count);
                for _ in 0..count {
                    nodes.push(NodeAddr::decode(&mut buf)?);
                }
                need(&buf, 8)?;
                Ok(DhtBody::Nodes {
                    nodes,
                    ping_id: buf.get_u64(),
                })
            }
            other => Err(PacketError::UnknownTag(other as u8)),
        }
    }
}

fn need(buf: &Bytes, n: usize) -> Result<(), PacketError> {
    if buf.remaining() < n {
        Err(PacketError::Truncated {
            expected: n,
            available: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

fn get_node_id(buf: &mut Bytes) -> Result<NodeId, PacketError> {
    need(buf, 32)?;
    let mut bytes = [0u8; 32];
    buf.copy_to_slice(&mut bytes);
    Ok(NodeId::new(bytes))
}

fn get_nonce(buf: &mut Bytes) -> Result<[u8; HANDSHAKE_NONCE_SIZE], PacketError> {
    need(buf, HANDSHAKE_NONCE_SIZE)?;
    let mut nonce = [0u8; HANDSHAKE_NONCE_SIZE];
    buf.copy_to_slice(&mut nonce);
    Ok(nonce)
}
