//! The `NodeId` identifier type.
//!
//! A `NodeId` is a node's 32-byte X25519 public key. It serves double duty:
//! it is the peer's cryptographic identity and its coordinate in the
//! XOR-distance routing metric.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Node identity: the node's long-term X25519 public key.
///
/// Immutable once created. Two nodes are the same peer iff their
/// `NodeId`s are equal.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Creates a new identifier from a 32-byte array.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Creates a zero identifier.
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Returns the inner bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the inner bytes as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Creates from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Returns as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Computes XOR distance for Kademlia routing.
    ///
    /// Deterministic and symmetric: `a.xor_distance(b) == b.xor_distance(a)`.
    pub fn xor_distance(&self, other: &Self) -> [u8; 32] {
        let mut result = [0u8; 32];
        for i in 0..32 {
            result[i] = self.0[i] ^ other.0[i];
        }
        result
    }

    /// Returns the leading zero bits count (for k-bucket indexing).
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0u32;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }

    /// Generates a random NodeId (test and simulation use).
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<NodeId> for [u8; 32] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_distance() {
        let id1 = NodeId::new([0xFF; 32]);
        let id2 = NodeId::new([0x00; 32]);
        let distance = id1.xor_distance(&id2);
        assert_eq!(distance, [0xFF; 32]);

        let distance2 = id1.xor_distance(&id1);
        assert_eq!(distance2, [0x00; 32]);
    }

    #[test]
    fn test_xor_distance_symmetric() {
        for _ in 0..20 {
            let a = NodeId::random();
            let b = NodeId::random();
            assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        }
    }

    #[test]
    fn test_leading_zeros() {
        let id1 = NodeId::new([0x00; 32]);
        assert_eq!(id1.leading_zeros(), 256);

        let mut bytes = [0x00; 32];
        bytes[0] = 0x80; // 10000000
        let id2 = NodeId::new(bytes);
        assert_eq!(id2.leading_zeros(), 0);

        bytes[0] = 0x01; // 00000001
        let id3 = NodeId::new(bytes);
        assert_eq!(id3.leading_zeros(), 7);
    }

    #[test]
    fn test_from_hex() {
        let id = NodeId::random();
        let hex_str = id.to_hex();
        let parsed = NodeId::from_hex(&hex_str).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_from_hex_wrong_length() {
        assert!(NodeId::from_hex("abcd").is_err());
    }
}
