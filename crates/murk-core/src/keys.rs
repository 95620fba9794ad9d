//! Key pair types.
//!
//! A node holds one long-term X25519 key pair for its whole lifetime (the
//! public half is its `NodeId`) and generates a fresh ephemeral key pair per
//! handshake, discarded when the session ends.

use std::fmt;

use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519SecretKey};
use zeroize::Zeroize;

use crate::identifiers::NodeId;

/// X25519 secret key, zeroized on drop.
#[derive(Clone)]
pub struct SecretKey(pub(crate) [u8; 32]);

impl SecretKey {
    /// Creates a secret key from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generates a random secret key.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Returns the inner bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// Zeroizes the key on drop.
impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// An X25519 key pair.
///
/// Used both for the long-term identity (fixed for node lifetime) and for
/// per-handshake ephemeral keys.
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// Secret half.
    pub secret: SecretKey,
    /// Public half.
    pub public: NodeId,
}

impl KeyPair {
    /// Generates a fresh key pair.
    pub fn generate() -> Self {
        let secret = SecretKey::random();
        let public = public_key(&secret);
        Self { secret, public }
    }

    /// Reconstructs a key pair from a stored secret key.
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = public_key(&secret);
        Self { secret, public }
    }
}

/// Derives the X25519 public key for a secret key.
pub fn public_key(secret: &SecretKey) -> NodeId {
    let sk = X25519SecretKey::from(secret.0);
    NodeId::new(X25519PublicKey::from(&sk).to_bytes())
}

/// X25519 Diffie-Hellman: computes the shared secret between a local secret
/// key and a peer public key.
pub fn shared_secret(secret: &SecretKey, peer: &NodeId) -> [u8; 32] {
    let sk = X25519SecretKey::from(secret.0);
    let pk = X25519PublicKey::from(*peer.as_bytes());
    sk.diffie_hellman(&pk).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_public_matches_secret() {
        let pair = KeyPair::generate();
        assert_eq!(public_key(&pair.secret), pair.public);
    }

    #[test]
    fn test_dh_agreement() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();

        let ab = shared_secret(&a.secret, &b.public);
        let ba = shared_secret(&b.secret, &a.public);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_dh_distinct_pairs_disagree() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let c = KeyPair::generate();

        let ab = shared_secret(&a.secret, &b.public);
        let ac = shared_secret(&a.secret, &c.public);
        assert_ne!(ab, ac);
    }

    #[test]
    fn test_secret_key_debug_redacted() {
        let key = SecretKey::random();
        let debug_str = format!("{:?}", key);
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains(&hex::encode(key.0)));
    }
}
