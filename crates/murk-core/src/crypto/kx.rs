//! Key derivation for handshakes and sealed packets.

use crate::identifiers::NodeId;
use crate::keys::{shared_secret, SecretKey};

use super::hkdf_sha256;

/// HKDF info string for session keys.
const SESSION_KEY_INFO: &[u8] = b"murk/v1/session-key";

/// HKDF info string for per-peer packet keys.
const PACKET_KEY_INFO: &[u8] = b"murk/v1/packet-key";

/// Derives the symmetric session key from an ephemeral-ephemeral DH.
///
/// The salt is the concatenation of both ephemeral public keys in
/// lexicographic order, so initiator and responder derive the same key
/// regardless of which side computed the DH.
pub fn derive_session_key(
    local_ephemeral_secret: &SecretKey,
    peer_ephemeral_public: &NodeId,
    local_ephemeral_public: &NodeId,
) -> [u8; 32] {
    let dh = shared_secret(local_ephemeral_secret, peer_ephemeral_public);

    let (lo, hi) = if local_ephemeral_public.as_bytes() <= peer_ephemeral_public.as_bytes() {
        (local_ephemeral_public, peer_ephemeral_public)
    } else {
        (peer_ephemeral_public, local_ephemeral_public)
    };
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(lo.as_bytes());
    salt[32..].copy_from_slice(hi.as_bytes());

    let okm = hkdf_sha256(&dh, &salt, SESSION_KEY_INFO, 32);
    let mut key = [0u8; 32];
    key.copy_from_slice(&okm);
    key
}

/// Derives the packet key for sealing handshake and DHT payloads to a peer,
/// from the static-static DH between the two long-term identities.
pub fn derive_packet_key(local_static_secret: &SecretKey, peer: &NodeId) -> [u8; 32] {
    let dh = shared_secret(local_static_secret, peer);
    let okm = hkdf_sha256(&dh, &[], PACKET_KEY_INFO, 32);
    let mut key = [0u8; 32];
    key.copy_from_slice(&okm);
    key
}
