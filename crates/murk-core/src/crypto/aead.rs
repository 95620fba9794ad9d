//! XChaCha20-Poly1305 AEAD.
//!
//! Every datagram payload that crosses the wire — handshake ephemerals, DHT
//! bodies, data segments — is sealed with this primitive.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use thiserror::Error;

use super::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Errors that can occur during AEAD operations.
#[derive(Debug, Error)]
pub enum AeadError {
    /// Invalid key length (must be 32 bytes)
    #[error("Invalid key length: expected {KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Invalid nonce length (must be 24 bytes)
    #[error("Invalid nonce length: expected {NONCE_SIZE} bytes, got {0}")]
    InvalidNonceLength(usize),

    /// Encryption failed
    #[error("Encryption failed")]
    SealFailed,

    /// Decryption failed (authentication tag mismatch)
    #[error("Decryption failed: authentication tag mismatch")]
    OpenFailed,

    /// Ciphertext too short (must contain at least the tag)
    #[error("Ciphertext too short: expected at least {TAG_SIZE} bytes, got {0}")]
    CiphertextTooShort(usize),
}

/// Seals plaintext using XChaCha20-Poly1305.
///
/// Returns ciphertext concatenated with the 16-byte authentication tag. The
/// nonce is not included in the output; callers embed it in the packet
/// layout themselves.
pub fn seal_xchacha20poly1305(
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    if key.len() != KEY_SIZE {
        return Err(AeadError::InvalidKeyLength(key.len()));
    }
    if nonce.len() != NONCE_SIZE {
        return Err(AeadError::InvalidNonceLength(nonce.len()));
    }

    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| AeadError::InvalidKeyLength(key.len()))?;

    let nonce = XNonce::from_slice(nonce);
    let payload = Payload { msg: plaintext, aad };

    cipher.encrypt(nonce, payload).map_err(|_| AeadError::SealFailed)
}

/// Opens ciphertext sealed by [`seal_xchacha20poly1305`].
///
/// Fails closed: any tampering with ciphertext, tag, or associated data
/// yields `OpenFailed` and no plaintext.
pub fn open_xchacha20poly1305(
    key: &[u8],
    nonce: &[u8],
    ciphertext_with_tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    if key.len() != KEY_SIZE {
        return Err(AeadError::InvalidKeyLength(key.len()));
    }
    if nonce.len() != NONCE_SIZE {
        return Err(AeadError::InvalidNonceLength(nonce.len()));
    }
    if ciphertext_with_tag.len() < TAG_SIZE {
        return Err(AeadError::CiphertextTooShort(ciphertext_with_tag.len()));
    }

    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| AeadError::InvalidKeyLength(key.len()))?;

    let nonce = XNonce::from_slice(nonce);
    let payload = Payload {
        msg: ciphertext_with_tag,
        aad,
    };

    cipher.decrypt(nonce, payload).map_err(|_| AeadError::OpenFailed)
}
