//! Cryptographic primitives for Murk.
//!
//! Algorithm suite:
//! - X25519 (RFC 7748) for key agreement (see [`crate::keys`])
//! - HKDF-SHA-256 (RFC 5869) for key derivation
//! - XChaCha20-Poly1305 for authenticated encryption

mod aead;
mod hkdf;
mod kx;

pub use aead::{open_xchacha20poly1305, seal_xchacha20poly1305, AeadError};
pub use hkdf::{hkdf_sha256, hmac_sha256};
pub use kx::{derive_packet_key, derive_session_key};

/// AEAD nonce size for XChaCha20-Poly1305
pub const NONCE_SIZE: usize = 24;

/// AEAD tag size for XChaCha20-Poly1305
pub const TAG_SIZE: usize = 16;

/// Key size for all symmetric operations
pub const KEY_SIZE: usize = 32;
