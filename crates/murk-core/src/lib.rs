//! Murk Core - Core types and primitives for the Murk communication substrate.
//!
//! This crate provides:
//! - Cryptographic primitives (X25519, HKDF, XChaCha20-Poly1305)
//! - The `NodeId` identifier used for identity and XOR-distance routing
//! - Key pair types for long-term and ephemeral keys

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod crypto;
pub mod identifiers;
pub mod keys;

pub use crypto::*;
pub use identifiers::*;
pub use keys::*;

/// Protocol major version.
pub const PROTOCOL_VERSION_MAJOR: u32 = 1;
/// Protocol minor version.
pub const PROTOCOL_VERSION_MINOR: u32 = 0;
