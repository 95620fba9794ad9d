//! Murk Session - per-peer encrypted sessions.
//!
//! A session is the unit of confidentiality between two peers: a handshake
//! exchanging AEAD-sealed ephemeral keys, a symmetric session key derived
//! from the ephemeral-ephemeral DH, and per-packet authenticated encryption
//! with a monotonic counter nonce and a bounded replay window. An idle
//! session expires and its key material is wiped.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod replay;
pub mod session;

pub use replay::ReplayWindow;
pub use session::{Session, SessionConfig, SessionError, SessionState};

/// Replay window width in packets.
pub const REPLAY_WINDOW: u64 = 64;

/// Seconds without accepted traffic before an established session expires.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 120;
