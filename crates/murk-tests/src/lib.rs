//! Integration harness for multi-node Murk testing.
//!
//! The harness replaces UDP with an in-memory fabric whose loss rate and
//! reordering delay are programmable per test, so the retransmission and
//! handshake-retry paths get exercised deterministically enough to assert
//! end-to-end integrity.

#![deny(unsafe_code)]

pub mod harness;
pub mod node;

pub use harness::{Fabric, TestSocket};
pub use node::{TestNetwork, TestNode};

/// Installs a `fmt` subscriber honoring `RUST_LOG`. Safe to call from
/// every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
