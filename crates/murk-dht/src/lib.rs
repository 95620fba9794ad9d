//! Murk DHT - Kademlia-style peer discovery.
//!
//! Organizes known peers by XOR distance from the local identity, answers
//! "who is closest to key K", and drives periodic peer-discovery queries.
//! DHT queries are best-effort: a lookup returning fewer than requested
//! results is a valid (if degraded) outcome on a sparse network.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod lookup;
pub mod routing;
pub mod service;

pub use lookup::{Lookup, LookupStatus};
pub use routing::{Bucket, NodeEntry, RoutingTable, RoutingTableConfig};
pub use service::{DhtConfig, DhtService};

/// Bucket size (k): entries per bucket.
pub const DEFAULT_K: usize = 8;

/// Query parallelism (alpha) for iterative lookups.
pub const DEFAULT_ALPHA: usize = 4;

/// Bound on lookup rounds for pathological topologies.
pub const MAX_LOOKUP_ROUNDS: usize = 8;

/// Seconds without contact before an entry is considered stale
/// (replaceable by a fresh candidate).
pub const DEFAULT_STALE_TIMEOUT_SECS: u64 = 160;

/// Seconds between liveness re-pings of a quiet entry.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 60;

/// Seconds before an unanswered ping counts as a failure.
pub const DEFAULT_PING_TIMEOUT_SECS: u64 = 5;

/// Consecutive unanswered pings before eviction, regardless of bucket
/// occupancy.
pub const MAX_PING_FAILURES: u32 = 2;
