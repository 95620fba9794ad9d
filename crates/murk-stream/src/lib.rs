//! Murk Stream - reliable ordered delivery over an encrypted session.
//!
//! Messages are sliced into MTU-sized segments with consecutive sequence
//! numbers. The receiver acknowledges cumulatively plus selectively; the
//! sender retransmits on an RTT-adaptive timer with exponential backoff and
//! paces itself with a congestion window. Delivery is in order, exactly
//! once.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod congestion;
pub mod connection;
pub mod rtt;

pub use congestion::CongestionWindow;
pub use connection::{CloseReason, StreamConfig, StreamConnection, StreamError};
pub use rtt::RttEstimator;

/// Maximum payload bytes per data segment.
pub const MTU: usize = 1100;

/// Initial congestion window, in segments.
pub const INITIAL_CWND: usize = 4;

/// Hard cap on unacknowledged plus queued segments.
pub const MAX_SEND_WINDOW: usize = 256;

/// Retransmissions of one segment before the connection is torn down.
pub const MAX_RETRIES: u32 = 8;

/// Seconds a closing connection lingers to absorb trailing retransmissions.
pub const LINGER_SECS: u64 = 2;

/// Retransmission timeout floor, in milliseconds.
pub const RTO_MIN_MS: u64 = 200;

/// Retransmission timeout ceiling, in seconds.
pub const RTO_MAX_SECS: u64 = 10;

/// Duplicate cumulative acks that trigger a fast retransmit.
pub const FAST_RETRANSMIT_DUPS: u32 = 3;
