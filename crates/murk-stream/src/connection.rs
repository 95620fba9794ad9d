//! The reliable connection state machine.
//!
//! Sender side: segment queue, in-flight window, ack processing, RTT-driven
//! retransmission, fast retransmit on duplicate acks. Receiver side:
//! out-of-order buffer with in-order exactly-once delivery and selective
//! acks. The connection does no I/O and keeps no clock of its own; the
//! caller passes `Instant`s in, which keeps every timing path testable.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use murk_proto::{Frame, MAX_SACK_ENTRIES};
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    CongestionWindow, RttEstimator, FAST_RETRANSMIT_DUPS, INITIAL_CWND, LINGER_SECS, MAX_RETRIES,
    MAX_SEND_WINDOW, MTU, RTO_MAX_SECS,
};

/// Stream transport errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The send window cannot absorb the message
    #[error("Send window full")]
    WindowFull,

    /// The connection is closed or closing
    #[error("Connection closed")]
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close, from either side
    Normal,
    /// A segment exhausted its retransmissions
    Timeout,
}

/// Stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Maximum payload bytes per segment
    pub mtu: usize,
    /// Hard cap on queued plus in-flight segments
    pub max_window: usize,
    /// Retransmissions of one segment before teardown
    pub max_retries: u32,
    /// How long a closing connection lingers
    pub linger: Duration,
    /// Initial congestion window, in segments
    pub initial_cwnd: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mtu: MTU,
            max_window: MAX_SEND_WINDOW,
            max_retries: MAX_RETRIES,
            linger: Duration::from_secs(LINGER_SECS),
            initial_cwnd: INITIAL_CWND,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    payload: Vec<u8>,
    first_sent_at: Instant,
    deadline: Instant,
    retries: u32,
    retransmitted: bool,
    fast_retransmit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closing { linger_until: Instant },
    Closed(CloseReason),
}

/// One reliable bidirectional stream.
pub struct StreamConnection {
    config: StreamConfig,
    state: State,

    // Sender side.
    next_seq: u32,
    send_queue: VecDeque<(u32, Vec<u8>)>,
    in_flight: BTreeMap<u32, InFlight>,
    last_cum_ack: u32,
    dup_acks: u32,
    rtt: RttEstimator,
    cwnd: CongestionWindow,
    kill_pending: bool,

    // Receiver side.
    recv_next: u32,
    recv_buffer: BTreeMap<u32, Vec<u8>>,
    ack_pending: bool,
}

impl StreamConnection {
    /// Creates an open connection.
    pub fn new(config: StreamConfig) -> Self {
        let cwnd = CongestionWindow::new(config.initial_cwnd, config.max_window);
        Self {
            config,
            state: State::Open,
            next_seq: 0,
            send_queue: VecDeque::new(),
            in_flight: BTreeMap::new(),
            last_cum_ack: 0,
            dup_acks: 0,
            rtt: RttEstimator::default(),
            cwnd,
            kill_pending: false,
            recv_next: 0,
            recv_buffer: BTreeMap::new(),
            ack_pending: false,
        }
    }

    /// Returns why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.state {
            State::Closed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Returns true while data can still be sent.
    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Segments in flight (sent, unacknowledged).
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Segments queued behind the congestion window.
    pub fn queued_len(&self) -> usize {
        self.send_queue.len()
    }

    /// Current smoothed RTT, once measured.
    pub fn srtt(&self) -> Option<Duration> {
        self.rtt.srtt()
    }

    /// Enqueues a message for reliable delivery.
    ///
    /// The message is segmented at the MTU; either all segments are
    /// accepted or none are (`WindowFull`). An empty message is a no-op.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        if self.state != State::Open {
            return Err(StreamError::Closed);
        }
        if bytes.is_empty() {
            return Ok(());
        }

        let segments = bytes.len().div_ceil(self.config.mtu);
        let outstanding = self.in_flight.len() + self.send_queue.len();
        if outstanding + segments > self.config.max_window {
            return Err(StreamError::WindowFull);
        }

        // Sequence numbers are never reused, so one connection carries at
        // most `u32::MAX` segments over its lifetime. The window check
        // above bounds `segments`, making the cast safe.
        if self.next_seq.checked_add(segments as u32).is_none() {
            return Err(StreamError::WindowFull);
        }

        for chunk in bytes.chunks(self.config.mtu) {
            self.send_queue.push_back((self.next_seq, chunk.to_vec()));
            self.next_seq += 1;
        }
        trace!(segments, queued = self.send_queue.len(), "Enqueued message");
        Ok(())
    }

    /// Requests an orderly close: the kill signal is queued and the
    /// connection lingers to absorb trailing retransmissions.
    pub fn close(&mut self, now: Instant) {
        if matches!(self.state, State::Closed(_)) {
            return;
        }
        if self.state == State::Open {
            self.kill_pending = true;
        }
        self.state = State::Closing {
            linger_until: now + self.config.linger,
        };
    }

    /// Advances timers; returns the close reason once the connection is
    /// fully done (linger elapsed or torn down).
    pub fn poll_close(&mut self, now: Instant) -> Option<CloseReason> {
        if let State::Closing { linger_until } = self.state {
            if now >= linger_until {
                self.finish(CloseReason::Normal);
            }
        }
        self.close_reason()
    }

    /// Produces the frames to transmit right now: retransmissions that are
    /// due, fresh segments up to the congestion window, a pending ack, and
    /// the kill signal on close.
    pub fn poll_transmit(&mut self, now: Instant) -> Vec<Frame> {
        if matches!(self.state, State::Closed(_)) {
            return Vec::new();
        }

        let mut frames = Vec::new();

        // Retransmissions first: fast retransmits and expired timers.
        let due: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, seg)| seg.fast_retransmit || seg.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in due {
            let max_retries = self.config.max_retries;
            let exhausted = self
                .in_flight
                .get(&seq)
                .map(|seg| seg.retries >= max_retries)
                .unwrap_or(false);
            if exhausted {
                debug!(seq, "Segment exhausted retransmissions, tearing down");
                self.finish(CloseReason::Timeout);
                return Vec::new();
            }

            let rto = self.rtt.rto();
            if let Some(seg) = self.in_flight.get_mut(&seq) {
                if !seg.fast_retransmit {
                    // Timer expiry is a loss signal; fast retransmit already
                    // charged the window when it was detected.
                    self.cwnd.on_loss();
                }
                seg.retries += 1;
                seg.retransmitted = true;
                seg.fast_retransmit = false;
                let backoff = rto
                    .saturating_mul(1u32 << seg.retries.min(6))
                    .min(Duration::from_secs(RTO_MAX_SECS));
                seg.deadline = now + backoff;
                frames.push(Frame::Data {
                    seq,
                    cumulative_ack: self.recv_next,
                    payload: seg.payload.clone(),
                });
            }
        }

        // Fresh segments, paced by the congestion window.
        while self.in_flight.len() < self.cwnd.window() {
            let (seq, payload) = match self.send_queue.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            frames.push(Frame::Data {
                seq,
                cumulative_ack: self.recv_next,
                payload: payload.clone(),
            });
            self.in_flight.insert(
                seq,
                InFlight {
                    payload,
                    first_sent_at: now,
                    deadline: now + self.rtt.rto(),
                    retries: 0,
                    retransmitted: false,
                    fast_retransmit: false,
                },
            );
        }

        if self.ack_pending {
            self.ack_pending = false;
            frames.push(self.build_ack());
        }

        if self.kill_pending {
            self.kill_pending = false;
            frames.push(Frame::Kill);
        }

        frames
    }

    /// Consumes one decrypted frame; returns payloads now deliverable to
    /// the application, in order.
    pub fn handle_frame(&mut self, frame: &Frame, now: Instant) -> Vec<Vec<u8>> {
        if matches!(self.state, State::Closed(_)) {
            return Vec::new();
        }

        match frame {
            Frame::Data {
                seq,
                cumulative_ack,
                payload,
            } => {
                self.apply_cumulative_ack(*cumulative_ack, now);
                self.receive_segment(*seq, payload.clone())
            }
            Frame::Ack {
                cumulative_ack,
                sacks,
            } => {
                // Selective acks retire individual segments; they do not
                // reset duplicate-ack counting.
                for seq in sacks {
                    self.retire(*seq, now);
                }
                let advanced = self.apply_cumulative_ack(*cumulative_ack, now);
                if !advanced && *cumulative_ack == self.last_cum_ack && !self.in_flight.is_empty()
                {
                    self.dup_acks += 1;
                    if self.dup_acks == FAST_RETRANSMIT_DUPS {
                        self.trigger_fast_retransmit(*cumulative_ack);
                    }
                }
                Vec::new()
            }
            Frame::Kill => {
                debug!("Peer closed the connection");
                // Linger instead of tearing down on the spot: data the
                // kill overtook in flight can still arrive and must be
                // delivered (and acked) before buffers are released.
                if self.state == State::Open {
                    self.state = State::Closing {
                        linger_until: now + self.config.linger,
                    };
                }
                Vec::new()
            }
        }
    }

    fn receive_segment(&mut self, seq: u32, payload: Vec<u8>) -> Vec<Vec<u8>> {
        self.ack_pending = true;

        // Already delivered or already buffered: a duplicate. The ack we
        // just scheduled tells the sender to stop.
        if seq < self.recv_next || self.recv_buffer.contains_key(&seq) {
            trace!(seq, "Duplicate segment");
            return Vec::new();
        }

        self.recv_buffer.insert(seq, payload);

        let mut delivered = Vec::new();
        while let Some(payload) = self.recv_buffer.remove(&self.recv_next) {
            delivered.push(payload);
            self.recv_next += 1;
        }
        delivered
    }

    /// Retires everything below `ack`; returns true if anything was new.
    fn apply_cumulative_ack(&mut self, ack: u32, now: Instant) -> bool {
        let retired: Vec<u32> = self
            .in_flight
            .range(..ack)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &retired {
            self.retire(*seq, now);
        }

        if ack > self.last_cum_ack {
            self.last_cum_ack = ack;
            self.dup_acks = 0;
        }
        !retired.is_empty()
    }

    fn retire(&mut self, seq: u32, now: Instant) {
        if let Some(seg) = self.in_flight.remove(&seq) {
            // Karn's rule: only first transmissions produce RTT samples.
            if !seg.retransmitted {
                self.rtt.on_sample(now.duration_since(seg.first_sent_at));
            }
            self.cwnd.on_ack();
        }
    }

    fn trigger_fast_retransmit(&mut self, gap_start: u32) {
        let first_gap = self
            .in_flight
            .range(gap_start..)
            .map(|(seq, _)| *seq)
            .next();
        if let Some(seq) = first_gap {
            debug!(seq, "Fast retransmit");
            self.cwnd.on_loss();
            if let Some(seg) = self.in_flight.get_mut(&seq) {
                seg.fast_retransmit = true;
            }
        }
    }

    fn build_ack(&self) -> Frame {
        let sacks: Vec<u32> = self
            .recv_buffer
            .keys()
            .take(MAX_SACK_ENTRIES)
            .copied()
            .collect();
        Frame::Ack {
            cumulative_ack: self.recv_next,
            sacks,
        }
    }

    fn finish(&mut self, reason: CloseReason) {
        self.state = State::Closed(reason);
        self.send_queue.clear();
        self.in_flight.clear();
        self.recv_buffer.clear();
        self.kill_pending = false;
        self.ack_pending = false;
    }
}
