//! Congestion window: slow start and additive increase.
//!
//! Below ssthresh the window grows by one segment per acked segment (slow
//! start); at or above it, by one segment per full window of acks. Loss
//! halves ssthresh and collapses the window back onto it.

use crate::{INITIAL_CWND, MAX_SEND_WINDOW};

/// Congestion window state, measured in segments.
#[derive(Debug, Clone)]
pub struct CongestionWindow {
    cwnd: usize,
    ssthresh: usize,
    acked_in_window: usize,
    max: usize,
}

impl Default for CongestionWindow {
    fn default() -> Self {
        Self::new(INITIAL_CWND, MAX_SEND_WINDOW)
    }
}

impl CongestionWindow {
    /// Creates a window starting at `initial` segments, capped at `max`.
    pub fn new(initial: usize, max: usize) -> Self {
        Self {
            cwnd: initial.max(1),
            ssthresh: max,
            acked_in_window: 0,
            max,
        }
    }

    /// Returns how many segments may be in flight.
    pub fn window(&self) -> usize {
        self.cwnd
    }

    /// Returns the slow-start threshold.
    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    /// Records one newly acked segment.
    pub fn on_ack(&mut self) {
        if self.cwnd >= self.max {
            return;
        }
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            return;
        }
        self.acked_in_window += 1;
        if self.acked_in_window >= self.cwnd {
            self.acked_in_window = 0;
            self.cwnd += 1;
        }
    }

    /// Records a loss event (timeout or fast retransmit).
    pub fn on_loss(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(2);
        self.cwnd = self.ssthresh.max(2);
        self.acked_in_window = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slow_start_doubles_per_round() {
        let mut cwnd = CongestionWindow::new(4, 256);
        for _ in 0..4 {
            cwnd.on_ack();
        }
        assert_eq!(cwnd.window(), 8);
    }

    #[test]
    fn test_additive_increase_above_ssthresh() {
        let mut cwnd = CongestionWindow::new(4, 256);
        // Force a loss so ssthresh drops below the window's growth path.
        for _ in 0..12 {
            cwnd.on_ack();
        }
        cwnd.on_loss();
        let after_loss = cwnd.window();
        assert_eq!(after_loss, cwnd.ssthresh());

        // One full window of acks grows it by exactly one.
        for _ in 0..after_loss {
            cwnd.on_ack();
        }
        assert_eq!(cwnd.window(), after_loss + 1);
    }

    #[test]
    fn test_loss_halves() {
        let mut cwnd = CongestionWindow::new(16, 256);
        cwnd.on_loss();
        assert_eq!(cwnd.window(), 8);
        assert_eq!(cwnd.ssthresh(), 8);
    }

    #[test]
    fn test_window_floor() {
        let mut cwnd = CongestionWindow::new(2, 256);
        for _ in 0..10 {
            cwnd.on_loss();
        }
        assert_eq!(cwnd.window(), 2);
    }

    #[test]
    fn test_window_cap() {
        let mut cwnd = CongestionWindow::new(4, 16);
        for _ in 0..1000 {
            cwnd.on_ack();
        }
        assert_eq!(cwnd.window(), 16);
    }
}
