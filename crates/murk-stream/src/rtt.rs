//! Round-trip time estimation (RFC 6298).
//!
//! SRTT and RTTVAR follow the standard exponential averages; the timeout is
//! `SRTT + 4 * RTTVAR`, clamped to a sane range. Samples must come from
//! first transmissions only (Karn's rule) — a retransmitted segment's ack is
//! ambiguous and the caller must not feed it here.

use std::time::Duration;

use crate::{RTO_MAX_SECS, RTO_MIN_MS};

/// RTT estimator state.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min: Duration,
    max: Duration,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(RTO_MIN_MS),
            Duration::from_secs(RTO_MAX_SECS),
        )
    }
}

impl RttEstimator {
    /// Creates an estimator with explicit clamp bounds.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            // Conservative until the first sample arrives.
            rto: Duration::from_secs(1),
            min,
            max,
        }
    }

    /// Returns the current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto.clamp(self.min, self.max)
    }

    /// Returns the smoothed RTT, once at least one sample is in.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Feeds one first-transmission RTT sample.
    pub fn on_sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                // RTTVAR = 3/4 RTTVAR + 1/4 |SRTT - R|
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                // SRTT = 7/8 SRTT + 1/8 R
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }
        if let Some(srtt) = self.srtt {
            self.rto = srtt + self.rttvar * 4;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_seeds_estimate() {
        let mut rtt = RttEstimator::default();
        rtt.on_sample(Duration::from_millis(100));
        assert_eq!(rtt.srtt(), Some(Duration::from_millis(100)));
        // RTO = 100 + 4 * 50 = 300 ms.
        assert_eq!(rtt.rto(), Duration::from_millis(300));
    }

    #[test]
    fn test_steady_samples_converge() {
        let mut rtt = RttEstimator::default();
        for _ in 0..50 {
            rtt.on_sample(Duration::from_millis(80));
        }
        let srtt = rtt.srtt().unwrap();
        assert!(srtt >= Duration::from_millis(79) && srtt <= Duration::from_millis(81));
        // Variance decays toward zero, RTO floors out.
        assert_eq!(rtt.rto(), Duration::from_millis(RTO_MIN_MS));
    }

    #[test]
    fn test_rto_clamped_high() {
        let mut rtt = RttEstimator::default();
        rtt.on_sample(Duration::from_secs(30));
        assert_eq!(rtt.rto(), Duration::from_secs(RTO_MAX_SECS));
    }

    #[test]
    fn test_jitter_raises_rto() {
        let mut rtt = RttEstimator::default();
        for _ in 0..10 {
            rtt.on_sample(Duration::from_millis(50));
            rtt.on_sample(Duration::from_millis(250));
        }
        // High variance keeps the timeout well above the smoothed mean.
        assert!(rtt.rto() > rtt.srtt().unwrap());
    }
}
