//! Sliding replay window over packet counters.
//!
//! Tracks which of the last W counters have been accepted. Counters ahead
//! of the high-water mark advance it; counters within the window are
//! accepted exactly once; counters at or below high-water − W are rejected
//! outright.

use crate::REPLAY_WINDOW;

/// A bounded sliding window of accepted counters.
///
/// Bit `i` of the mask records counter `high_water - i`. Only counters that
/// passed AEAD authentication may be fed to the window.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    high_water: u64,
    mask: u64,
    seen_any: bool,
    width: u64,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(REPLAY_WINDOW)
    }
}

impl ReplayWindow {
    /// Creates a window of the given width (at most 64).
    pub fn new(width: u64) -> Self {
        Self {
            high_water: 0,
            mask: 0,
            seen_any: false,
            width: width.min(64),
        }
    }

    /// Returns the highest counter accepted so far, if any.
    pub fn high_water(&self) -> Option<u64> {
        self.seen_any.then_some(self.high_water)
    }

    /// Accepts a counter exactly once.
    ///
    /// Returns true if the counter is new; false if it was already accepted
    /// or has fallen out of the window.
    pub fn check_and_update(&mut self, counter: u64) -> bool {
        if !self.seen_any {
            self.high_water = counter;
            self.mask = 1;
            self.seen_any = true;
            return true;
        }

        if counter > self.high_water {
            let advance = counter - self.high_water;
            if advance >= 64 {
                self.mask = 0;
            } else {
                self.mask <<= advance;
            }
            self.mask |= 1;
            self.high_water = counter;
            return true;
        }

        let behind = self.high_water - counter;
        if behind >= self.width {
            return false;
        }

        let bit = 1u64 << behind;
        if self.mask & bit != 0 {
            return false;
        }
        self.mask |= bit;
        true
    }
}
