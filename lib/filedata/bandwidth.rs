//! Transfer-size estimation from measured bandwidth.

use std::time::Duration;

/// Number of measurements averaged together.
const WINDOW: usize = 4;

/// Keeps a short history of bandwidth measurements to size network
/// transfers so one transfer takes roughly the configured target time.
///
/// Not thread safe; callers guard it with whatever lock guards the value
/// being sized.
pub struct BandwidthMeasure {
    target: Duration,
    history: [u64; WINDOW],
    next: usize,
    filled: usize,
}

impl BandwidthMeasure {
    /// Create a measure aiming each transfer at `target` wall time.
    #[must_use]
    pub fn new(target: Duration) -> Self {
        Self {
            target,
            history: [0; WINDOW],
            next: 0,
            filled: 0,
        }
    }

    /// Record that `bytes` took `elapsed`, and return the byte count a
    /// transfer should use to hit the target time: the mean of the last
    /// few scaled measurements.
    pub fn update(&mut self, bytes: u64, elapsed: Duration) -> u64 {
        let elapsed_us = elapsed.as_micros().max(1);
        let target_us = self.target.as_micros().max(1);

        let scaled = (u128::from(bytes) * target_us / elapsed_us).min(u128::from(u64::MAX));
        #[allow(clippy::cast_possible_truncation)]
        let scaled = scaled as u64;

        self.history[self.next] = scaled;
        self.next = (self.next + 1) % WINDOW;
        self.filled = (self.filled + 1).min(WINDOW);

        let sum: u64 = self.history[..self.filled].iter().sum();
        sum / self.filled as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_to_target_time() {
        let mut bw = BandwidthMeasure::new(Duration::from_secs(1));
        // 1 MiB in 100ms -> 10 MiB per second target
        let target = bw.update(1024 * 1024, Duration::from_millis(100));
        assert_eq!(target, 10 * 1024 * 1024);
    }

    #[test]
    fn averages_recent_history() {
        let mut bw = BandwidthMeasure::new(Duration::from_secs(1));
        bw.update(1000, Duration::from_secs(1)); // 1000
        let target = bw.update(3000, Duration::from_secs(1)); // mean(1000, 3000)
        assert_eq!(target, 2000);
    }

    #[test]
    fn window_forgets_old_samples() {
        let mut bw = BandwidthMeasure::new(Duration::from_secs(1));
        bw.update(1_000_000, Duration::from_secs(1));
        for _ in 0..WINDOW {
            bw.update(1000, Duration::from_secs(1));
        }
        // the large first sample has rolled out of the window
        let target = bw.update(1000, Duration::from_secs(1));
        assert_eq!(target, 1000);
    }
}
