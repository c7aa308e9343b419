//! Latency simulation.

use rand::Rng;
use std::time::Duration;

/// A concrete latency specification, with any templated value already
/// resolved to milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latency {
    /// Always the same delay
    Fixed(u64),
    /// Uniformly distributed over `[min, max]`, drawn on every call
    Random { min: u64, max: u64 },
}

impl Latency {
    /// Calculate the delay to apply, in milliseconds.
    pub fn calculate(&self) -> u64 {
        match *self {
            Latency::Fixed(value) => value,
            Latency::Random { min, max } if max > min => {
                rand::thread_rng().gen_range(min..=max)
            }
            // Degenerate range; validation rejects max < min at authoring time
            Latency::Random { min, .. } => min,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.calculate())
    }
}

/// Time still to wait so that the total time since arrival reaches the
/// intended delay. Zero when processing already took longer.
pub fn remaining_delay(intended: Duration, elapsed: Duration) -> Duration {
    intended.saturating_sub(elapsed)
}
