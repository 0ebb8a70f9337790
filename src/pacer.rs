use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Draws the feeder's pause between polling cycles, uniformly from
/// `[min, max]`.
#[derive(Debug)]
pub struct Pacer {
    min: Duration,
    max: Duration,
    rng: StdRng,
}

impl Pacer {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self::with_rng(min, max, StdRng::from_entropy())
    }

    /// Seeded variant so tests see the same sequence every run.
    pub fn seeded(min: Duration, max: Duration, seed: u64) -> Self {
        Self::with_rng(min, max, StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(min: Duration, max: Duration, rng: StdRng) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self { min, max, rng }
    }

    pub fn next_delay(&mut self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let secs = self
            .rng
            .gen_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}
