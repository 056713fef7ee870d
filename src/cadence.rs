use std::time::Duration;

const FAILURE_FACTOR: f64 = 1.5;
const RECOVERY_FACTOR: f64 = 0.9;
const RECOVERY_STREAK: u32 = 3;

/// Self-tuning refresh interval.
///
/// Backs off quickly when a cycle fails and recovers slowly after a streak of
/// successful cycles. The interval never leaves `[min, max]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Cadence {
    interval: Duration,
    min: Duration,
    max: Duration,
    successes: u32,
}

impl Cadence {
    /// `initial` is clamped into `[min, max]`.
    ///
    /// # Panics
    ///
    /// Panics if `min > max`.
    #[must_use]
    pub fn new(min: Duration, max: Duration, initial: Duration) -> Self {
        Self {
            interval: initial.clamp(min, max),
            min,
            max,
            successes: 0,
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn successes(&self) -> u32 {
        self.successes
    }

    /// Applies the outcome of one cycle and returns the delay before the next.
    pub fn record(&mut self, success: bool) -> Duration {
        if success {
            self.successes += 1;
            if self.successes >= RECOVERY_STREAK {
                self.interval = self.scaled(RECOVERY_FACTOR);
                self.successes = 0;
            }
        } else {
            self.interval = self.scaled(FAILURE_FACTOR);
            self.successes = 0;
        }
        self.interval
    }

    fn scaled(&self, factor: f64) -> Duration {
        self.interval.mul_f64(factor).clamp(self.min, self.max)
    }
}
