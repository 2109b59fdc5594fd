use rand::Rng;
use std::time::Duration;

/// Jittered exponential back-off used when a task has to be retried.
///
/// The delay for attempt `n` is `jitter + min(base^n, max)` where `jitter` is drawn
/// uniformly from `[0, max_jitter)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: f64,
    max: Duration,
    max_jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(1.5, Duration::from_secs(30), Duration::from_secs(10))
    }
}

impl Backoff {
    pub fn new(base: f64, max: Duration, max_jitter: Duration) -> Self {
        Self {
            base,
            max,
            max_jitter,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter = rng.r#gen::<f64>() * self.max_jitter.as_secs_f64();
        Duration::from_secs_f64(self.capped_secs(attempt) + jitter)
    }

    /// Deterministic part of the delay, in seconds.
    pub fn capped_secs(&self, attempt: u32) -> f64 {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        self.base.powi(exponent).min(self.max.as_secs_f64())
    }
}
