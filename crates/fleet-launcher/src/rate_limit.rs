//! Minimum-interval rate limiter for provider API dispatches.

use std::time::Duration;

use tokio::time::Instant;

/// Longest interval a limiter will enforce.
pub const MAX_INTERVAL: Duration = Duration::from_secs(3600);

/// Spaces dispatches at least `interval` apart, measured between starts.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Limiter allowing `rate` dispatches per second. A non-positive or
    /// non-finite rate disables limiting; rates slower than one dispatch per
    /// `MAX_INTERVAL` are clamped to it.
    pub fn from_rate(rate: f64) -> Self {
        if !(rate > 0.0 && rate.is_finite()) {
            return Self::new(Duration::ZERO);
        }
        let interval = Duration::try_from_secs_f64(1.0 / rate)
            .map_or(MAX_INTERVAL, |interval| interval.min(MAX_INTERVAL));
        Self::new(interval)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleep until the next dispatch is allowed. Returns how long it slept.
    pub async fn wait(&self) -> Duration {
        let Some(last) = self.last else {
            return Duration::ZERO;
        };
        let next = last + self.interval;
        let now = Instant::now();
        if next <= now {
            return Duration::ZERO;
        }
        tokio::time::sleep_until(next).await;
        next - now
    }

    /// Record a dispatch starting now.
    pub fn mark(&mut self) {
        self.last = Some(Instant::now());
    }
}
