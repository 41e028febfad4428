use std::time::Duration;

use tokio::time::Instant;

/// Sliding-window limiter on upstream model calls, owned by one coordinator.
///
/// A limit of 0 disables it.
#[derive(Debug, Clone)]
pub struct CallRateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Vec<Instant>,
}

impl CallRateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            calls: Vec::new(),
        }
    }

    pub fn per_minute(calls_per_minute: u32) -> Self {
        Self::new(calls_per_minute as usize, Duration::from_secs(60))
    }

    pub fn unlimited() -> Self {
        Self::new(0, Duration::from_secs(60))
    }

    /// Record a call at `now` if the window has room.
    ///
    /// Otherwise returns how long until the oldest call leaves the window.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        if self.max_calls == 0 {
            return Ok(());
        }

        let window = self.window;
        self.calls.retain(|t| now.duration_since(*t) < window);

        if self.calls.len() >= self.max_calls {
            let oldest = self.calls.iter().min().copied().unwrap_or(now);
            return Err(window.saturating_sub(now.duration_since(oldest)));
        }

        self.calls.push(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_reports_wait() {
        let start = Instant::now();
        let mut limiter = CallRateLimiter::new(2, Duration::from_secs(60));

        assert!(limiter.try_acquire(start).is_ok());
        assert!(limiter.try_acquire(start + Duration::from_secs(10)).is_ok());

        let wait = limiter
            .try_acquire(start + Duration::from_secs(20))
            .unwrap_err();
        assert_eq!(wait, Duration::from_secs(40));
    }

    #[test]
    fn window_slides() {
        let start = Instant::now();
        let mut limiter = CallRateLimiter::new(1, Duration::from_secs(60));

        assert!(limiter.try_acquire(start).is_ok());
        assert!(limiter.try_acquire(start + Duration::from_secs(59)).is_err());
        assert!(limiter.try_acquire(start + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn denied_attempts_are_not_recorded() {
        let start = Instant::now();
        let mut limiter = CallRateLimiter::new(1, Duration::from_secs(60));

        assert!(limiter.try_acquire(start).is_ok());
        for s in 1..30 {
            assert!(limiter.try_acquire(start + Duration::from_secs(s)).is_err());
        }
        assert!(limiter.try_acquire(start + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn zero_disables() {
        let now = Instant::now();
        let mut limiter = CallRateLimiter::unlimited();
        for _ in 0..1000 {
            assert!(limiter.try_acquire(now).is_ok());
        }
    }
}
