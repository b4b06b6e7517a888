use std::time::{Duration, Instant};

/// Per-identity sliding counter.
///
/// Expired windows are reset lazily on the next check rather than swept
/// eagerly; the periodic cleanup pass only evicts windows that have been
/// idle longer than twice the window period.
#[derive(Debug)]
pub struct SlidingWindow {
    window_start: Instant,
    count: u32,
    last_seen: Instant,
}

impl SlidingWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 1,
            last_seen: now,
        }
    }

    /// Count one request against `limit` within `period`.
    ///
    /// Rejection is idempotent: once the window is full, further calls are
    /// rejected without touching the counter, so a burst of rejected calls
    /// cannot corrupt it.
    pub fn check_and_increment(&mut self, limit: u32, period: Duration, now: Instant) -> bool {
        self.last_seen = now;

        if now.duration_since(self.window_start) >= period {
            self.window_start = now;
            self.count = 1;
            return true;
        }

        if self.count < limit {
            self.count += 1;
            true
        } else {
            false
        }
    }

    /// Seconds until the current window rolls over.
    pub fn retry_after(&self, period: Duration, now: Instant) -> u64 {
        period
            .saturating_sub(now.duration_since(self.window_start))
            .as_secs()
            .max(1)
    }

    pub fn idle_since(&self, now: Instant) -> Duration {
        now.duration_since(self.last_seen)
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_limit() {
        let start = Instant::now();
        let period = Duration::from_secs(60);
        let mut window = SlidingWindow::new(start);

        // First request is counted by `new`.
        for _ in 1..5 {
            assert!(window.check_and_increment(5, period, start));
        }
        assert!(!window.check_and_increment(5, period, start));
        assert_eq!(window.count(), 5);
    }

    #[test]
    fn test_rejection_is_idempotent() {
        let start = Instant::now();
        let period = Duration::from_secs(60);
        let mut window = SlidingWindow::new(start);

        for _ in 1..3 {
            window.check_and_increment(3, period, start);
        }
        // A burst of rejected calls leaves the counter untouched.
        for _ in 0..10 {
            assert!(!window.check_and_increment(3, period, start));
        }
        assert_eq!(window.count(), 3);
    }

    #[test]
    fn test_expired_window_resets_lazily() {
        let start = Instant::now();
        let period = Duration::from_secs(60);
        let mut window = SlidingWindow::new(start);

        for _ in 1..3 {
            window.check_and_increment(3, period, start);
        }
        assert!(!window.check_and_increment(3, period, start));

        let later = start + Duration::from_secs(61);
        assert!(window.check_and_increment(3, period, later));
        assert_eq!(window.count(), 1);
    }

    #[test]
    fn test_retry_after_counts_down() {
        let start = Instant::now();
        let period = Duration::from_secs(60);
        let window = SlidingWindow::new(start);

        assert_eq!(window.retry_after(period, start), 60);
        assert_eq!(window.retry_after(period, start + Duration::from_secs(45)), 15);
        // Never reports zero while the window is still rejecting.
        assert_eq!(window.retry_after(period, start + Duration::from_secs(60)), 1);
    }
}
