use rand::Rng;
use std::time::Duration;

/// Exponential backoff with full jitter, centralized per call-site instead
/// of re-implemented at each reconnect loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            max_attempts: None,
            attempt: 0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Resets the attempt counter. Called on every successful transition
    /// back into a ready/connected state.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns `None` once `max_attempts` is exhausted, otherwise the next
    /// delay to wait before retrying and advances the internal counter.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let exp = self.base.as_millis().saturating_mul(1u128 << self.attempt.min(30));
        let capped = exp.min(self.cap.as_millis());
        let jittered = if capped == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=capped)
        };
        self.attempt = self.attempt.saturating_add(1);
        Some(Duration::from_millis(jittered as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_never_exceed_cap() {
        let mut b = Backoff::new(Duration::from_millis(10), Duration::from_millis(100));
        for _ in 0..20 {
            let d = b.next_delay().unwrap();
            assert!(d <= Duration::from_millis(100));
        }
    }

    #[test]
    fn reset_restarts_growth() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..5 {
            b.next_delay();
        }
        b.reset();
        assert_eq!(b.attempt, 0);
    }

    #[test]
    fn max_attempts_exhausts() {
        let mut b = Backoff::new(Duration::from_millis(1), Duration::from_millis(10))
            .with_max_attempts(3);
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_none());
    }
}
