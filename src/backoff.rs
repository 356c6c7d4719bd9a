// ===============================
// src/backoff.rs
// ===============================
use rand::Rng;
use std::time::Duration;

/// Exponential reconnect/retry delay: `min(max, initial * multiplier^attempt)`,
/// optionally spread by ±`jitter` of the delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempt: u32,
}

impl Default for Backoff {
    /// 1s, doubling, capped at 30s.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2.0)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self { initial, max, multiplier: multiplier.max(1.0), jitter: 0.0, attempt: 0 }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay for the current attempt, then advance.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(self.attempt.min(64) as i32);
        let capped = base.min(self.max.as_secs_f64());
        let spread = capped * self.jitter;
        let secs = if spread > 0.0 {
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Call after a successful connect.
    pub fn reset(&mut self) { self.attempt = 0; }

    pub fn attempt(&self) -> u32 { self.attempt }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_one_second_up_to_cap() {
        let mut b = Backoff::default();
        let secs: Vec<u64> = (0..7).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn reset_starts_over() {
        let mut b = Backoff::default();
        b.next_delay();
        b.next_delay();
        assert_eq!(b.attempt(), 2);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_in_band() {
        let mut b = Backoff::new(Duration::from_secs(10), Duration::from_secs(60), 2.0).with_jitter(0.2);
        let d = b.next_delay().as_secs_f64();
        assert!((8.0..=12.0).contains(&d), "delay was {d}");
    }

    #[test]
    fn sub_unity_multiplier_is_clamped() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 0.5);
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }
}
