//! Exponential backoff with jitter for connection establishment.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Backoff tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Delay after failed attempt `attempt` (0-indexed):
    /// `min(base * 2^attempt, max)`, optionally jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .as_secs_f64()
            * 2f64.powi(attempt.min(30) as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let secs = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::from_secs_f64(secs)
    }
}

/// Run `op` until it succeeds or `max_attempts` is exhausted, sleeping
/// between attempts. Returns the last error and the number of attempts made.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &BackoffConfig,
    label: &str,
    mut op: F,
) -> Result<T, (E, u32)>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err((e, attempt));
                }
                let delay = config.delay_for_attempt(attempt - 1);
                warn!(
                    operation = %label,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let config = BackoffConfig { jitter: false, ..Default::default() };
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = BackoffConfig::default();
        for attempt in 0..6 {
            let full = BackoffConfig { jitter: false, ..config }.delay_for_attempt(attempt);
            let d = config.delay_for_attempt(attempt);
            assert!(d <= full);
            assert!(d >= full / 2 - Duration::from_millis(1));
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let config = BackoffConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_attempts: 5,
            jitter: true,
        };
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<u32, (String, u32)> = retry_with_backoff(&config, "test", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err(format!("fail {}", n)) } else { Ok(n) }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let config = BackoffConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_attempts: 4,
            jitter: false,
        };
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), (String, u32)> = retry_with_backoff(&config, "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down".to_string())
        })
        .await;
        let (err, attempts) = result.unwrap_err();
        assert_eq!(err, "down");
        assert_eq!(attempts, 4);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
