//! Connection retry with exponential backoff
//!
//! Only connection establishment is retried. Authentication failures, missing
//! databases and other permanent errors are returned on the first attempt, and
//! nothing past setup is ever retried internally.

use crate::connection::PgReplicationConnection;
use crate::error::{CaptureError, Result};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Configuration for retry logic
///
/// # Example
///
/// ```
/// use pg_capture::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig {
///     max_attempts: 3,
///     initial_delay: Duration::from_millis(250),
///     ..RetryConfig::default()
/// };
/// assert_eq!(config.max_delay, Duration::from_secs(60));
/// ```
#[derive(Debug, Copy, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Maximum total duration for all attempts
    pub max_duration: Duration,
    /// Randomize delays by ±30%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_duration: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self)
    }
}

/// Exponential backoff state
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    current_delay: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.multiplier,
            jitter: config.jitter,
            current_delay: config.initial_delay,
            attempt: 0,
        }
    }

    /// Return the current delay and grow it for the next call
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;

        let next_ms = (self.current_delay.as_millis() as f64 * self.multiplier) as u64;
        self.current_delay = Duration::from_millis(next_ms).min(self.max_delay);
        self.attempt += 1;

        if self.jitter {
            add_jitter(delay)
        } else {
            delay
        }
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// ±30%, seeded from the clock's sub-second nanos
fn add_jitter(delay: Duration) -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    let base = delay.as_millis() as f64;
    let spread = base * 0.3;
    let unit = (nanos % 1000) as f64 / 1000.0;
    let millis = (base + (unit - 0.5) * 2.0 * spread).max(0.0) as u64;
    Duration::from_millis(millis)
}

/// Run `op` until it succeeds, fails permanently, or the budget is spent
///
/// Only errors for which [`CaptureError::is_transient`] holds are retried.
pub async fn retry_transient<T, F>(config: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let start = Instant::now();
    let mut backoff = config.to_backoff();
    let max_attempts = config.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        debug!("{} (attempt {}/{})", what, attempt, max_attempts);

        match op() {
            Ok(value) => {
                if attempt > 1 {
                    info!("{} succeeded on attempt {} after {:?}", what, attempt, start.elapsed());
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => {
                error!("{} failed permanently: {}", what, e);
                return Err(e);
            }
            Err(e) => {
                if attempt >= max_attempts {
                    error!("{} failed after {} attempts: {}", what, attempt, e);
                    return Err(e);
                }
                let delay = backoff.next_delay();
                if start.elapsed() + delay >= config.max_duration {
                    error!(
                        "{} exceeded maximum retry duration of {:?}: {}",
                        what, config.max_duration, e
                    );
                    return Err(e);
                }
                warn!("{} attempt {} failed: {}; retrying in {:?}", what, attempt, e, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(CaptureError::transient_connection(format!(
        "{what} failed after all retry attempts"
    )))
}

/// Connect to PostgreSQL, retrying transient failures
pub async fn connect_with_retry(
    config: &RetryConfig,
    conninfo: &str,
) -> Result<PgReplicationConnection> {
    retry_transient(config, "Connecting to PostgreSQL", || {
        PgReplicationConnection::connect(conninfo)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_duration: Duration::from_secs(300),
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_backoff_progression() {
        let mut backoff = ExponentialBackoff::new(&fixed(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        // Capped at max_delay
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.attempt(), 5);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig {
            jitter: true,
            ..fixed(5)
        };
        let mut backoff = ExponentialBackoff::new(&config);
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(650), "{delay:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let mut calls = 0;
        let result = retry_transient(&fixed(5), "op", || {
            calls += 1;
            if calls < 3 {
                Err(CaptureError::transient_connection("refused"))
            } else {
                Ok(calls)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<()> = retry_transient(&fixed(5), "op", || {
            calls += 1;
            Err(CaptureError::authentication("bad password"))
        })
        .await;

        assert!(matches!(result, Err(CaptureError::Authentication(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let mut calls = 0;
        let result: Result<()> = retry_transient(&fixed(3), "op", || {
            calls += 1;
            Err(CaptureError::transient_connection("timeout"))
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_is_honoured() {
        let config = RetryConfig {
            max_duration: Duration::from_millis(250),
            ..fixed(10)
        };
        let mut calls = 0;
        let result: Result<()> = retry_transient(&config, "op", || {
            calls += 1;
            Err(CaptureError::transient_connection("timeout"))
        })
        .await;

        assert!(result.is_err());
        // 100ms then 200ms would exceed 250ms
        assert_eq!(calls, 2);
    }
}
