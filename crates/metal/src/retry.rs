//! Retry helpers.

use std::time::Duration;

use tracing::{debug, warn};

/// Retry configuration for operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Policy used for SSH connects: 3 attempts, waiting 2s then 4s.
    #[must_use]
    pub fn ssh_connect() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(4),
            backoff_multiplier: 2.0,
        }
    }

    /// The delays slept between attempts, in order.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        let mut delay = self.initial_delay;
        for _ in 1..self.max_attempts {
            delays.push(delay);
            delay = std::cmp::min(
                self.max_delay,
                Duration::from_secs_f64(delay.as_secs_f64() * self.backoff_multiplier),
            );
        }
        delays
    }
}

/// Execute a function with retry logic.
///
/// `f` receives the 1-based attempt number. The last error is returned
/// once all attempts are exhausted.
///
/// # Errors
/// Returns the error of the final attempt.
pub fn with_retry<T, E, F>(config: &RetryConfig, operation_name: &str, mut f: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Result<T, E>,
{
    let mut delays = config.delays().into_iter();
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(
            operation = operation_name,
            attempt,
            max_attempts = config.max_attempts,
            "Attempting operation"
        );
        match f(attempt) {
            Ok(result) => return Ok(result),
            Err(e) => {
                let Some(delay) = delays.next() else {
                    return Err(e);
                };
                warn!(
                    operation = operation_name,
                    attempt,
                    error = %e,
                    delay = ?delay,
                    "Operation failed, retrying"
                );
                std::thread::sleep(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert!((config.backoff_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ssh_connect_delays() {
        let delays = RetryConfig::ssh_connect().delays();
        assert_eq!(delays, vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[test]
    fn test_with_retry_returns_last_error() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        };
        let mut seen = Vec::new();
        let result: Result<(), String> = with_retry(&config, "test", |attempt| {
            seen.push(attempt);
            Err(format!("attempt {attempt} failed"))
        });
        assert_eq!(result.unwrap_err(), "attempt 3 failed");
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_with_retry_succeeds_eventually() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        };
        let result: Result<u32, String> = with_retry(&config, "test", |attempt| {
            if attempt < 2 {
                Err("not yet".into())
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }
}
