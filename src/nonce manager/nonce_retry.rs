use super::nonce_errors::{NonceError, NonceResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry configuration with jitter
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including initial attempt)
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds
    pub base_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 5000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Fixed spacing between attempts, used for receipt polling
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            base_backoff_ms: ms,
            max_backoff_ms: ms,
            jitter_factor: 0.0,
        }
    }

    /// Calculate backoff delay for a given attempt (0-indexed)
    fn calculate_backoff(&self, attempt: u32) -> Duration {
        // Exponential backoff: base * 2^attempt
        let exp_backoff = (self.base_backoff_ms as f64) * 2_f64.powi(attempt as i32);
        let capped_backoff = exp_backoff.min(self.max_backoff_ms as f64);

        let jitter_range = capped_backoff * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_backoff = (capped_backoff + jitter).max(0.0);

        Duration::from_millis(final_backoff as u64)
    }
}

/// Retry an async operation with exponential backoff and jitter.
///
/// Transient errors (see [`NonceError::is_transient`]) trigger another attempt;
/// permanent errors return immediately.
pub async fn retry_with_backoff<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> NonceResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = NonceResult<T>>,
{
    let start_time = std::time::Instant::now();
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        if attempt > 0 {
            debug!(
                operation = operation_name,
                attempt = attempt + 1,
                max_attempts = config.max_attempts,
                "Retrying operation"
            );
        }

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        duration_ms = start_time.elapsed().as_millis() as u64,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_transient() {
                    warn!(
                        operation = operation_name,
                        error = %err,
                        "Permanent error, not retrying"
                    );
                    return Err(err);
                }

                last_error = Some(err);

                if attempt + 1 < config.max_attempts {
                    let backoff = config.calculate_backoff(attempt);
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "Transient error, backing off before retry"
                    );
                    sleep(backoff).await;
                } else {
                    warn!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        error = ?last_error,
                        "All retry attempts exhausted"
                    );
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| NonceError::Internal("Retry exhausted without error".to_string())))
}
