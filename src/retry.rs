//! Reconnection Backoff
//!
//! Exponential backoff with jitter, used while the session to the
//! coordination store is suspended.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// `None` retries forever
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Retry forever, capped at 30 seconds between attempts
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            max_retries: None,
        }
    }

    /// Short delays for tests and embedded runs
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            factor: 2.0,
            max_retries: None,
        }
    }

    /// Delay after `delay`, before jitter. Saturates at `max_delay` when
    /// the product is not representable.
    fn next_delay(&self, delay: Duration) -> Duration {
        scaled(delay, self.factor).unwrap_or(self.max_delay).min(self.max_delay)
    }
}

/// `delay * factor`, or `None` on NaN, negative or overflowing results
fn scaled(delay: Duration, factor: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).ok()
}

/// Add up to 20% random jitter so clients do not reconnect in lockstep
fn jittered(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    scaled(delay, 1.0 + rng.gen_range(0.0..0.2)).unwrap_or(delay)
}

/// Run `operation` until it succeeds, `should_retry` rejects the error,
/// or the attempt budget is spent.
pub async fn retry<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    tracing::info!("{} succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !should_retry(&err) {
                    return Err(err);
                }
                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                }

                let wait = jittered(delay);
                tracing::warn!(
                    "{} failed (attempt {}): {}. Retrying in {:?}",
                    operation_name,
                    attempts,
                    err,
                    wait
                );

                sleep(wait).await;
                delay = config.next_delay(delay);
            }
        }
    }
}
