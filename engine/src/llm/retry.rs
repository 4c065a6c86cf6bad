//! Retry policy for LLM calls
//!
//! A call is attempted up to `max_attempts` times. Between attempts the policy
//! sleeps for the backoff delay through a [`Sleeper`], so tests can observe
//! the delays without waiting for them.

use super::Result;
use crate::config::RetryConfig;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sdk::model::iso_timestamp;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pause between attempts
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// Sleeps on the tokio timer
#[derive(Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the failed attempt number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Outcome of the attempt that succeeded
#[derive(Debug)]
pub struct Attempt<T> {
    pub value: T,

    /// Local wall-clock start of the successful attempt
    pub started_at: NaiveDateTime,

    /// Duration of the successful attempt only
    pub duration: Duration,

    /// Attempts made, including the successful one
    pub attempts: u32,
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Backoff::Fixed(Duration::from_secs(3)))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Backoff::Fixed(config.backoff()))
    }

    /// A single attempt, no sleeping
    pub fn no_retry() -> Self {
        Self::new(1, Backoff::Fixed(Duration::ZERO))
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// exhausts the attempts; the last error is returned
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<Attempt<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let started_at = iso_timestamp::now();
            let clock = Instant::now();
            match op().await {
                Ok(value) => {
                    return Ok(Attempt {
                        value,
                        started_at,
                        duration: clock.elapsed(),
                        attempts: attempt,
                    })
                }
                Err(e) if !e.is_retryable() || attempt >= self.max_attempts => {
                    if attempt > 1 {
                        tracing::error!("{} failed after {} attempts: {}", label, attempt, e);
                    }
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {:.1}s",
                        label,
                        attempt,
                        self.max_attempts,
                        e,
                        delay.as_secs_f64()
                    );
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Records requested delays instead of sleeping
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSleeper {
    pub delays: std::sync::Mutex<Vec<Duration>>,
}

#[cfg(test)]
#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, delay: Duration) {
        self.delays.lock().unwrap().push(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LLMError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32, backoff: Backoff) -> (RetryPolicy, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy = RetryPolicy::new(max_attempts, backoff).with_sleeper(sleeper.clone());
        (policy, sleeper)
    }

    #[test]
    fn test_exponential_backoff_caps_at_max() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(4), Duration::from_secs(5));
        assert_eq!(backoff.delay(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let (policy, sleeper) = policy(3, Backoff::Fixed(Duration::from_secs(3)));
        let calls = AtomicU32::new(0);

        let attempt = policy
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(LLMError::Timeout)
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(attempt.value, "done");
        assert_eq!(attempt.attempts, 3);
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![Duration::from_secs(3), Duration::from_secs(3)]
        );
    }

    #[tokio::test]
    async fn test_authentication_failure_is_not_retried() {
        let (policy, sleeper) = policy(5, Backoff::Fixed(Duration::from_secs(1)));
        let calls = AtomicU32::new(0);

        let result: Result<Attempt<()>> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LLMError::AuthenticationFailed("no key".into())) }
            })
            .await;

        assert!(matches!(result, Err(LLMError::AuthenticationFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let (policy, _) = policy(0, Backoff::Fixed(Duration::ZERO));
        let result = policy.run("test", || async { Ok(1) }).await.unwrap();
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_start_time_has_microsecond_precision() {
        use chrono::Timelike;

        let (policy, _) = policy(1, Backoff::Fixed(Duration::ZERO));
        let attempt = policy.run("test", || async { Ok(()) }).await.unwrap();
        assert_eq!(attempt.started_at.nanosecond() % 1_000, 0);
    }
}
