//! Retry logic with exponential backoff for reasoning-engine calls.
//!
//! Only rate-limit responses are retried. Every other failure is returned on
//! the first attempt.

use crate::error::ReasoningError;
use crate::llm::LlmError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use warden_core::config::RetryPolicyConfig;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for each subsequent delay.
    pub backoff_factor: f64,
    /// Upper bound of the random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetryPolicyConfig::default())
    }
}

impl From<&RetryPolicyConfig> for RetryConfig {
    fn from(cfg: &RetryPolicyConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            backoff_factor: cfg.backoff_factor.max(1.0),
            jitter: Duration::from_millis(cfg.jitter_ms),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// Exponential in `attempt`, capped at `max_delay`, plus jitter, and never
    /// shorter than a server-provided `retry-after` hint.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exp = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let base = Duration::from_secs_f64(
            (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64()),
        );
        let delay = base + self.jitter_sample();
        match hint {
            Some(hint) if hint > delay => hint,
            _ => delay,
        }
    }

    fn jitter_sample(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let ms = rand::thread_rng().gen_range(0..max_ms);
        Duration::from_millis(ms)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is exhausted.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    provider_name: &str,
    mut operation: F,
) -> Result<T, ReasoningError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    let mut previous_delay = Duration::ZERO;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("{} succeeded on attempt {}", provider_name, attempt);
                }
                return Ok(value);
            }
            Err(e) if !e.is_rate_limit() => {
                tracing::error!("{} failed on attempt {}: {}", provider_name, attempt, e);
                return Err(ReasoningError::Engine(e));
            }
            Err(e) if attempt >= max_attempts => {
                tracing::error!(
                    "{} still rate limited after {} attempts, giving up",
                    provider_name,
                    attempt
                );
                return Err(ReasoningError::Unavailable {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                // A long retry-after hint raises the floor for every later wait.
                let sleep_time = config.delay_for(attempt, e.retry_after()).max(previous_delay);
                previous_delay = sleep_time;
                tracing::warn!(
                    "{} {} on attempt {}/{}, retrying in {:.1}s",
                    provider_name,
                    e,
                    attempt,
                    max_attempts,
                    sleep_time.as_secs_f64()
                );
                tokio::time::sleep(sleep_time).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: Duration::ZERO,
        }
    }

    fn rate_limited() -> LlmError {
        LlmError::RateLimited {
            status: 429,
            retry_after: None,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let cfg = RetryConfig {
            max_delay: Duration::from_secs(3),
            ..no_jitter()
        };
        assert_eq!(cfg.delay_for(1, None), Duration::from_secs(1));
        assert_eq!(cfg.delay_for(2, None), Duration::from_secs(2));
        assert_eq!(cfg.delay_for(3, None), Duration::from_secs(3));
        assert_eq!(cfg.delay_for(8, None), Duration::from_secs(3));
    }

    #[test]
    fn test_delay_honours_retry_after_hint() {
        let cfg = no_jitter();
        assert_eq!(cfg.delay_for(1, Some(Duration::from_secs(10))), Duration::from_secs(10));
        // A hint shorter than the backoff does not shorten the wait
        assert_eq!(cfg.delay_for(2, Some(Duration::from_millis(10))), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_below_bound() {
        let cfg = RetryConfig {
            jitter: Duration::from_millis(500),
            ..no_jitter()
        };
        for _ in 0..100 {
            let d = cfg.delay_for(1, None);
            assert!(d >= Duration::from_secs(1));
            assert!(d < Duration::from_millis(1500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_rate_limit_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&no_jitter(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LlmError::Api {
                    status: 400,
                    body: "bad request".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(ReasoningError::Engine(LlmError::Api { status: 400, .. }))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_then_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&no_jitter(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(rate_limited())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&no_jitter(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(rate_limited()) }
        })
        .await;
        match result {
            Err(ReasoningError::Unavailable { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.is_rate_limit());
            }
            other => panic!("Expected Unavailable, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_never_shrink_after_long_hint() {
        let cfg = RetryConfig {
            max_attempts: 4,
            ..no_jitter()
        };
        let hints = [Some(Duration::from_secs(10)), None, Some(Duration::from_millis(1))];
        let calls = std::sync::Mutex::new(Vec::new());
        let result: Result<(), _> = with_retry(&cfg, "test", || {
            let mut seen = calls.lock().unwrap();
            let n = seen.len();
            seen.push(tokio::time::Instant::now());
            let hint = hints.get(n).copied().flatten();
            async move {
                Err(LlmError::RateLimited {
                    status: 429,
                    retry_after: hint,
                })
            }
        })
        .await;
        assert!(matches!(result, Err(ReasoningError::Unavailable { attempts: 4, .. })));

        let at = calls.lock().unwrap().clone();
        let gaps: Vec<Duration> = at.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps[0], Duration::from_secs(10));
        assert!(gaps[1] >= gaps[0], "gaps: {:?}", gaps);
        assert!(gaps[2] >= gaps[1], "gaps: {:?}", gaps);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_config() {
        let cfg = RetryConfig {
            max_attempts: 1,
            ..no_jitter()
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&cfg, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(rate_limited()) }
        })
        .await;
        assert!(matches!(result, Err(ReasoningError::Unavailable { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
