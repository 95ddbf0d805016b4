//! Retry with exponential backoff, jitter and cancellation.
//!
//! ```text
//! attempt 0 ──fail──► wait d(0) ──► attempt 1 ──fail──► wait d(1) ──► ... attempt max_retries ──fail──► Exhausted
//!            ▲                                                                                    │
//!            └──────── abort (before an attempt or during a wait) ──► Aborted ◄───────────────────┘
//!
//! d(n) = min(initial_delay * backoff_multiplier^n + U(0, jitter), max_delay)
//! ```
//!
//! The operation runs at most `max_retries + 1` times. Errors the caller's
//! predicate rejects are returned after the attempt that produced them.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay (jitter included)
    pub max_delay: Duration,
    /// Growth factor per attempt; values below 1 are treated as 1
    pub backoff_multiplier: f64,
    /// Upper bound of the uniform random delay added per retry
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Short, tight policy for local storage operations.
    pub fn storage() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: Duration::from_millis(25),
        }
    }

    /// Same policy without jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = Duration::ZERO;
        self
    }

    /// Jitter-free delay before retry number `attempt + 1`.
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            1.0
        };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before retry number `attempt + 1`, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_delay(attempt)
            .saturating_add(jitter)
            .min(self.max_delay)
    }
}

/// Why [`with_retry`] gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The abort signal fired before an attempt or during a backoff wait
    #[error("Aborted after {attempts} attempt(s)")]
    Aborted { attempts: u32 },

    /// Every permitted attempt failed
    #[error("Gave up after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    /// The retry predicate declined the error
    #[error("Not retried after {attempts} attempt(s): {last_error}")]
    Rejected { attempts: u32, last_error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Aborted { attempts }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Rejected { attempts, .. } => *attempts,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, RetryError::Aborted { .. })
    }

    /// The last operation error, if the retry was not aborted.
    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Aborted { .. } => None,
            RetryError::Exhausted { last_error, .. } | RetryError::Rejected { last_error, .. } => {
                Some(last_error)
            }
        }
    }
}

/// Owner side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: Some(self.tx.subscribe()),
        }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observer side of a cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_aborted(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves once the signal fires. Pending forever if it cannot fire.
    pub async fn aborted(&self) {
        if let Some(rx) = &self.rx {
            let mut rx = rx.clone();
            if rx.wait_for(|aborted| *aborted).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

/// Run `operation` until it succeeds, the policy is exhausted, the predicate
/// declines an error or `abort` fires.
///
/// # Arguments
///
/// * `operation` - Produces a fresh attempt each call
/// * `policy` - Backoff parameters
/// * `should_retry` - Called with the error and the zero-based attempt index
/// * `abort` - Checked before every attempt and raced against every wait
///
/// # Returns
///
/// The first successful result, or a [`RetryError`] distinguishing
/// cancellation from failure.
pub async fn with_retry<F, Fut, T, E, P>(
    mut operation: F,
    policy: &RetryPolicy,
    should_retry: P,
    abort: &AbortSignal,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E, u32) -> bool,
    E: fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        if abort.is_aborted() {
            debug!(attempt, "retry aborted before attempt");
            return Err(RetryError::Aborted { attempts: attempt });
        }

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let attempts = attempt + 1;

        if !should_retry(&err, attempt) {
            return Err(RetryError::Rejected {
                attempts,
                last_error: err,
            });
        }
        if attempt >= policy.max_retries {
            warn!(attempts, error = %err, "retries exhausted");
            return Err(RetryError::Exhausted {
                attempts,
                last_error: err,
            });
        }

        let delay = policy.delay(attempt);
        warn!(
            attempt = attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "attempt failed, retrying"
        );

        tokio::select! {
            _ = sleep(delay) => {}
            _ = abort.aborted() => {
                debug!(attempt = attempts, "retry aborted during backoff");
                return Err(RetryError::Aborted { attempts });
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::error::{retry_transient, TransportError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn counting_failure(
        calls: &Arc<AtomicU32>,
        message: &'static str,
    ) -> impl FnMut() -> std::future::Ready<Result<u32, TransportError>> {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(TransportError::from_message(message)))
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_immediately() {
        let result = with_retry(
            || async { Ok::<_, TransportError>(42) },
            &RetryPolicy::default(),
            retry_transient,
            &AbortSignal::never(),
        )
        .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();

        let result = with_retry(
            move || {
                let attempt = attempt_clone.clone();
                async move {
                    if attempt.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TransportError::Network("transient".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            },
            &RetryPolicy::default(),
            retry_transient,
            &AbortSignal::never(),
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = with_retry(
            counting_failure(&calls, "bad request"),
            &RetryPolicy::default(),
            retry_transient,
            &AbortSignal::never(),
        )
        .await;

        assert!(matches!(result, Err(RetryError::Rejected { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failures_exhaust_with_increasing_waits() {
        let calls = Arc::new(AtomicU32::new(0));
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default().without_jitter()
        };

        let calls_clone = calls.clone();
        let stamps_clone = stamps.clone();
        let result = with_retry(
            move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                stamps_clone.lock().unwrap().push(Instant::now());
                async { Err::<(), _>(TransportError::Network("unreachable".to_string())) }
            },
            &policy,
            retry_transient,
            &AbortSignal::never(),
        )
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, TransportError::Network("unreachable".to_string()));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stamps = stamps.lock().unwrap();
        let first_wait = stamps[1] - stamps[0];
        let second_wait = stamps[2] - stamps[1];
        assert!(first_wait >= Duration::from_secs(1));
        assert!(second_wait >= Duration::from_secs(2));
        assert!(second_wait > first_wait);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_backoff() {
        let handle = AbortHandle::new();
        let signal = handle.signal();
        let calls = Arc::new(AtomicU32::new(0));

        let retry = tokio::spawn({
            let calls = calls.clone();
            async move {
                with_retry(
                    counting_failure(&calls, "offline"),
                    &RetryPolicy::default(),
                    retry_transient,
                    &signal,
                )
                .await
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        let result = retry.await.unwrap();
        assert!(matches!(result, Err(RetryError::Aborted { attempts: 1 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abort_before_first_attempt() {
        let handle = AbortHandle::new();
        handle.abort();
        let calls = Arc::new(AtomicU32::new(0));

        let result = with_retry(
            counting_failure(&calls, "offline"),
            &RetryPolicy::default(),
            retry_transient,
            &handle.signal(),
        )
        .await;

        assert!(result.unwrap_err().is_aborted());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy::default().without_jitter();
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(2), Duration::from_secs(4));
        assert_eq!(policy.base_delay(10), Duration::from_secs(30));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            jitter: Duration::from_secs(10),
            ..RetryPolicy::default()
        };
        for attempt in 0..8 {
            let delay = policy.delay(attempt);
            assert!(delay >= policy.base_delay(attempt));
            assert!(delay <= policy.max_delay);
        }
    }

    #[test]
    fn test_degenerate_multiplier() {
        let policy = RetryPolicy {
            backoff_multiplier: 0.1,
            ..RetryPolicy::default().without_jitter()
        };
        assert_eq!(policy.base_delay(0), policy.base_delay(5));

        let nan = RetryPolicy {
            backoff_multiplier: f64::NAN,
            ..RetryPolicy::default().without_jitter()
        };
        assert_eq!(nan.base_delay(3), Duration::from_secs(1));
    }
}
