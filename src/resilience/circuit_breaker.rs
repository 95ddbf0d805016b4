//! Circuit breaker for a degraded dependency.
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────► Open
//!     ▲                                │ reset_timeout elapsed,
//!     │ trial succeeds                 │ next call admitted alone
//!     │                                ▼
//!     └──────────────────────────── HalfOpen
//!                                      │ trial fails
//!                                      └──────────► Open (timer restarts)
//! ```
//!
//! While Open, and while a HalfOpen trial is in flight, calls fail fast with
//! [`CircuitError::Open`] and the wrapped operation is never invoked.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy. Calls flow through.
    Closed,
    /// Tripped. Calls are rejected.
    Open,
    /// Probing. One trial call is allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(name)
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerOptions {
    /// Name used in logs and errors
    pub name: String,
    /// Consecutive failures before opening (default: 5)
    pub failure_threshold: u32,
    /// Time in Open before a trial call is admitted (default: 30s)
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<Instant>,
    pub threshold: u32,
    pub reset_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum CircuitError<E> {
    #[error("Circuit {0:?} is open")]
    Open(String),

    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open(_))
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

pub struct CircuitBreaker {
    options: CircuitBreakerOptions,
    inner: Mutex<BreakerInner>,
    changes: watch::Sender<CircuitState>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.options.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Releases a HalfOpen trial slot if the trial future is dropped unsettled.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(options: CircuitBreakerOptions) -> Self {
        let (changes, _) = watch::channel(CircuitState::Closed);
        Self {
            options: CircuitBreakerOptions {
                failure_threshold: options.failure_threshold.max(1),
                ..options
            },
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                trial_in_flight: false,
            }),
            changes,
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        if inner.state != to {
            info!(circuit = %self.options.name, from = %inner.state, to = %to, "circuit state change");
            inner.state = to;
            self.changes.send_replace(to);
        }
    }

    /// Run `operation` unless the breaker rejects the call.
    ///
    /// # Returns
    ///
    /// The operation's result, [`CircuitError::Inner`] for its failure, or
    /// [`CircuitError::Open`] without invoking it.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit()?;
        let mut guard = TrialGuard {
            breaker: self,
            admission,
            settled: false,
        };

        let result = operation().await;
        match &result {
            Ok(_) => self.on_success(admission),
            Err(_) => self.on_failure(admission),
        }
        guard.settled = true;

        result.map_err(CircuitError::Inner)
    }

    fn admit<E>(&self) -> Result<Admission, CircuitError<E>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let cooled = inner
                    .last_failure_at
                    .map(|at| at.elapsed() >= self.options.reset_timeout)
                    .unwrap_or(true);
                if cooled {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Ok(Admission::Trial)
                } else {
                    Err(CircuitError::Open(self.options.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(CircuitError::Open(self.options.name.clone()))
                } else {
                    inner.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();
        match admission {
            Admission::Trial => {
                inner.trial_in_flight = false;
                inner.failure_count = 0;
                self.transition(&mut inner, CircuitState::Closed);
            }
            Admission::Normal if inner.state == CircuitState::Closed => {
                inner.failure_count = 0;
            }
            Admission::Normal => {}
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        match admission {
            Admission::Trial => {
                inner.trial_in_flight = false;
                inner.failure_count = inner.failure_count.saturating_add(1);
                inner.last_failure_at = Some(Instant::now());
                warn!(circuit = %self.options.name, "trial call failed, reopening");
                self.transition(&mut inner, CircuitState::Open);
            }
            Admission::Normal if inner.state == CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                inner.last_failure_at = Some(Instant::now());
                if inner.failure_count >= self.options.failure_threshold {
                    warn!(
                        circuit = %self.options.name,
                        failures = inner.failure_count,
                        "failure threshold reached, opening"
                    );
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            Admission::Normal => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
            threshold: self.options.failure_threshold,
            reset_timeout: self.options.reset_timeout,
        }
    }

    /// Force the breaker closed and forget past failures.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.last_failure_at = None;
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Receiver of state transitions.
    pub fn subscribe(&self) -> watch::Receiver<CircuitState> {
        self.changes.subscribe()
    }
}
