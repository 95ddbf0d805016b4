//! Guarded calls: retry + circuit breaker + connectivity, with a fallback.
//!
//! A guarded call never surfaces an error by itself. Callers declare the
//! value to use when the dependency is unavailable and get it back together
//! with the reason.

use super::circuit_breaker::{CircuitBreaker, CircuitError};
use super::error::{ErrorKind, TransportError};
use super::retry::{with_retry, AbortSignal, RetryError, RetryPolicy};
use crate::network::NetworkMonitor;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a guarded call returned its fallback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("Network is offline")]
    Offline,

    #[error("Circuit {0:?} is open")]
    CircuitOpen(String),

    #[error("Aborted")]
    Aborted,

    #[error("Failed after {attempts} attempt(s) ({kind}): {message}")]
    Failed {
        attempts: u32,
        kind: ErrorKind,
        message: String,
    },
}

/// Result of a guarded call.
#[derive(Debug, Clone, PartialEq)]
pub enum Guarded<T> {
    Value(T),
    Fallback { value: T, error: GuardError },
}

impl<T> Guarded<T> {
    pub fn into_value(self) -> T {
        match self {
            Guarded::Value(value) | Guarded::Fallback { value, .. } => value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Guarded::Fallback { .. })
    }

    pub fn error(&self) -> Option<&GuardError> {
        match self {
            Guarded::Value(_) => None,
            Guarded::Fallback { error, .. } => Some(error),
        }
    }
}

/// Composition of a breaker, a retry policy and (optionally) a monitor.
#[derive(Clone)]
pub struct Guard {
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    monitor: Option<Arc<NetworkMonitor>>,
    abort: AbortSignal,
}

impl Guard {
    pub fn new(breaker: Arc<CircuitBreaker>, policy: RetryPolicy) -> Self {
        Self {
            breaker,
            policy,
            monitor: None,
            abort: AbortSignal::never(),
        }
    }

    /// Skip the call entirely while `monitor` reports no connectivity.
    pub fn with_monitor(mut self, monitor: Arc<NetworkMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `operation`, returning `fallback` if it cannot produce a value.
    ///
    /// Transient failures are retried per the policy. An open circuit is
    /// returned at once without spending retries.
    pub async fn call<F, Fut, T>(&self, mut operation: F, fallback: T) -> Guarded<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        if let Some(monitor) = &self.monitor {
            if !monitor.network_state().is_connected {
                debug!(circuit = %self.breaker.name(), "offline, using fallback");
                return Guarded::Fallback {
                    value: fallback,
                    error: GuardError::Offline,
                };
            }
        }

        let breaker = &self.breaker;
        let result = with_retry(
            move || {
                let attempt = operation();
                breaker.execute(move || attempt)
            },
            &self.policy,
            |err: &CircuitError<TransportError>, _| match err {
                CircuitError::Open(_) => false,
                CircuitError::Inner(e) => e.is_transient(),
            },
            &self.abort,
        )
        .await;

        let error = match result {
            Ok(value) => return Guarded::Value(value),
            Err(RetryError::Aborted { .. }) => GuardError::Aborted,
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            })
            | Err(RetryError::Rejected {
                attempts,
                last_error,
            }) => match last_error {
                CircuitError::Open(name) => GuardError::CircuitOpen(name),
                CircuitError::Inner(e) => GuardError::Failed {
                    attempts,
                    kind: e.kind(),
                    message: e.to_string(),
                },
            },
        };

        warn!(circuit = %self.breaker.name(), %error, "guarded call degraded to fallback");
        Guarded::Fallback {
            value: fallback,
            error,
        }
    }
}
