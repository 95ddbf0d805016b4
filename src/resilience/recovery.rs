//! Crash-recovery state machine.
//!
//! ## Design
//!
//! State transitions are a pure reducer over [`RecoveryEvent`]s so they can
//! be tested without timers. [`RecoverySupervisor`] drives the reducer and
//! owns the delayed-retry task; dropping or resetting the supervisor aborts
//! any pending retry.
//!
//! ```text
//!            ErrorCaught            RetryScheduled
//!  healthy ──────────────► error ─────────────────► recovering
//!     ▲                      ▲                          │
//!     │   RetrySucceeded     │      RetryFailed         │
//!     └──────────────────────┼──────────────────────────┤
//!                            └──────────────────────────┘
//!  Reset: any state ──► healthy
//! ```

use super::retry::RetryPolicy;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryEvent {
    ErrorCaught(String),
    RetryScheduled,
    RetrySucceeded,
    RetryFailed(String),
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryState {
    pub has_error: bool,
    pub retry_count: u32,
    pub recovering: bool,
    pub last_error: Option<String>,
    pub max_retries: u32,
}

impl RecoveryState {
    pub fn new(max_retries: u32) -> Self {
        Self {
            has_error: false,
            retry_count: 0,
            recovering: false,
            last_error: None,
            max_retries,
        }
    }

    /// Whether another automatic retry is permitted.
    pub fn can_retry(&self) -> bool {
        self.has_error && !self.recovering && self.retry_count < self.max_retries
    }

    pub fn reduce(&self, event: RecoveryEvent) -> Self {
        match event {
            RecoveryEvent::ErrorCaught(error) => Self {
                has_error: true,
                recovering: false,
                last_error: Some(error),
                ..self.clone()
            },
            RecoveryEvent::RetryScheduled if self.can_retry() => Self {
                recovering: true,
                ..self.clone()
            },
            RecoveryEvent::RetryScheduled => self.clone(),
            RecoveryEvent::RetrySucceeded | RecoveryEvent::Reset => Self::new(self.max_retries),
            RecoveryEvent::RetryFailed(error) => Self {
                has_error: true,
                recovering: false,
                retry_count: self.retry_count.saturating_add(1),
                last_error: Some(error),
                max_retries: self.max_retries,
            },
        }
    }
}

struct Shared {
    state: Mutex<RecoveryState>,
    changes: watch::Sender<RecoveryState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RecoveryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, event: RecoveryEvent) -> RecoveryState {
        let mut state = self.lock();
        *state = state.reduce(event);
        self.changes.send_replace(state.clone());
        state.clone()
    }
}

/// Drives [`RecoveryState`] and owns the delayed retry task.
pub struct RecoverySupervisor {
    shared: Arc<Shared>,
    policy: RetryPolicy,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RecoverySupervisor {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

impl RecoverySupervisor {
    /// `policy.max_retries` bounds automatic retries; its backoff spaces them.
    pub fn new(policy: RetryPolicy) -> Self {
        let initial = RecoveryState::new(policy.max_retries);
        let (changes, _) = watch::channel(initial.clone());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(initial),
                changes,
            }),
            policy,
            pending: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.shared.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecoveryState> {
        self.shared.changes.subscribe()
    }

    fn cancel_pending(&self) {
        if let Some(handle) = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    /// Record a failure and schedule `attempt` with backoff until it
    /// succeeds or the retry budget is spent. Replaces any pending retry.
    pub fn report_error<F, Fut>(&self, error: impl Into<String>, mut attempt: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send,
    {
        self.cancel_pending();
        let error = error.into();
        warn!(%error, "error caught, entering recovery");
        self.shared.dispatch(RecoveryEvent::ErrorCaught(error));

        let shared = self.shared.clone();
        let policy = self.policy.clone();
        let handle = tokio::spawn(async move {
            loop {
                let current = shared.lock().clone();
                if !current.can_retry() {
                    warn!(retries = current.retry_count, "recovery retries exhausted, awaiting reset");
                    break;
                }
                shared.dispatch(RecoveryEvent::RetryScheduled);

                tokio::time::sleep(policy.delay(current.retry_count)).await;

                match attempt().await {
                    Ok(()) => {
                        info!(retries = current.retry_count, "recovered");
                        shared.dispatch(RecoveryEvent::RetrySucceeded);
                        break;
                    }
                    Err(e) => {
                        shared.dispatch(RecoveryEvent::RetryFailed(e));
                    }
                }
            }
        });

        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Cancel any pending retry and return to the healthy state.
    pub fn reset(&self) {
        self.cancel_pending();
        self.shared.dispatch(RecoveryEvent::Reset);
    }
}
