//! Retry, circuit breaking and failure classification for operations that
//! touch storage or the network.

pub mod circuit_breaker;
pub mod error;
pub mod guard;
pub mod recovery;
pub mod retry;

#[cfg(test)]
mod proptests;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerOptions, CircuitError, CircuitSnapshot, CircuitState,
};
pub use error::{classify_io, classify_message, retry_transient, ErrorKind, TransportError};
pub use guard::{Guard, GuardError, Guarded};
pub use recovery::{RecoveryEvent, RecoveryState, RecoverySupervisor};
pub use retry::{with_retry, AbortHandle, AbortSignal, RetryError, RetryPolicy};
