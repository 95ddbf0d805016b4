//! Property-based tests for backoff and retry bounds

use super::error::TransportError;
use super::retry::{with_retry, AbortSignal, RetryError, RetryPolicy};
use proptest::prelude::*;
use std::cell::Cell;
use std::time::Duration;

fn policy() -> impl Strategy<Value = RetryPolicy> {
    (
        0u32..8,
        0u64..5_000,
        0u64..120_000,
        1.0f64..4.0,
        0u64..2_000,
    )
        .prop_map(|(max_retries, initial, max, multiplier, jitter)| RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(initial),
            max_delay: Duration::from_millis(max),
            backoff_multiplier: multiplier,
            jitter: Duration::from_millis(jitter),
        })
}

proptest! {
    /// Property: jitter-free delays are non-decreasing and capped
    #[test]
    fn backoff_is_monotonic_and_capped(policy in policy(), attempt in 0u32..64) {
        let here = policy.base_delay(attempt);
        let next = policy.base_delay(attempt + 1);

        prop_assert!(here <= next, "delay shrank: {:?} -> {:?}", here, next);
        prop_assert!(next <= policy.max_delay);
    }

    /// Property: jittered delays never exceed max_delay
    #[test]
    fn jittered_delay_is_capped(policy in policy(), attempt in any::<u32>()) {
        prop_assert!(policy.delay(attempt) <= policy.max_delay);
    }

    /// Property: the operation runs at most max_retries + 1 times and the
    /// last error is returned
    #[test]
    fn retry_invocations_are_bounded(max_retries in 0u32..6) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        let calls = Cell::new(0u32);
        let policy = RetryPolicy { max_retries, ..RetryPolicy::default() };

        let result = rt.block_on(with_retry(
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { Err::<(), _>(TransportError::Network(format!("failure {}", n))) }
            },
            &policy,
            |_, _| true,
            &AbortSignal::never(),
        ));

        prop_assert_eq!(calls.get(), max_retries + 1);
        match result {
            Err(RetryError::Exhausted { attempts, last_error }) => {
                prop_assert_eq!(attempts, max_retries + 1);
                prop_assert_eq!(last_error, TransportError::Network(format!("failure {}", max_retries + 1)));
            }
            other => prop_assert!(false, "unexpected result {:?}", other),
        }
    }
}
