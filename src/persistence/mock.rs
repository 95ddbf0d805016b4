//! Scriptable key-value store for testing failure paths.
//!
//! Wraps a [`MemoryStore`] and lets tests inject write failures, read
//! failures and per-key write latency, so that interrupted writes and
//! out-of-order I/O completion can be reproduced deterministically.

use super::kv::{KeyValueStore, KvError, MemoryStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Script {
    fail_sets: usize,
    fail_gets: usize,
    set_delays: HashMap<String, Vec<Duration>>,
}

/// Memory store with injectable faults.
#[derive(Clone, Default)]
pub struct ScriptedStore {
    inner: MemoryStore,
    script: Arc<Mutex<Script>>,
    sets: Arc<AtomicUsize>,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Underlying store, for seeding raw payloads.
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Fail the next `n` calls to `set`.
    pub fn fail_next_sets(&self, n: usize) {
        self.script().fail_sets = n;
    }

    /// Fail the next `n` calls to `get`.
    pub fn fail_next_gets(&self, n: usize) {
        self.script().fail_gets = n;
    }

    /// Delay the next `set` of `key` by `delay` (queued per key).
    pub fn delay_next_set(&self, key: &str, delay: Duration) {
        self.script()
            .set_delays
            .entry(key.to_string())
            .or_default()
            .push(delay);
    }

    /// Number of successful `set` calls so far.
    pub fn set_count(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KeyValueStore for ScriptedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        {
            let mut script = self.script();
            if script.fail_gets > 0 {
                script.fail_gets -= 1;
                return Err(KvError::Unavailable("scripted read failure".to_string()));
            }
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let delay = {
            let mut script = self.script();
            if script.fail_sets > 0 {
                script.fail_sets -= 1;
                return Err(KvError::Unavailable("scripted write failure".to_string()));
            }
            script
                .set_delays
                .get_mut(key)
                .filter(|delays| !delays.is_empty())
                .map(|delays| delays.remove(0))
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.inner.set(key, value).await?;
        self.sets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), KvError> {
        self.inner.remove(key).await
    }

    async fn list_keys(&self) -> Result<Vec<String>, KvError> {
        self.inner.list_keys().await
    }
}
