//! Process-wide entry point for persistent values.
//!
//! The hub binds each logical key to exactly one [`StoreCore`], so every
//! handle for a key (whatever `T` it is typed as) shares one write queue and
//! one backup ring.

use super::codec::Codec;
use super::error::PersistError;
use super::kv::KeyValueStore;
use super::store::{save_into, LoadOptions, LoadOutcome, PersistentStore, StoreCore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tracing::{debug, warn};

pub struct PersistenceHub {
    kv: Arc<dyn KeyValueStore>,
    codec: Arc<Codec>,
    runtime: Handle,
    default_options: LoadOptions,
    stores: Mutex<HashMap<String, Arc<StoreCore>>>,
}

impl PersistenceHub {
    /// Create a hub over `kv`, sealing values with `codec`.
    ///
    /// Must be called from within a Tokio runtime; writer tasks are spawned
    /// onto it.
    pub fn new(kv: Arc<dyn KeyValueStore>, codec: Codec) -> Result<Self, PersistError> {
        let runtime = Handle::try_current().map_err(|_| PersistError::NoRuntime)?;
        Ok(Self {
            kv,
            codec: Arc::new(codec),
            runtime,
            default_options: LoadOptions::default(),
            stores: Mutex::new(HashMap::new()),
        })
    }

    /// Options used for keys first touched through [`save`](Self::save).
    pub fn with_default_options(mut self, options: LoadOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    fn core(&self, key: &str, options: &LoadOptions) -> Arc<StoreCore> {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(core) = stores.get(key) {
            if core.options() != options {
                warn!(key, "key already bound with different options, keeping the first");
            }
            return core.clone();
        }

        debug!(key, ?options, "binding store");
        let core = StoreCore::new(
            key,
            self.kv.clone(),
            self.codec.clone(),
            options.clone(),
            self.runtime.clone(),
        );
        // A zero interval already snapshots on every write
        if options.backup && !options.backup_interval.is_zero() {
            core.start_backup_timer();
        }
        stores.insert(key.to_string(), core.clone());
        core
    }

    /// Typed handle for `key`, returning `default` when nothing usable is
    /// stored.
    pub fn store<T>(&self, key: &str, default: T, options: LoadOptions) -> PersistentStore<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync,
    {
        PersistentStore::from_core(self.core(key, &options), default)
    }

    /// Load `key`, falling back to backups and then to `initial`.
    pub async fn load<T>(&self, key: &str, initial: T, options: LoadOptions) -> T
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync,
    {
        self.store(key, initial, options).load().await
    }

    pub async fn load_with_report<T>(
        &self,
        key: &str,
        initial: T,
        options: LoadOptions,
    ) -> LoadOutcome<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync,
    {
        self.store(key, initial, options).load_with_report().await
    }

    /// Persist `value` under `key`. The write is queued before this returns.
    pub fn save<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> impl Future<Output = Result<(), PersistError>> + Send + 'static {
        let core = self.core(key, &self.default_options);
        save_into(&core, value)
    }

    /// Keys bound in this process.
    pub fn bound_keys(&self) -> Vec<String> {
        let stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = stores.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stop every running backup timer.
    pub fn shutdown(&self) {
        let stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        for core in stores.values() {
            core.stop_backup_timer();
        }
    }
}

impl Drop for PersistenceHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}
