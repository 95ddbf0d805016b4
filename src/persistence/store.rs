//! Per-key persistent store: load with recovery, save with backup.
//!
//! ## Load (total)
//!
//! ```text
//! flush pending writes
//!      │
//!      ▼
//! raw = kv.get(key) ──► classify ──► Candidate ──► StorageRecord ──► codec.open ──► decode T
//!      │                   │                            │                 │             │
//!      │ io error          │ Empty / Corrupted          │ not a record    │ crypto      │ shape
//!      ▼                   ▼                            ▼                 ▼             ▼
//!      └──────────────► backups newest first ◄── legacy plaintext? ◄──────┴─────────────┘
//!                              │                      │ yes: migrate (encrypted re-write)
//!                              ▼
//!                 first snapshot that decodes ──► heal primary
//!                              │ none
//!                              ▼
//!                       caller's default
//! ```
//!
//! ## Save (serialized per key)
//!
//! `save` serializes and seals synchronously, then enqueues onto the key's
//! FIFO writer at call time. The writer applies jobs one at a time, so the
//! write enqueued last is the value left in storage, whatever order the
//! callers' futures are polled in.

use super::backup::{BackupError, BackupRotator, DEFAULT_RETENTION};
use super::codec::{Codec, Envelope, Opened};
use super::error::{CorruptionError, PersistError};
use super::kv::{KeyValueStore, KvError};
use super::record::StorageRecord;
use super::validator::{classify, Classification};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default interval between backup snapshots
pub const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(60);

/// Shortest period the backup timer will tick at
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(100);

/// Per-key persistence options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    /// Seal values with the codec (otherwise version 0 plain envelopes)
    pub encryption: bool,
    /// Maintain rotating backup snapshots
    pub backup: bool,
    /// Minimum time between two snapshots
    pub backup_interval: Duration,
    /// Generations kept in the backup ring
    pub retention: u32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            encryption: true,
            backup: true,
            backup_interval: DEFAULT_BACKUP_INTERVAL,
            retention: DEFAULT_RETENTION,
        }
    }
}

/// Where a loaded value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// The primary record decoded cleanly
    Primary,
    /// A legacy plaintext value was found and re-written sealed
    Migrated,
    /// The primary was unusable; a snapshot was used and written back
    Backup { generation: u32 },
    /// Nothing usable; the caller's default was returned
    Default,
}

impl fmt::Display for LoadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadSource::Primary => write!(f, "primary"),
            LoadSource::Migrated => write!(f, "migrated legacy plaintext"),
            LoadSource::Backup { generation } => write!(f, "backup generation {}", generation),
            LoadSource::Default => write!(f, "default"),
        }
    }
}

/// A loaded value together with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOutcome<T> {
    pub value: T,
    pub source: LoadSource,
}

enum WriteJob {
    Write {
        payload: String,
        done: oneshot::Sender<Result<(), KvError>>,
    },
    /// Recovery re-write, dropped if a caller write was enqueued since the
    /// load that produced it
    Heal {
        payload: String,
        expected_writes: u64,
        done: oneshot::Sender<()>,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
}

/// Type-erased store state shared by every handle bound to one key.
pub(crate) struct StoreCore {
    key: String,
    kv: Arc<dyn KeyValueStore>,
    codec: Arc<Codec>,
    options: LoadOptions,
    runtime: Handle,
    writer: mpsc::UnboundedSender<WriteJob>,
    /// Caller writes enqueued so far
    writes: Arc<AtomicU64>,
    backups: tokio::sync::Mutex<BackupRotator>,
    last_backup: Mutex<Option<Instant>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreCore {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.timer).take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl StoreCore {
    pub(crate) fn new(
        key: &str,
        kv: Arc<dyn KeyValueStore>,
        codec: Arc<Codec>,
        options: LoadOptions,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<StoreCore>| {
            let (tx, rx) = mpsc::unbounded_channel();
            let writes = Arc::new(AtomicU64::new(0));

            runtime.spawn(run_writer(
                key.to_string(),
                kv.clone(),
                rx,
                weak.clone(),
                writes.clone(),
            ));

            Self {
                key: key.to_string(),
                backups: tokio::sync::Mutex::new(BackupRotator::new(
                    kv.clone(),
                    key,
                    options.retention,
                )),
                kv,
                codec,
                options,
                runtime,
                writer: tx,
                writes,
                last_backup: Mutex::new(None),
                timer: Mutex::new(None),
            }
        })
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Seal plaintext into a serialized record according to the options.
    fn seal(&self, plaintext: &[u8]) -> Result<String, PersistError> {
        let envelope = if self.options.encryption {
            self.codec.encrypt(plaintext)?
        } else {
            Envelope::plain(plaintext)
        };
        StorageRecord::new(&self.key, envelope)
            .to_json()
            .map_err(|e| PersistError::Serialize(e.to_string()))
    }

    /// Whether an opened primary should be re-sealed with current settings.
    fn needs_reseal(&self, opened: &Opened) -> bool {
        self.options.encryption
            && (opened.retired_key || opened.version != self.codec.current_version())
    }

    /// Seal and enqueue a caller write. The position in the queue is fixed
    /// before this returns.
    pub(crate) fn enqueue_write(
        &self,
        plaintext: &[u8],
    ) -> Result<oneshot::Receiver<Result<(), KvError>>, PersistError> {
        let payload = self.seal(plaintext)?;
        let (done, rx) = oneshot::channel();

        self.writes.fetch_add(1, Ordering::SeqCst);
        self.writer
            .send(WriteJob::Write { payload, done })
            .map_err(|_| PersistError::WriterClosed(self.key.clone()))?;
        Ok(rx)
    }

    /// Wait for every write enqueued before this call to be applied.
    pub(crate) async fn flush(&self) {
        let (done, rx) = oneshot::channel();
        if self.writer.send(WriteJob::Flush { done }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Re-write the primary after recovery unless a caller write overtook it.
    async fn heal(&self, plaintext: &[u8], expected_writes: u64, reason: &str) {
        let payload = match self.seal(plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %self.key, error = %e, "could not re-seal recovered value");
                return;
            }
        };

        let (done, rx) = oneshot::channel();
        let job = WriteJob::Heal {
            payload,
            expected_writes,
            done,
        };
        if self.writer.send(job).is_ok() {
            let _ = rx.await;
            debug!(key = %self.key, reason, "primary record re-written");
        }
    }

    /// Total load. `decode` turns plaintext into the caller's value.
    pub(crate) async fn load_with<V, F>(&self, decode: F) -> Option<(V, LoadSource)>
    where
        F: Fn(&[u8]) -> Result<V, String> + Send + Sync,
        V: Send,
    {
        self.flush().await;
        let observed_writes = self.writes.load(Ordering::SeqCst);

        let raw = match self.kv.get(&self.key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %self.key, error = %e, "primary read failed, trying backups");
                return self.recover_from_backups(&decode, observed_writes).await;
            }
        };

        match classify(raw.as_deref()) {
            Classification::Empty => {
                debug!(key = %self.key, "no primary value");
            }
            Classification::Corrupted(reason) => {
                warn!(key = %self.key, %reason, "primary payload corrupted");
            }
            Classification::Candidate => {
                let raw = raw.as_deref().unwrap_or_default();
                match self.decode_primary(raw, &decode) {
                    Ok((value, opened)) => {
                        if self.needs_reseal(&opened) {
                            info!(
                                key = %self.key,
                                version = opened.version as u8,
                                retired_key = opened.retired_key,
                                "re-encrypting record with current key and cipher"
                            );
                            self.heal(&opened.plaintext, observed_writes, "reseal")
                                .await;
                        }
                        return Some((value, LoadSource::Primary));
                    }
                    Err(CorruptionError::NotARecord(_)) => {
                        if let Ok(value) = decode(raw.as_bytes()) {
                            info!(key = %self.key, "migrating legacy plaintext value");
                            self.heal(raw.as_bytes(), observed_writes, "migrate").await;
                            return Some((value, LoadSource::Migrated));
                        }
                        warn!(key = %self.key, "primary is neither a record nor a legacy value");
                    }
                    Err(e) => {
                        warn!(key = %self.key, error = %e, "primary record unusable");
                    }
                }
            }
        }

        self.recover_from_backups(&decode, observed_writes).await
    }

    fn decode_primary<V, F>(&self, raw: &str, decode: &F) -> Result<(V, Opened), CorruptionError>
    where
        F: Fn(&[u8]) -> Result<V, String>,
    {
        let record = StorageRecord::parse(raw, &self.key)?;
        let opened = self.codec.open(&record.envelope)?;
        let value = decode(&opened.plaintext).map_err(CorruptionError::Shape)?;
        Ok((value, opened))
    }

    async fn recover_from_backups<V, F>(
        &self,
        decode: &F,
        observed_writes: u64,
    ) -> Option<(V, LoadSource)>
    where
        F: Fn(&[u8]) -> Result<V, String> + Send + Sync,
        V: Send,
    {
        if self.options.backup {
            let snapshots = self.backups.lock().await.snapshots_newest_first().await;

            for snapshot in snapshots {
                let opened = match self.codec.open(&snapshot.envelope) {
                    Ok(opened) => opened,
                    Err(e) => {
                        warn!(key = %self.key, generation = snapshot.generation, error = %e, "backup does not decrypt");
                        continue;
                    }
                };
                match decode(&opened.plaintext) {
                    Ok(value) => {
                        warn!(key = %self.key, generation = snapshot.generation, "recovered from backup");
                        self.heal(&opened.plaintext, observed_writes, "restore")
                            .await;
                        return Some((
                            value,
                            LoadSource::Backup {
                                generation: snapshot.generation,
                            },
                        ));
                    }
                    Err(e) => {
                        warn!(key = %self.key, generation = snapshot.generation, error = %e, "backup has unexpected shape");
                    }
                }
            }
        }

        warn!(key = %self.key, "no usable value or backup, returning default");
        None
    }

    /// Write the current primary as the next backup generation.
    ///
    /// Returns `None` when there is no valid primary to snapshot.
    pub(crate) async fn backup_now(&self) -> Result<Option<u32>, BackupError> {
        let raw = self.kv.get(&self.key).await?;
        if !classify(raw.as_deref()).is_candidate() {
            debug!(key = %self.key, "skipping backup, primary is not a candidate");
            return Ok(None);
        }

        let record = match raw.as_deref().map(|raw| StorageRecord::parse(raw, &self.key)) {
            Some(Ok(record)) => record,
            _ => {
                debug!(key = %self.key, "skipping backup, primary is not a record");
                return Ok(None);
            }
        };
        if let Err(e) = self.codec.open(&record.envelope) {
            warn!(key = %self.key, error = %e, "skipping backup, primary does not decrypt");
            return Ok(None);
        }

        let generation = self.backups.lock().await.rotate(record.envelope).await?;
        *lock(&self.last_backup) = Some(Instant::now());
        Ok(Some(generation))
    }

    /// Snapshot if backups are enabled and the interval has elapsed.
    pub(crate) async fn maybe_backup(&self) -> Result<Option<u32>, BackupError> {
        if !self.options.backup {
            return Ok(None);
        }
        let due = match *lock(&self.last_backup) {
            Some(at) => at.elapsed() >= self.options.backup_interval,
            None => true,
        };
        if !due {
            return Ok(None);
        }
        self.backup_now().await
    }

    async fn maybe_backup_logged(&self) {
        if let Err(e) = self.maybe_backup().await {
            warn!(key = %self.key, error = %e, "backup failed");
        }
    }

    pub(crate) async fn generations(&self) -> Vec<u32> {
        self.backups.lock().await.generations().await
    }

    /// Remove the primary value and every snapshot.
    pub(crate) async fn clear(&self) -> Result<(), PersistError> {
        self.flush().await;
        self.kv.remove(&self.key).await?;
        self.backups
            .lock()
            .await
            .clear()
            .await
            .map_err(|e| match e {
                BackupError::Storage(kv) => PersistError::Storage(kv),
                BackupError::Serialize(s) => PersistError::Serialize(s),
            })?;
        *lock(&self.last_backup) = None;
        Ok(())
    }

    /// Start the periodic backup task, replacing any running one.
    pub(crate) fn start_backup_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.options.backup_interval.max(MIN_TIMER_PERIOD);

        let handle = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(core) = weak.upgrade() else { break };
                core.maybe_backup_logged().await;
            }
        });

        if let Some(previous) = lock(&self.timer).replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn stop_backup_timer(&self) {
        if let Some(handle) = lock(&self.timer).take() {
            handle.abort();
        }
    }
}

async fn run_writer(
    key: String,
    kv: Arc<dyn KeyValueStore>,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    core: Weak<StoreCore>,
    writes: Arc<AtomicU64>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            WriteJob::Write { payload, done } => {
                let result = kv.set(&key, &payload).await;
                let written = result.is_ok();
                if let Err(e) = &result {
                    warn!(key = %key, error = %e, "write failed, previous value kept");
                }
                let _ = done.send(result);

                if written {
                    if let Some(core) = core.upgrade() {
                        core.maybe_backup_logged().await;
                    }
                }
            }
            WriteJob::Heal {
                payload,
                expected_writes,
                done,
            } => {
                if writes.load(Ordering::SeqCst) == expected_writes {
                    if let Err(e) = kv.set(&key, &payload).await {
                        warn!(key = %key, error = %e, "recovery re-write failed");
                    }
                } else {
                    debug!(key = %key, "recovery re-write superseded by a newer write");
                }
                let _ = done.send(());
            }
            WriteJob::Flush { done } => {
                let _ = done.send(());
            }
        }
    }
}

/// Typed handle to the persistent value of one key.
///
/// Cloning is cheap; every clone (and every handle the hub hands out for the
/// same key) shares one write queue.
pub struct PersistentStore<T> {
    core: Arc<StoreCore>,
    default: T,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone> Clone for PersistentStore<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            default: self.default.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PersistentStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    pub(crate) fn from_core(core: Arc<StoreCore>, default: T) -> Self {
        Self {
            core,
            default,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        self.core.key()
    }

    pub fn options(&self) -> &LoadOptions {
        self.core.options()
    }

    /// Load the value. Never fails: corruption resolves to a backup or the
    /// default.
    pub async fn load(&self) -> T {
        self.load_with_report().await.value
    }

    /// Load the value and report where it came from.
    pub async fn load_with_report(&self) -> LoadOutcome<T> {
        let decoded = self
            .core
            .load_with(|bytes| serde_json::from_slice::<T>(bytes).map_err(|e| e.to_string()))
            .await;

        match decoded {
            Some((value, source)) => LoadOutcome { value, source },
            None => LoadOutcome {
                value: self.default.clone(),
                source: LoadSource::Default,
            },
        }
    }

    /// Persist `value`. The write is queued when this is called; awaiting
    /// the returned future waits for it to reach storage.
    pub fn save(&self, value: &T) -> impl Future<Output = Result<(), PersistError>> + Send + 'static {
        save_into(&self.core, value)
    }

    /// Wait for every write queued so far, and any backup it triggered.
    pub async fn flush(&self) {
        self.core.flush().await;
    }

    /// Snapshot now, regardless of the interval.
    pub async fn backup_now(&self) -> Result<Option<u32>, BackupError> {
        self.core.flush().await;
        self.core.backup_now().await
    }

    /// Snapshot if backups are enabled and the interval has elapsed.
    pub async fn maybe_backup(&self) -> Result<Option<u32>, BackupError> {
        self.core.maybe_backup().await
    }

    /// Readable backup generations, newest first.
    pub async fn generations(&self) -> Vec<u32> {
        self.core.generations().await
    }

    pub async fn clear(&self) -> Result<(), PersistError> {
        self.core.clear().await
    }

    pub fn start_backup_timer(&self) {
        self.core.start_backup_timer();
    }

    pub fn stop_backup_timer(&self) {
        self.core.stop_backup_timer();
    }
}

/// Serialize and enqueue a write on `core`.
pub(crate) fn save_into<T: Serialize + ?Sized>(
    core: &StoreCore,
    value: &T,
) -> impl Future<Output = Result<(), PersistError>> + Send + 'static {
    let queued = serde_json::to_vec(value)
        .map_err(|e| PersistError::Serialize(e.to_string()))
        .and_then(|bytes| core.enqueue_write(&bytes));
    let key = core.key().to_string();

    async move {
        let outcome = queued?.await.map_err(|_| PersistError::WriterClosed(key))?;
        outcome.map_err(PersistError::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::kv::MemoryStore;
    use crate::persistence::codec::EnvelopeVersion;
    use crate::persistence::mock::ScriptedStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
    }

    fn profile(name: &str) -> Profile {
        Profile {
            name: name.to_string(),
        }
    }

    fn codec() -> Arc<Codec> {
        Arc::new(Codec::new(&[42u8; 32]).unwrap())
    }

    fn store_on<K: KeyValueStore + 'static>(
        kv: K,
        options: LoadOptions,
    ) -> PersistentStore<Profile> {
        let core = StoreCore::new("profile", Arc::new(kv), codec(), options, Handle::current());
        PersistentStore::from_core(core, profile("default"))
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = store_on(MemoryStore::new(), LoadOptions::default());
        store.save(&profile("A")).await.unwrap();

        let outcome = store.load_with_report().await;
        assert_eq!(outcome.value, profile("A"));
        assert_eq!(outcome.source, LoadSource::Primary);
    }

    #[tokio::test]
    async fn test_stored_value_is_encrypted() {
        let kv = MemoryStore::new();
        let store = store_on(kv.clone(), LoadOptions::default());
        store.save(&profile("secret-name")).await.unwrap();

        let raw = kv.get("profile").await.unwrap().unwrap();
        assert!(!raw.contains("secret-name"));
        assert!(raw.contains("\"larder\":1"));
    }

    #[tokio::test]
    async fn test_back_to_back_saves_last_wins() {
        let store = store_on(MemoryStore::new(), LoadOptions::default());
        let first = store.save(&profile("A"));
        let second = store.save(&profile("B"));

        // Completion order of the callers does not matter
        second.await.unwrap();
        first.await.unwrap();

        assert_eq!(store.load().await, profile("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_first_write_does_not_overtake() {
        let kv = ScriptedStore::new();
        kv.delay_next_set("profile", Duration::from_secs(5));
        let store = store_on(kv.clone(), LoadOptions {
            backup: false,
            ..LoadOptions::default()
        });

        let first = tokio::spawn(store.save(&profile("A")));
        let second = tokio::spawn(store.save(&profile("B")));
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(store.load().await, profile("B"));
        assert_eq!(kv.set_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_value_returns_default() {
        let store = store_on(MemoryStore::new(), LoadOptions::default());
        let outcome = store.load_with_report().await;

        assert_eq!(outcome.value, profile("default"));
        assert_eq!(outcome.source, LoadSource::Default);
    }

    #[tokio::test]
    async fn test_corrupted_primary_without_backup_returns_default() {
        let kv = MemoryStore::new();
        kv.set("profile", "[object Object]").await.unwrap();
        let store = store_on(kv, LoadOptions::default());

        assert_eq!(store.load().await, profile("default"));
    }

    #[tokio::test]
    async fn test_corrupted_primary_recovers_from_backup_and_heals() {
        let kv = MemoryStore::new();
        let store = store_on(kv.clone(), LoadOptions::default());
        store.save(&profile("A")).await.unwrap();
        store.flush().await;
        assert_eq!(store.generations().await, vec![0]);

        kv.set("profile", "undefined").await.unwrap();

        let outcome = store.load_with_report().await;
        assert_eq!(outcome.value, profile("A"));
        assert_eq!(outcome.source, LoadSource::Backup { generation: 0 });

        // Primary was rewritten from the snapshot
        let healed = store.load_with_report().await;
        assert_eq!(healed.source, LoadSource::Primary);
        assert_eq!(healed.value, profile("A"));
    }

    #[tokio::test]
    async fn test_tampered_primary_falls_back() {
        let kv = MemoryStore::new();
        let store = store_on(kv.clone(), LoadOptions::default());
        store.save(&profile("A")).await.unwrap();
        store.flush().await;

        let raw = kv.get("profile").await.unwrap().unwrap();
        let mut record = StorageRecord::parse(&raw, "profile").unwrap();
        record.envelope.ciphertext[0] ^= 0x01;
        kv.set("profile", &record.to_json().unwrap()).await.unwrap();

        let outcome = store.load_with_report().await;
        assert_eq!(outcome.source, LoadSource::Backup { generation: 0 });
    }

    #[tokio::test]
    async fn test_legacy_plaintext_is_migrated() {
        let kv = MemoryStore::new();
        kv.set("profile", "{\"name\":\"legacy\"}").await.unwrap();
        let store = store_on(kv.clone(), LoadOptions::default());

        let outcome = store.load_with_report().await;
        assert_eq!(outcome.value, profile("legacy"));
        assert_eq!(outcome.source, LoadSource::Migrated);

        let raw = kv.get("profile").await.unwrap().unwrap();
        assert!(!raw.contains("legacy"));
        assert_eq!(store.load_with_report().await.source, LoadSource::Primary);
    }

    #[tokio::test]
    async fn test_damaged_record_recovers_from_backup_not_migration() {
        let kv = MemoryStore::new();
        let core = StoreCore::new(
            "k",
            Arc::new(kv.clone()),
            codec(),
            LoadOptions::default(),
            Handle::current(),
        );
        let store = PersistentStore::from_core(core, serde_json::Value::Null);
        store.save(&serde_json::json!(42)).await.unwrap();
        store.flush().await;

        // Any JSON object decodes as a Value, so the record must not be taken as legacy
        kv.set("k", r#"{"larder":1,"key":"k","envelope":"09","written_at":0}"#)
            .await
            .unwrap();

        let outcome = store.load_with_report().await;
        assert_eq!(outcome.value, serde_json::json!(42));
        assert_eq!(outcome.source, LoadSource::Backup { generation: 0 });
    }

    #[tokio::test]
    async fn test_wrong_shape_is_corruption() {
        let kv = MemoryStore::new();
        kv.set("profile", "[1, 2, 3]").await.unwrap();
        let store = store_on(kv, LoadOptions::default());

        assert_eq!(store.load_with_report().await.source, LoadSource::Default);
    }

    #[tokio::test]
    async fn test_failed_save_surfaces_and_keeps_prior_value() {
        let kv = ScriptedStore::new();
        let store = store_on(kv.clone(), LoadOptions::default());
        store.save(&profile("A")).await.unwrap();
        store.flush().await;

        kv.fail_next_sets(1);
        let result = store.save(&profile("B")).await;
        assert!(matches!(result, Err(PersistError::Storage(_))));

        assert_eq!(store.load().await, profile("A"));
    }

    #[tokio::test]
    async fn test_read_failure_is_recovered() {
        let kv = ScriptedStore::new();
        let store = store_on(kv.clone(), LoadOptions::default());
        store.save(&profile("A")).await.unwrap();
        store.flush().await;

        kv.fail_next_gets(1);
        let outcome = store.load_with_report().await;
        assert_eq!(outcome.value, profile("A"));
        assert_eq!(outcome.source, LoadSource::Backup { generation: 0 });
    }

    #[tokio::test]
    async fn test_backup_interval_gates_snapshots() {
        let store = store_on(MemoryStore::new(), LoadOptions {
            backup_interval: Duration::from_secs(3600),
            ..LoadOptions::default()
        });

        store.save(&profile("A")).await.unwrap();
        store.save(&profile("B")).await.unwrap();
        store.flush().await;

        // Only the first write was due
        assert_eq!(store.generations().await, vec![0]);

        assert_eq!(store.backup_now().await.unwrap(), Some(1));
        assert_eq!(store.generations().await, vec![1, 0]);
    }

    #[tokio::test]
    async fn test_backup_disabled() {
        let store = store_on(MemoryStore::new(), LoadOptions {
            backup: false,
            ..LoadOptions::default()
        });
        store.save(&profile("A")).await.unwrap();

        assert_eq!(store.maybe_backup().await.unwrap(), None);
        assert!(store.generations().await.is_empty());
    }

    #[tokio::test]
    async fn test_rotation_keeps_retention() {
        let store = store_on(MemoryStore::new(), LoadOptions {
            backup_interval: Duration::ZERO,
            retention: 3,
            ..LoadOptions::default()
        });

        for name in ["a", "b", "c", "d"] {
            store.save(&profile(name)).await.unwrap();
        }
        store.flush().await;

        assert_eq!(store.generations().await, vec![3, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_timer_snapshots_periodically() {
        let store = store_on(MemoryStore::new(), LoadOptions {
            backup_interval: Duration::from_secs(60),
            ..LoadOptions::default()
        });
        store.save(&profile("A")).await.unwrap();
        store.flush().await;
        assert_eq!(store.generations().await, vec![0]);

        store.start_backup_timer();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.generations().await, vec![1, 0]);

        store.stop_backup_timer();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(store.generations().await, vec![1, 0]);
    }

    #[tokio::test]
    async fn test_unencrypted_key_stores_plain_envelope() {
        let kv = MemoryStore::new();
        let store = store_on(kv.clone(), LoadOptions {
            encryption: false,
            ..LoadOptions::default()
        });
        store.save(&profile("visible")).await.unwrap();

        let raw = kv.get("profile").await.unwrap().unwrap();
        let record = StorageRecord::parse(&raw, "profile").unwrap();
        assert_eq!(record.envelope.version, EnvelopeVersion::Plain as u8);
        assert_eq!(store.load().await, profile("visible"));
    }

    #[tokio::test]
    async fn test_plain_record_is_resealed_when_encryption_enabled() {
        let kv = MemoryStore::new();
        let plain = StorageRecord::new("profile", Envelope::plain(b"{\"name\":\"p\"}"));
        kv.set("profile", &plain.to_json().unwrap()).await.unwrap();

        let store = store_on(kv.clone(), LoadOptions::default());
        assert_eq!(store.load().await, profile("p"));

        let raw = kv.get("profile").await.unwrap().unwrap();
        let record = StorageRecord::parse(&raw, "profile").unwrap();
        assert_eq!(record.envelope.version, EnvelopeVersion::Aes256Gcm as u8);
    }

    #[tokio::test]
    async fn test_clear_removes_value_and_backups() {
        let kv = MemoryStore::new();
        let store = store_on(kv.clone(), LoadOptions::default());
        store.save(&profile("A")).await.unwrap();
        store.flush().await;

        store.clear().await.unwrap();
        assert!(kv.is_empty());
        assert_eq!(store.load_with_report().await.source, LoadSource::Default);
    }
}
