//! Generation-numbered backup ring for one key.
//!
//! ## Layout
//!
//! ```text
//! generation:  0   1   2   3   4   5 ...
//! slot (N=3):  0   1   2   0   1   2 ...
//! storage key: {key}__backup__{slot}
//! ```
//!
//! Writing generation `g` overwrites slot `g % N`, which evicts generation
//! `g - N`. After `N + 1` rotations exactly `N` generations remain. The full
//! generation number is stored inside the snapshot so readers can order
//! slots newest first.

use super::codec::Envelope;
use super::kv::{KeyValueStore, KvError};
use super::record::{backup_key, parse_backup_key, BackupSnapshot, StorageRecord};
use super::validator::{classify, Classification};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Default number of generations retained per key
pub const DEFAULT_RETENTION: u32 = 3;

/// Errors that can occur while writing a backup
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Backup storage failed: {0}")]
    Storage(#[from] KvError),

    #[error("Backup serialization failed: {0}")]
    Serialize(String),
}

/// Writer/reader of the snapshot ring for one key.
pub struct BackupRotator {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    retention: u32,
    /// Next generation to write; discovered from storage on first use
    next_generation: Option<u32>,
}

impl BackupRotator {
    pub fn new(kv: Arc<dyn KeyValueStore>, key: &str, retention: u32) -> Self {
        Self {
            kv,
            key: key.to_string(),
            retention: retention.max(1),
            next_generation: None,
        }
    }

    pub fn retention(&self) -> u32 {
        self.retention
    }

    /// Write `envelope` as the next generation, evicting the oldest.
    ///
    /// Returns the generation number written.
    pub async fn rotate(&mut self, envelope: Envelope) -> Result<u32, BackupError> {
        let generation = match self.next_generation {
            Some(g) => g,
            None => self
                .snapshots_newest_first()
                .await
                .first()
                .map(|s| s.generation.wrapping_add(1))
                .unwrap_or(0),
        };

        let slot = generation % self.retention;
        let snapshot = BackupSnapshot::new(&self.key, generation, envelope);
        let json = snapshot
            .to_json()
            .map_err(|e| BackupError::Serialize(e.to_string()))?;

        self.kv.set(&backup_key(&self.key, slot), &json).await?;
        self.next_generation = Some(generation.wrapping_add(1));

        self.evict_out_of_range().await;

        debug!(key = %self.key, generation, slot, "backup snapshot written");
        Ok(generation)
    }

    /// Every readable snapshot of this key, newest generation first.
    ///
    /// Slots whose payload does not classify as a candidate or does not parse
    /// as a snapshot are skipped.
    pub async fn snapshots_newest_first(&self) -> Vec<BackupSnapshot> {
        let mut snapshots = Vec::new();

        for storage_key in self.slot_keys().await {
            let raw = match self.kv.get(&storage_key).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(key = %self.key, slot_key = %storage_key, error = %e, "backup slot unreadable");
                    continue;
                }
            };

            match classify(raw.as_deref()) {
                Classification::Candidate => {}
                Classification::Empty => continue,
                Classification::Corrupted(reason) => {
                    warn!(key = %self.key, slot_key = %storage_key, %reason, "backup slot corrupted");
                    continue;
                }
            }

            match raw.as_deref().map(|raw| BackupSnapshot::parse(raw, &self.key)) {
                Some(Ok(snapshot)) => snapshots.push(snapshot),
                Some(Err(e)) => {
                    warn!(key = %self.key, slot_key = %storage_key, error = %e, "backup slot unusable");
                }
                None => {}
            }
        }

        snapshots.sort_by(|a, b| b.generation.cmp(&a.generation));
        snapshots
    }

    /// Generation numbers currently readable, newest first.
    pub async fn generations(&self) -> Vec<u32> {
        self.snapshots_newest_first()
            .await
            .into_iter()
            .map(|s| s.generation)
            .collect()
    }

    /// Remove every slot of this key.
    pub async fn clear(&mut self) -> Result<(), BackupError> {
        for storage_key in self.slot_keys().await {
            if self.is_foreign_primary(&storage_key).await {
                continue;
            }
            self.kv.remove(&storage_key).await?;
        }
        self.next_generation = None;
        Ok(())
    }

    /// Storage keys of every slot that exists for this key, including slots
    /// left beyond the current retention.
    async fn slot_keys(&self) -> Vec<String> {
        match self.kv.list_keys().await {
            Ok(keys) => keys
                .into_iter()
                .filter(|k| matches!(parse_backup_key(k), Some((base, _)) if base == self.key))
                .collect(),
            Err(e) => {
                warn!(key = %self.key, error = %e, "listing keys failed, scanning retained slots");
                (0..self.retention)
                    .map(|slot| backup_key(&self.key, slot))
                    .collect()
            }
        }
    }

    /// A key shaped like one of our slots can still be a value saved in its
    /// own right, e.g. `notes__backup__9`. Its record names the full storage
    /// key rather than ours.
    async fn is_foreign_primary(&self, storage_key: &str) -> bool {
        match self.kv.get(storage_key).await {
            Ok(Some(raw)) => StorageRecord::parse(&raw, storage_key).is_ok(),
            _ => false,
        }
    }

    /// Drop slots beyond the retention bound (left over from a larger ring).
    async fn evict_out_of_range(&self) {
        for storage_key in self.slot_keys().await {
            if let Some((_, slot)) = parse_backup_key(&storage_key) {
                if slot >= self.retention && !self.is_foreign_primary(&storage_key).await {
                    if let Err(e) = self.kv.remove(&storage_key).await {
                        warn!(key = %self.key, slot, error = %e, "evicting stale backup slot failed");
                    }
                }
            }
        }
    }
}
