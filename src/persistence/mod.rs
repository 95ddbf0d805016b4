//! Encrypted, self-healing local persistence.
//!
//! Layers, bottom up:
//! - [`kv`]: string key-value backends (memory, one-file-per-key)
//! - [`codec`]: versioned AEAD envelopes
//! - [`validator`]: rejects corrupted payloads before decoding
//! - [`record`]: on-disk record and backup snapshot shapes
//! - [`backup`]: generation-numbered snapshot ring per key
//! - [`store`]: typed per-key store with serialized writes and total loads
//! - [`hub`]: binds logical keys to stores

pub mod backup;
pub mod codec;
pub mod error;
pub mod hub;
pub mod kv;
pub mod mock;
pub mod record;
pub mod store;
pub mod validator;

#[cfg(test)]
mod proptests;

pub use backup::{BackupError, BackupRotator, DEFAULT_RETENTION};
pub use codec::{CipherSuite, Codec, CryptoError, Envelope, EnvelopeVersion, Opened};
pub use error::{CorruptionError, PersistError};
pub use hub::PersistenceHub;
pub use kv::{FileStore, KeyValueStore, KvError, MemoryStore};
pub use record::{BackupSnapshot, StorageRecord};
pub use store::{LoadOptions, LoadOutcome, LoadSource, PersistentStore, DEFAULT_BACKUP_INTERVAL};
pub use validator::{classify, Classification, CorruptionReason};
