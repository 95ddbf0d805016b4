use super::codec::CryptoError;
use super::kv::KvError;
use super::validator::CorruptionReason;
use thiserror::Error;

/// A stored payload is present but unusable.
///
/// Never surfaced from `load`; it is logged and recovered from.
#[derive(Debug, Error)]
pub enum CorruptionError {
    #[error("Payload rejected: {0}")]
    Rejected(CorruptionReason),

    #[error("Not a storage record: {0}")]
    NotARecord(String),

    #[error("Record belongs to key {found:?}, expected {expected:?}")]
    KeyMismatch { expected: String, found: String },

    #[error("Envelope unusable: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Value does not match the expected shape: {0}")]
    Shape(String),
}

/// A `save` did not take effect. Prior state is untouched.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Serialization failed: {0}")]
    Serialize(String),

    #[error("Encryption failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage write failed: {0}")]
    Storage(#[from] KvError),

    #[error("Writer for key {0:?} has shut down")]
    WriterClosed(String),

    #[error("No Tokio runtime available to drive the store")]
    NoRuntime,
}
