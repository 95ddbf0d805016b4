/// Key material for the persistence layer
///
/// This module implements:
/// - Storage key derivation from a BIP-39 mnemonic or raw device key material
/// - Epoch-based key rotation (active key + retired keys)
pub mod keyring;

pub use keyring::{KeyringError, LarderKeyring, MAX_EPOCH};
