//! Storage key derivation from a BIP-39 mnemonic seed
//!
//! All keys used by the persistence layer are derived from the operator's
//! 24-word BIP-39 mnemonic (or raw device key material) using HKDF-SHA256 with
//! domain separation.
//!
//! ## Key Hierarchy
//!
//! ```text
//! BIP-39 Mnemonic (24 words)          raw key material (device keystore)
//!         │                                   │
//!         ▼                                   │
//! bip39::Mnemonic::to_seed("")  → [u8; 64]    │
//!         │                                   │
//!         └───────────────┬───────────────────┘
//!                         ▼
//! HKDF-SHA256(salt="larder-master-v1", seed)
//!         │
//!         ├─► HKDF expand("storage-encryption-v1") → epoch 1 key
//!         ├─► HKDF expand("storage-encryption-v2") → epoch 2 key
//!         └─► ...
//! ```
//!
//! ## Rotation
//!
//! The active epoch's key seals new envelopes. Keys of earlier epochs are kept
//! as retired keys so that records sealed before a rotation still open; the
//! store re-encrypts them with the active key on the next read.

use bip39::Mnemonic;
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// Domain separation salt for master key derivation
const MASTER_SALT: &[u8] = b"larder-master-v1";

/// HKDF info prefix for storage encryption keys (suffixed with the epoch)
const STORAGE_ENCRYPTION_INFO: &str = "storage-encryption-v";

/// Highest accepted epoch; every earlier epoch costs one retired key
pub const MAX_EPOCH: u32 = 256;

/// Minimum length of raw key material accepted by `from_key_material`
const MIN_KEY_MATERIAL_LEN: usize = 32;

/// Key derivation failures
#[derive(Debug, Error)]
pub enum KeyringError {
    /// Invalid BIP-39 mnemonic
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    /// Raw key material shorter than 32 bytes
    #[error("Key material too short: need at least 32 bytes, got {0}")]
    KeyMaterialTooShort(usize),

    /// Epoch outside `1..=MAX_EPOCH`
    #[error("Key epoch must be between 1 and {MAX_EPOCH}, got {0}")]
    InvalidEpoch(u32),

    /// HKDF refused the requested output length
    #[error("Key derivation failed: {0}")]
    DerivationFailed(String),
}

/// Keyring holding the active storage key and the keys of retired epochs.
///
/// All key bytes are zeroized on drop. The mnemonic itself is never stored.
pub struct LarderKeyring {
    epoch: u32,
    active: [u8; 32],
    /// Keys of epochs `1..epoch`, newest first
    retired: Vec<[u8; 32]>,
}

impl Drop for LarderKeyring {
    fn drop(&mut self) {
        self.active.zeroize();
        for key in &mut self.retired {
            key.zeroize();
        }
    }
}

impl LarderKeyring {
    /// Create a keyring at epoch 1 from a BIP-39 mnemonic phrase.
    pub fn from_mnemonic(mnemonic: &str) -> Result<Self, KeyringError> {
        Self::from_mnemonic_at_epoch(mnemonic, 1)
    }

    /// Create a keyring from a BIP-39 mnemonic with the given active epoch.
    ///
    /// Keys for every earlier epoch are derived as retired keys.
    pub fn from_mnemonic_at_epoch(mnemonic: &str, epoch: u32) -> Result<Self, KeyringError> {
        let parsed =
            Mnemonic::parse(mnemonic).map_err(|e| KeyringError::InvalidMnemonic(e.to_string()))?;

        // PBKDF2 with 2048 rounds, empty BIP-39 passphrase
        let seed = Zeroizing::new(parsed.to_seed(""));
        Self::derive(seed.as_slice(), epoch)
    }

    /// Create a keyring from raw key material (e.g. a platform keystore secret).
    pub fn from_key_material(material: &[u8], epoch: u32) -> Result<Self, KeyringError> {
        if material.len() < MIN_KEY_MATERIAL_LEN {
            return Err(KeyringError::KeyMaterialTooShort(material.len()));
        }
        Self::derive(material, epoch)
    }

    fn derive(seed: &[u8], epoch: u32) -> Result<Self, KeyringError> {
        if !(1..=MAX_EPOCH).contains(&epoch) {
            return Err(KeyringError::InvalidEpoch(epoch));
        }

        let hkdf = Hkdf::<Sha256>::new(Some(MASTER_SALT), seed);
        let active = Self::derive_epoch_key(&hkdf, epoch)?;
        let retired = (1..epoch)
            .rev()
            .map(|e| Self::derive_epoch_key(&hkdf, e))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            epoch,
            active,
            retired,
        })
    }

    /// Derive the 32-byte storage key for one epoch.
    fn derive_epoch_key(hkdf: &Hkdf<Sha256>, epoch: u32) -> Result<[u8; 32], KeyringError> {
        let info = format!("{STORAGE_ENCRYPTION_INFO}{epoch}");
        let mut key = [0u8; 32];
        hkdf.expand(info.as_bytes(), &mut key)
            .map_err(|e| KeyringError::DerivationFailed(format!("{:?}", e)))?;
        Ok(key)
    }

    /// Active key epoch (1 for the initial derivation).
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Key used to seal new envelopes.
    pub fn storage_key(&self) -> &[u8; 32] {
        &self.active
    }

    /// Keys of earlier epochs, newest first.
    pub fn retired_keys(&self) -> &[[u8; 32]] {
        &self.retired
    }
}
