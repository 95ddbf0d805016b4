//! Envelope codec for values at rest.
//!
//! Every value written by the persistence layer is sealed into a versioned,
//! self-describing [`Envelope`]. The version byte selects the decode
//! algorithm, so older records stay readable after the write suite changes.
//!
//! ## Wire Format
//!
//! ```text
//! ┌─────────┬───────┬──────────┬──────────────────┬───────────┐
//! │ version │ ivLen │ iv       │ ciphertext       │ tag       │
//! │ u8      │ u8    │ ivLen B  │ variable         │ 16 B (*)  │
//! └─────────┴───────┴──────────┴──────────────────┴───────────┘
//! (*) 0 bytes for version 0 (plain)
//! ```
//!
//! ## Versions
//!
//! | Version | Algorithm          | Nonce | Tag |
//! |---------|--------------------|-------|-----|
//! | 0       | plain (no crypto)  | 0 B   | 0 B |
//! | 1       | AES-256-GCM        | 12 B  | 16 B|
//! | 2       | ChaCha20-Poly1305  | 12 B  | 16 B|
//!
//! The version byte is bound into the AEAD as associated data, so a record
//! cannot be relabelled to a different algorithm without failing the tag.

use ring::aead::{
    Aad, Algorithm, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305, NONCE_LEN,
};
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::LarderKeyring;

/// AEAD tag length for every supported authenticated version
pub const TAG_LEN: usize = 16;

/// Errors raised by the codec.
///
/// Any of these on the read path means the payload is unusable and must be
/// treated as corruption by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Authentication failed: tag did not verify")]
    Authentication,

    #[error("Key setup failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),
}

/// Envelope versions understood by this codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeVersion {
    Plain = 0,
    Aes256Gcm = 1,
    ChaCha20Poly1305 = 2,
}

impl EnvelopeVersion {
    fn algorithm(self) -> Option<&'static Algorithm> {
        match self {
            EnvelopeVersion::Plain => None,
            EnvelopeVersion::Aes256Gcm => Some(&AES_256_GCM),
            EnvelopeVersion::ChaCha20Poly1305 => Some(&CHACHA20_POLY1305),
        }
    }

    fn tag_len(self) -> usize {
        match self {
            EnvelopeVersion::Plain => 0,
            _ => TAG_LEN,
        }
    }
}

impl TryFrom<u8> for EnvelopeVersion {
    type Error = CryptoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EnvelopeVersion::Plain),
            1 => Ok(EnvelopeVersion::Aes256Gcm),
            2 => Ok(EnvelopeVersion::ChaCha20Poly1305),
            other => Err(CryptoError::UnsupportedVersion(other)),
        }
    }
}

/// Authenticated cipher used to seal new envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherSuite {
    #[default]
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherSuite {
    pub fn version(self) -> EnvelopeVersion {
        match self {
            CipherSuite::Aes256Gcm => EnvelopeVersion::Aes256Gcm,
            CipherSuite::ChaCha20Poly1305 => EnvelopeVersion::ChaCha20Poly1305,
        }
    }
}

/// Versioned container holding nonce, ciphertext and tag for one value.
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u8,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("version", &self.version)
            .field("iv_len", &self.iv.len())
            .field("ciphertext_len", &self.ciphertext.len())
            .field("tag_len", &self.tag.len())
            .finish()
    }
}

impl Envelope {
    /// Serialize to `{version}{ivLen}{iv}{ciphertext}{tag}`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(2 + self.iv.len() + self.ciphertext.len() + self.tag.len());
        out.push(self.version);
        out.push(self.iv.len() as u8);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Parse the wire format. Never panics on arbitrary input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let (&version, rest) = bytes
            .split_first()
            .ok_or_else(|| CryptoError::Malformed("empty envelope".to_string()))?;
        let parsed = EnvelopeVersion::try_from(version)?;

        let (&iv_len, rest) = rest
            .split_first()
            .ok_or_else(|| CryptoError::Malformed("missing iv length".to_string()))?;
        let iv_len = iv_len as usize;
        let tag_len = parsed.tag_len();

        if rest.len() < iv_len + tag_len {
            return Err(CryptoError::Malformed(format!(
                "envelope too short: {} bytes after header, need at least {}",
                rest.len(),
                iv_len + tag_len
            )));
        }

        let (iv, rest) = rest.split_at(iv_len);
        let (ciphertext, tag) = rest.split_at(rest.len() - tag_len);

        Ok(Self {
            version,
            iv: iv.to_vec(),
            ciphertext: ciphertext.to_vec(),
            tag: tag.to_vec(),
        })
    }

    /// Hex text form used inside stored records.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(text).map_err(|e| CryptoError::Malformed(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Envelope that stores the plaintext as-is (version 0).
    pub fn plain(plaintext: &[u8]) -> Self {
        Self {
            version: EnvelopeVersion::Plain as u8,
            iv: Vec::new(),
            ciphertext: plaintext.to_vec(),
            tag: Vec::new(),
        }
    }
}

/// Result of opening an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    pub plaintext: Vec<u8>,
    pub version: EnvelopeVersion,
    /// Opened with a retired key rather than the active one
    pub retired_key: bool,
}

/// Symmetric codec bound to the process storage key.
pub struct Codec {
    suite: CipherSuite,
    active: Zeroizing<[u8; 32]>,
    retired: Vec<Zeroizing<[u8; 32]>>,
    rng: SystemRandom,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("suite", &self.suite)
            .field("retired_keys", &self.retired.len())
            .finish()
    }
}

impl Codec {
    /// Create a codec from a 32-byte key.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            suite: CipherSuite::default(),
            active: to_key(key)?,
            retired: Vec::new(),
            rng: SystemRandom::new(),
        })
    }

    /// Create a codec holding the keyring's active and retired keys.
    pub fn from_keyring(keyring: &LarderKeyring) -> Result<Self, CryptoError> {
        let mut codec = Self::new(keyring.storage_key())?;
        for key in keyring.retired_keys() {
            codec = codec.with_retired_key(key)?;
        }
        Ok(codec)
    }

    /// Select the cipher used for new envelopes.
    pub fn with_suite(mut self, suite: CipherSuite) -> Self {
        self.suite = suite;
        self
    }

    /// Add a key that may open existing envelopes but never seals new ones.
    pub fn with_retired_key(mut self, key: &[u8]) -> Result<Self, CryptoError> {
        self.retired.push(to_key(key)?);
        Ok(self)
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Version stamped on envelopes sealed by this codec.
    pub fn current_version(&self) -> EnvelopeVersion {
        self.suite.version()
    }

    /// Encrypt with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
        let version = self.suite.version();
        let algorithm = version
            .algorithm()
            .ok_or(CryptoError::UnsupportedVersion(version as u8))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Encryption("RNG failure".to_string()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let key = sealing_key(algorithm, self.active.as_slice())?;
        let mut ciphertext = plaintext.to_vec();
        let tag = key
            .seal_in_place_separate_tag(nonce, Aad::from([version as u8]), &mut ciphertext)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;

        Ok(Envelope {
            version: version as u8,
            iv: nonce_bytes.to_vec(),
            ciphertext,
            tag: tag.as_ref().to_vec(),
        })
    }

    /// Decrypt an envelope, returning the plaintext.
    pub fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
        self.open(envelope).map(|opened| opened.plaintext)
    }

    /// Decrypt an envelope and report how it was opened.
    ///
    /// The active key is tried first, then retired keys newest first.
    pub fn open(&self, envelope: &Envelope) -> Result<Opened, CryptoError> {
        let version = EnvelopeVersion::try_from(envelope.version)?;

        let Some(algorithm) = version.algorithm() else {
            if !envelope.iv.is_empty() || !envelope.tag.is_empty() {
                return Err(CryptoError::Malformed(
                    "plain envelope carries iv or tag".to_string(),
                ));
            }
            return Ok(Opened {
                plaintext: envelope.ciphertext.clone(),
                version,
                retired_key: false,
            });
        };

        if envelope.iv.len() != NONCE_LEN {
            return Err(CryptoError::Malformed(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LEN,
                envelope.iv.len()
            )));
        }
        if envelope.tag.len() != TAG_LEN {
            return Err(CryptoError::Malformed(format!(
                "tag must be {} bytes, got {}",
                TAG_LEN,
                envelope.tag.len()
            )));
        }

        if let Some(plaintext) = open_with(algorithm, self.active.as_slice(), envelope)? {
            return Ok(Opened {
                plaintext,
                version,
                retired_key: false,
            });
        }

        for key in &self.retired {
            if let Some(plaintext) = open_with(algorithm, key.as_slice(), envelope)? {
                return Ok(Opened {
                    plaintext,
                    version,
                    retired_key: true,
                });
            }
        }

        Err(CryptoError::Authentication)
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<Envelope, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_str(&self, envelope: &Envelope) -> Result<String, CryptoError> {
        let bytes = self.decrypt(envelope)?;
        String::from_utf8(bytes).map_err(|e| CryptoError::Malformed(e.to_string()))
    }
}

fn to_key(key: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let bytes: [u8; 32] = key.try_into().map_err(|_| {
        CryptoError::KeyDerivation(format!("key must be 32 bytes, got {}", key.len()))
    })?;
    Ok(Zeroizing::new(bytes))
}

fn sealing_key(algorithm: &'static Algorithm, key: &[u8]) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(algorithm, key)
        .map_err(|e| CryptoError::KeyDerivation(format!("Key creation failed: {}", e)))?;
    Ok(LessSafeKey::new(unbound))
}

/// Try one key. `Ok(None)` means the tag did not verify under this key.
fn open_with(
    algorithm: &'static Algorithm,
    key: &[u8],
    envelope: &Envelope,
) -> Result<Option<Vec<u8>>, CryptoError> {
    let key = sealing_key(algorithm, key)?;
    let nonce = Nonce::try_assume_unique_for_key(&envelope.iv)
        .map_err(|_| CryptoError::Malformed("invalid nonce".to_string()))?;

    let mut in_out = Vec::with_capacity(envelope.ciphertext.len() + envelope.tag.len());
    in_out.extend_from_slice(&envelope.ciphertext);
    in_out.extend_from_slice(&envelope.tag);

    match key.open_in_place(nonce, Aad::from([envelope.version]), &mut in_out) {
        Ok(plaintext) => Ok(Some(plaintext.to_vec())),
        Err(_) => Ok(None),
    }
}
