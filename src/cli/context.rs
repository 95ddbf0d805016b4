//! Opening the configured store for a command.

use crate::cli::config::{default_config_path, default_passphrase_path, LarderConfig};
use crate::cli::passphrase::{mnemonic_source, read_mnemonic};
use larder::crypto::LarderKeyring;
use larder::persistence::{Codec, FileStore, KeyValueStore, PersistenceHub};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Config path from `--config`, or the default location.
pub fn config_path(config: Option<&str>) -> PathBuf {
    config
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path)
}

/// Read the config file, pointing at `larder init` when it is missing.
pub fn load_config(config_path: &Path) -> Result<LarderConfig, Box<dyn std::error::Error>> {
    if !config_path.exists() {
        return Err(format!(
            "No config at {}. Run 'larder init' first.",
            config_path.display()
        )
        .into());
    }
    LarderConfig::load(config_path)
}

/// Open the backing directory without touching any keys.
pub async fn open_kv(
    config: &LarderConfig,
) -> Result<Arc<dyn KeyValueStore>, Box<dyn std::error::Error>> {
    let kv = FileStore::open(&config.store.path).await.map_err(|e| {
        format!(
            "Failed to open store at {}: {}",
            config.store.path.display(),
            e
        )
    })?;
    Ok(Arc::new(kv))
}

/// Build the codec for the configured cipher and key epoch.
pub fn build_codec(
    config: &LarderConfig,
    mnemonic: &str,
) -> Result<Codec, Box<dyn std::error::Error>> {
    let keyring = LarderKeyring::from_mnemonic_at_epoch(mnemonic, config.store.key_epoch)?;
    debug!(
        epoch = keyring.epoch(),
        retired = keyring.retired_keys().len(),
        "keyring ready"
    );
    Ok(Codec::from_keyring(&keyring)?.with_suite(config.cipher_suite()?))
}

/// Everything a value-handling command needs.
pub struct StoreContext {
    pub config: LarderConfig,
    pub kv: Arc<dyn KeyValueStore>,
    pub hub: PersistenceHub,
}

impl StoreContext {
    pub async fn open(
        config: Option<String>,
        passphrase_file: Option<String>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = config_path(config.as_deref());
        let config = load_config(&config_path)?;

        let source = mnemonic_source(passphrase_file, &default_passphrase_path(&config_path));
        let mnemonic = read_mnemonic(&source)?;
        let codec = build_codec(&config, &mnemonic)?;

        let kv = open_kv(&config).await?;
        let hub =
            PersistenceHub::new(kv.clone(), codec)?.with_default_options(config.load_options());

        Ok(Self { config, kv, hub })
    }
}

/// Write a config and mnemonic into `dir`; returns the config path.
#[cfg(test)]
pub(crate) fn init_fixture(dir: &Path) -> PathBuf {
    use crate::cli::passphrase::{generate_mnemonic, write_mnemonic_file};

    let config_path = dir.join("config.toml");
    LarderConfig::new(dir.join("store"))
        .save(&config_path)
        .unwrap();
    write_mnemonic_file(
        &generate_mnemonic().unwrap(),
        &default_passphrase_path(&config_path),
    )
    .unwrap();
    config_path
}
