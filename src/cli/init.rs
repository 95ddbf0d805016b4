use crate::cli::config::{default_passphrase_path, LarderConfig};
use crate::cli::context::config_path;
use crate::cli::passphrase::{announce_mnemonic, generate_mnemonic, write_mnemonic_file};
use larder::persistence::FileStore;
use std::path::{Path, PathBuf};
use tracing::info;

/// Create a config file, a store directory and a fresh mnemonic
///
/// Refuses to overwrite an existing config or mnemonic unless `force` is set:
/// a replaced mnemonic makes every existing value unreadable.
pub async fn execute(
    config: Option<String>,
    store_path: Option<String>,
    passphrase_file: Option<String>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path(config.as_deref());
    let passphrase_path = passphrase_file
        .map(PathBuf::from)
        .unwrap_or_else(|| default_passphrase_path(&config_path));

    if !force {
        for existing in [&config_path, &passphrase_path] {
            if existing.exists() {
                return Err(format!(
                    "{} already exists. Use --force to overwrite (existing values become unreadable).",
                    existing.display()
                )
                .into());
            }
        }
    }

    let store_path = store_path
        .map(PathBuf::from)
        .unwrap_or_else(|| sibling_store_path(&config_path));

    FileStore::open(&store_path)
        .await
        .map_err(|e| format!("Failed to create store at {}: {}", store_path.display(), e))?;

    let config = LarderConfig::new(store_path.clone());
    config.save(&config_path)?;

    let mnemonic = generate_mnemonic()?;
    write_mnemonic_file(&mnemonic, &passphrase_path)?;
    announce_mnemonic(&mnemonic, Some(&passphrase_path));

    info!(
        config = %config_path.display(),
        store = %store_path.display(),
        "store initialized"
    );
    println!("Config:     {}", config_path.display());
    println!("Store:      {}", store_path.display());
    println!("Mnemonic:   {}", passphrase_path.display());

    Ok(())
}

/// The store directory defaults to `store/` next to the config file.
fn sibling_store_path(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .unwrap_or(config_path)
        .join("store")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_creates_config_store_and_mnemonic() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        execute(
            Some(config_path.to_string_lossy().to_string()),
            None,
            None,
            false,
        )
        .await
        .unwrap();

        let config = LarderConfig::load(&config_path).unwrap();
        assert_eq!(config.store.path, temp_dir.path().join("store"));
        assert!(config.store.path.is_dir());

        let mnemonic =
            std::fs::read_to_string(default_passphrase_path(&config_path)).unwrap();
        assert_eq!(mnemonic.split_whitespace().count(), 24);
    }

    #[tokio::test]
    async fn test_init_refuses_to_overwrite_without_force() {
        let temp_dir = TempDir::new().unwrap();
        let config = Some(temp_dir.path().join("config.toml").to_string_lossy().to_string());

        execute(config.clone(), None, None, false).await.unwrap();
        let first = std::fs::read_to_string(temp_dir.path().join("passphrase.txt")).unwrap();

        let err = execute(config.clone(), None, None, false).await.unwrap_err();
        assert!(err.to_string().contains("--force"));
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("passphrase.txt")).unwrap(),
            first
        );

        execute(config, None, None, true).await.unwrap();
        assert_ne!(
            std::fs::read_to_string(temp_dir.path().join("passphrase.txt")).unwrap(),
            first
        );
    }

    #[tokio::test]
    async fn test_init_with_explicit_paths() {
        let temp_dir = TempDir::new().unwrap();
        let store = temp_dir.path().join("elsewhere");
        let key = temp_dir.path().join("secret").join("key.txt");

        execute(
            Some(temp_dir.path().join("c.toml").to_string_lossy().to_string()),
            Some(store.to_string_lossy().to_string()),
            Some(key.to_string_lossy().to_string()),
            false,
        )
        .await
        .unwrap();

        assert!(store.is_dir());
        assert!(key.exists());
        assert!(!temp_dir.path().join("passphrase.txt").exists());
    }
}
