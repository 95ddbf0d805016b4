use crate::cli::context::{config_path, load_config, open_kv, StoreContext};
use larder::persistence::{BackupRotator, BackupSnapshot, EnvelopeVersion};
use serde_json::Value;
use std::time::{Duration, UNIX_EPOCH};

/// Snapshot `key` into its backup ring now, ignoring the interval
pub async fn snapshot(
    config: Option<String>,
    passphrase_file: Option<String>,
    key: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = StoreContext::open(config, passphrase_file).await?;
    let store = ctx.hub.store(&key, Value::Null, ctx.config.load_options());

    match store.backup_now().await? {
        Some(generation) => {
            println!("Backed up '{}' as generation {}", key, generation);
            Ok(())
        }
        None => Err(format!("'{}' has no valid value to back up", key).into()),
    }
}

/// List the readable snapshots of `key`, newest first
///
/// Needs no mnemonic: snapshots are listed, not opened.
pub async fn list(config: Option<String>, key: String) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&config_path(config.as_deref()))?;
    let kv = open_kv(&config).await?;

    let rotator = BackupRotator::new(kv, &key, config.backup.retention);
    let snapshots = rotator.snapshots_newest_first().await;

    if snapshots.is_empty() {
        println!("No backups for '{}'", key);
        return Ok(());
    }

    println!("{:<12} {:<26} CIPHER", "GENERATION", "TAKEN");
    for snapshot in &snapshots {
        println!("{}", describe(snapshot));
    }
    Ok(())
}

fn describe(snapshot: &BackupSnapshot) -> String {
    let taken = UNIX_EPOCH + Duration::from_millis(snapshot.timestamp);
    let cipher = match EnvelopeVersion::try_from(snapshot.envelope.version) {
        Ok(EnvelopeVersion::Plain) => "plain".to_string(),
        Ok(EnvelopeVersion::Aes256Gcm) => "aes-256-gcm".to_string(),
        Ok(EnvelopeVersion::ChaCha20Poly1305) => "chacha20-poly1305".to_string(),
        Err(_) => format!("unknown (v{})", snapshot.envelope.version),
    };
    format!(
        "{:<12} {:<26} {}",
        snapshot.generation,
        humantime::format_rfc3339_millis(taken),
        cipher
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::context::init_fixture;
    use larder::persistence::Envelope;
    use tempfile::TempDir;

    #[test]
    fn test_describe_snapshot() {
        let mut snapshot = BackupSnapshot::new("k", 7, Envelope::plain(b"1"));
        snapshot.timestamp = 0;

        let line = describe(&snapshot);
        assert!(line.starts_with("7 "));
        assert!(line.contains("1970-01-01T00:00:00.000Z"));
        assert!(line.ends_with("plain"));
    }

    #[tokio::test]
    async fn test_snapshot_advances_generation() {
        let temp_dir = TempDir::new().unwrap();
        let config = Some(init_fixture(temp_dir.path()).to_string_lossy().to_string());

        crate::cli::put::execute(config.clone(), None, "k".into(), "1".into())
            .await
            .unwrap();
        snapshot(config.clone(), None, "k".into()).await.unwrap();

        let ctx = StoreContext::open(config, None).await.unwrap();
        let store = ctx.hub.store("k", Value::Null, ctx.config.load_options());
        assert_eq!(store.generations().await, vec![1, 0]);
    }

    #[tokio::test]
    async fn test_snapshot_of_missing_key_fails() {
        let temp_dir = TempDir::new().unwrap();
        let config = Some(init_fixture(temp_dir.path()).to_string_lossy().to_string());

        let err = snapshot(config, None, "absent".into()).await.unwrap_err();
        assert!(err.to_string().contains("no valid value"));
    }
}
