use crate::cli::context::{build_codec, config_path, load_config, open_kv};
use crate::cli::passphrase::{mnemonic_source, read_mnemonic};
use crate::cli::config::default_passphrase_path;
use larder::persistence::record::parse_backup_key;
use larder::persistence::{
    classify, BackupSnapshot, Classification, Codec, CorruptionError, Envelope, StorageRecord,
};
use std::fmt;

/// What one stored value looks like on inspection.
#[derive(Debug)]
pub enum Verdict {
    /// Opens with the active key
    Ok,
    /// Opens, but with a retired key or an older cipher; resealed on next read
    Stale,
    /// Pre-envelope plaintext; migrated on next read
    Legacy,
    Empty,
    Corrupted(CorruptionError),
}

impl Verdict {
    pub fn is_failure(&self) -> bool {
        matches!(self, Verdict::Corrupted(_))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Ok => write!(f, "✅ ok"),
            Verdict::Stale => write!(f, "🔁 ok, resealed on next read"),
            Verdict::Legacy => write!(f, "🔁 legacy plaintext, migrated on next read"),
            Verdict::Empty => write!(f, "⚪ empty"),
            Verdict::Corrupted(e) => write!(f, "❌ {}", e),
        }
    }
}

/// Inspect the raw value stored under `storage_key`
pub fn inspect(codec: &Codec, storage_key: &str, raw: Option<&str>) -> Verdict {
    match classify(raw) {
        Classification::Empty => return Verdict::Empty,
        Classification::Corrupted(reason) => {
            return Verdict::Corrupted(CorruptionError::Rejected(reason))
        }
        Classification::Candidate => {}
    }
    let raw = raw.unwrap_or_default();

    let envelope: Result<Envelope, CorruptionError> = match parse_backup_key(storage_key) {
        Some((key, _slot)) => BackupSnapshot::parse(raw, key).map(|s| s.envelope),
        None => match StorageRecord::parse(raw, storage_key) {
            Err(CorruptionError::NotARecord(_)) => return Verdict::Legacy,
            other => other.map(|r| r.envelope),
        },
    };

    let opened = match envelope {
        Ok(envelope) => codec.open(&envelope),
        Err(e) => return Verdict::Corrupted(e),
    };

    match opened {
        Ok(opened) if opened.retired_key || opened.version != codec.current_version() => {
            Verdict::Stale
        }
        Ok(_) => Verdict::Ok,
        Err(e) => Verdict::Corrupted(e.into()),
    }
}

/// Check every stored value, primaries and backups
///
/// Fails if any value is corrupted. Stale and legacy values are reported but
/// are repaired on their next read.
pub async fn execute(
    config: Option<String>,
    passphrase_file: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path(config.as_deref());
    let config = load_config(&config_path)?;

    let source = mnemonic_source(passphrase_file, &default_passphrase_path(&config_path));
    let codec = build_codec(&config, &read_mnemonic(&source)?)?;
    let kv = open_kv(&config).await?;

    println!("🔍 Verifying store at {}", config.store.path.display());
    println!();

    let mut storage_keys = kv.list_keys().await?;
    storage_keys.sort();

    let mut failures = 0usize;
    for storage_key in &storage_keys {
        let verdict = match kv.get(storage_key).await {
            Ok(raw) => inspect(&codec, storage_key, raw.as_deref()),
            Err(e) => {
                println!("  {:<40} ❌ unreadable: {}", storage_key, e);
                failures += 1;
                continue;
            }
        };

        if verdict.is_failure() {
            failures += 1;
        }
        println!("  {:<40} {}", storage_key, verdict);
    }

    println!();
    if failures == 0 {
        println!("✅ {} value(s) checked, all readable", storage_keys.len());
        Ok(())
    } else {
        Err(format!(
            "{} of {} value(s) failed verification",
            failures,
            storage_keys.len()
        )
        .into())
    }
}
