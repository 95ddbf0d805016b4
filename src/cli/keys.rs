use crate::cli::context::{config_path, load_config, open_kv};
use larder::persistence::record::parse_backup_key;

/// List primary keys with the number of backup snapshots each has
///
/// Needs no mnemonic: nothing is decrypted.
pub async fn execute(config: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&config_path(config.as_deref()))?;
    let kv = open_kv(&config).await?;

    let listing = summarize(kv.list_keys().await?);
    if listing.is_empty() {
        println!("(empty)");
    }
    for (key, backups) in listing {
        println!("{:<40} {} backup(s)", key, backups);
    }
    Ok(())
}

/// Fold backup keys into their primary: `(key, backup count)`, sorted.
pub fn summarize(storage_keys: Vec<String>) -> Vec<(String, usize)> {
    let mut counts = std::collections::BTreeMap::<String, usize>::new();
    for storage_key in &storage_keys {
        match parse_backup_key(storage_key) {
            Some((key, _slot)) => *counts.entry(key.to_string()).or_default() += 1,
            None => {
                counts.entry(storage_key.clone()).or_default();
            }
        }
    }
    counts.into_iter().collect()
}
