use crate::cli::context::StoreContext;
use larder::persistence::LoadSource;
use serde_json::Value;

/// Print the JSON value stored under `key`
///
/// A corrupted primary is recovered from backups (and healed) on the way.
/// Fails when nothing usable is stored.
pub async fn execute(
    config: Option<String>,
    passphrase_file: Option<String>,
    key: String,
    report: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = StoreContext::open(config, passphrase_file).await?;
    let store = ctx.hub.store(&key, Value::Null, ctx.config.load_options());

    let outcome = store.load_with_report().await;
    // Let a heal write land before the process exits
    store.flush().await;

    if outcome.source == LoadSource::Default {
        return Err(format!("No usable value stored under '{}'", key).into());
    }

    println!("{}", serde_json::to_string_pretty(&outcome.value)?);
    if report {
        eprintln!("source: {}", outcome.source);
    }
    Ok(())
}
