use crate::cli::context::StoreContext;
use serde_json::Value;

/// Store a JSON value under `key`
///
/// Waits for the write and any backup it triggers before returning, so the
/// process can exit right after.
pub async fn execute(
    config: Option<String>,
    passphrase_file: Option<String>,
    key: String,
    json: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let value: Value =
        serde_json::from_str(&json).map_err(|e| format!("Value is not valid JSON: {}", e))?;

    let ctx = StoreContext::open(config, passphrase_file).await?;
    let store = ctx.hub.store(&key, Value::Null, ctx.config.load_options());

    store.save(&value).await?;
    store.flush().await;

    println!("Stored '{}'", key);
    Ok(())
}
