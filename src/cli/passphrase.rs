//! Store mnemonic handling
//!
//! The mnemonic is the only secret: every storage key is derived from it.
//! It is looked up, in order, from `--passphrase-file`, the `passphrase.txt`
//! next to the config, `LARDER_PASSPHRASE`, and finally a masked prompt.

use bip39::{Language, Mnemonic};
use rand::RngCore;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

pub const PASSPHRASE_ENV: &str = "LARDER_PASSPHRASE";

const MNEMONIC_WORDS: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MnemonicSource {
    File(PathBuf),
    /// `LARDER_PASSPHRASE`; warned about, since env vars leak into process listings
    Env,
    Prompt,
}

/// A fresh 24-word English mnemonic from 256 bits of OS randomness
pub fn generate_mnemonic() -> Result<String, Box<dyn std::error::Error>> {
    let mut entropy = zeroize::Zeroizing::new([0u8; 32]);
    rand::rngs::OsRng.fill_bytes(&mut entropy[..]);

    let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy[..])
        .map_err(|e| format!("Could not build mnemonic: {}", e))?;
    Ok(mnemonic.to_string())
}

/// Pick where the mnemonic comes from
pub fn mnemonic_source(explicit_file: Option<String>, default_file: &Path) -> MnemonicSource {
    match explicit_file {
        Some(file) => MnemonicSource::File(PathBuf::from(file)),
        None if default_file.exists() => MnemonicSource::File(default_file.to_path_buf()),
        None if std::env::var_os(PASSPHRASE_ENV).is_some() => MnemonicSource::Env,
        None => MnemonicSource::Prompt,
    }
}

/// Read the mnemonic and check that it is a valid BIP-39 phrase
///
/// Surrounding whitespace is ignored and inner runs of whitespace collapse to
/// single spaces, so hand-edited files still work.
pub fn read_mnemonic(source: &MnemonicSource) -> Result<String, Box<dyn std::error::Error>> {
    let raw = match source {
        MnemonicSource::File(path) => std::fs::read_to_string(path).map_err(|e| {
            format!("Cannot read mnemonic file '{}': {}", path.display(), e)
        })?,
        MnemonicSource::Env => {
            eprintln!("⚠️  Reading the store mnemonic from {PASSPHRASE_ENV}; prefer --passphrase-file");
            std::env::var(PASSPHRASE_ENV)
                .map_err(|_| format!("{} is not set", PASSPHRASE_ENV))?
        }
        MnemonicSource::Prompt => rpassword::prompt_password("Store mnemonic: ")
            .map_err(|e| format!("Cannot prompt for mnemonic: {}", e))?,
    };

    let words: Vec<&str> = raw.split_whitespace().collect();
    if words.is_empty() {
        return Err(format!("No mnemonic found ({})", describe(source)).into());
    }

    let phrase = words.join(" ");
    Mnemonic::parse_in(Language::English, &phrase)
        .map_err(|e| format!("Invalid mnemonic ({}): {}", describe(source), e))?;
    Ok(phrase)
}

fn describe(source: &MnemonicSource) -> String {
    match source {
        MnemonicSource::File(path) => format!("file {}", path.display()),
        MnemonicSource::Env => PASSPHRASE_ENV.to_string(),
        MnemonicSource::Prompt => "prompt".to_string(),
    }
}

/// Write the mnemonic to `path`, readable by the owner only
pub fn write_mnemonic_file(mnemonic: &str, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Cannot create '{}': {}", dir.display(), e))?;
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| format!("Cannot open '{}' for writing: {}", path.display(), e))?;
    file.write_all(format!("{mnemonic}\n").as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|e| format!("Cannot write '{}': {}", path.display(), e))?;
    Ok(())
}

/// Print a new mnemonic once, on stderr, grouped four words per line
pub fn announce_mnemonic(mnemonic: &str, written_to: Option<&Path>) {
    let rule = "─".repeat(64);
    eprintln!("\n{rule}");
    eprintln!("New store mnemonic. Anyone holding it can read the store;");
    eprintln!("losing it makes every stored value unrecoverable.\n");

    let words: Vec<&str> = mnemonic.split_whitespace().collect();
    for (row, chunk) in words.chunks(4).enumerate() {
        let numbered: Vec<String> = chunk
            .iter()
            .enumerate()
            .map(|(i, word)| format!("{:>2}. {:<10}", row * 4 + i + 1, word))
            .collect();
        eprintln!("  {}", numbered.join(" "));
    }

    if let Some(path) = written_to {
        eprintln!("\nWritten to {} (owner read/write only).", path.display());
    }
    eprintln!("{rule}\n");
}
