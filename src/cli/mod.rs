use clap::{Parser, Subcommand};
use std::time::Duration;

pub mod backup;
pub mod config;
pub mod context;
pub mod get;
pub mod init;
pub mod keys;
pub mod passphrase;
pub mod probe;
pub mod put;
pub mod verify;
pub mod version;

#[derive(Parser)]
#[command(name = "larder")]
#[command(author = "Larder Project")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Encrypted, self-healing local key-value store", long_about = None)]
pub struct Cli {
    /// Path to config file (default: ~/.local/share/larder/config.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Path to file containing the store mnemonic
    /// Default: passphrase.txt next to the config file
    #[arg(long, global = true)]
    pub passphrase_file: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a config file and a fresh store mnemonic
    Init {
        /// Directory for stored values (optional, uses default if not specified)
        #[arg(long)]
        store_path: Option<String>,

        /// Overwrite an existing config and mnemonic
        #[arg(long)]
        force: bool,
    },

    /// Store a JSON value under a key
    Put {
        key: String,

        /// Value as JSON text, e.g. '{"theme":"dark"}'
        json: String,
    },

    /// Print the value stored under a key
    Get {
        key: String,

        /// Print where the value came from (primary, backup, ...)
        #[arg(long)]
        report: bool,
    },

    /// List stored keys
    Keys,

    /// Snapshot a key into its backup ring now
    Backup { key: String },

    /// List backup snapshots of a key, newest first
    Backups { key: String },

    /// Check every stored value and report corruption
    Verify,

    /// Check network reachability
    Probe {
        /// host:port to connect to (default: from config)
        #[arg(long)]
        target: Option<String>,

        /// Keep probing until reachable or this much time passes (e.g. "30s")
        #[arg(long, value_parser = humantime::parse_duration)]
        wait: Option<Duration>,
    },

    /// Display version information
    Version,
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let Cli {
        config,
        passphrase_file,
        command,
    } = cli;

    match command {
        Commands::Init { store_path, force } => {
            init::execute(config, store_path, passphrase_file, force).await
        }
        Commands::Put { key, json } => put::execute(config, passphrase_file, key, json).await,
        Commands::Get { key, report } => get::execute(config, passphrase_file, key, report).await,
        Commands::Keys => keys::execute(config).await,
        Commands::Backup { key } => backup::snapshot(config, passphrase_file, key).await,
        Commands::Backups { key } => backup::list(config, key).await,
        Commands::Verify => verify::execute(config, passphrase_file).await,
        Commands::Probe { target, wait } => probe::execute(config, target, wait).await,
        Commands::Version => {
            version::execute();
            Ok(())
        }
    }
}

/// Log level from the config file, if one can be read.
pub fn configured_log_level(cli: &Cli) -> String {
    let path = context::config_path(cli.config.as_deref());
    config::LarderConfig::load(&path)
        .map(|config| config.logging.level)
        .unwrap_or_else(|_| "info".to_string())
}
