//! Larder configuration file handling
//!
//! Configuration files are TOML and live in the larder data directory next to
//! the store itself:
//!
//! ```text
//! ~/.local/share/larder/
//!   config.toml
//!   passphrase.txt
//!   store/
//! ```
//!
//! Durations are written in humantime form (`"60s"`, `"1m 30s"`, `"500ms"`).

use larder::crypto::MAX_EPOCH;
use larder::network::MonitorOptions;
use larder::persistence::{CipherSuite, LoadOptions};
use larder::resilience::{CircuitBreakerOptions, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOG_FILTER: &str = "info";

/// Default reachability probe target
const DEFAULT_PROBE_TARGET: &str = "1.1.1.1:443";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LarderConfig {
    pub store: StoreConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding one file per key
    pub path: PathBuf,

    /// Seal values (disable only for debugging)
    #[serde(default = "default_true")]
    pub encryption: bool,

    /// "aes-256-gcm" or "chacha20-poly1305"
    #[serde(default = "default_cipher")]
    pub cipher: String,

    /// Key epoch, starting at 1; bump to rotate keys (older epochs stay readable)
    #[serde(default = "default_key_epoch")]
    pub key_epoch: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    #[serde(with = "humantime_text")]
    pub interval: Duration,
    pub retention: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        let options = LoadOptions::default();
        Self {
            enabled: options.backup,
            interval: options.backup_interval,
            retention: options.retention,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "humantime_text")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_text")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "humantime_text")]
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            initial_delay: policy.initial_delay,
            max_delay: policy.max_delay,
            backoff_multiplier: policy.backoff_multiplier,
            jitter: policy.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "humantime_text")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        let options = CircuitBreakerOptions::default();
        Self {
            failure_threshold: options.failure_threshold,
            reset_timeout: options.reset_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `host:port` opened by the reachability probe
    pub probe_target: String,
    #[serde(with = "humantime_text")]
    pub probe_timeout: Duration,
    #[serde(with = "humantime_text")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_text")]
    pub refresh_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let options = MonitorOptions::default();
        Self {
            probe_target: DEFAULT_PROBE_TARGET.to_string(),
            probe_timeout: options.probe_timeout,
            poll_interval: options.poll_interval,
            refresh_interval: options.refresh_interval,
        }
    }
}

/// `[logging]`; `RUST_LOG` still wins when set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive such as `warn` or `larder=debug`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LOG_FILTER.into(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_key_epoch() -> u32 {
    1
}

fn default_cipher() -> String {
    "aes-256-gcm".to_string()
}

/// Serde adapter for humantime duration strings.
mod humantime_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

impl LarderConfig {
    /// Create a configuration with defaults for the given store directory
    pub fn new(store_path: PathBuf) -> Self {
        Self {
            store: StoreConfig {
                path: store_path,
                encryption: true,
                cipher: default_cipher(),
                key_epoch: default_key_epoch(),
            },
            backup: BackupConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Read and validate `path`
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
        let config: LarderConfig =
            toml::from_str(&text).map_err(|e| format!("{} is malformed: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        self.cipher_suite()?;
        let epoch = self.store.key_epoch;
        if !(1..=MAX_EPOCH).contains(&epoch) {
            return Err(format!(
                "store.key_epoch must be between 1 and {}, got {}",
                MAX_EPOCH, epoch
            ));
        }
        Ok(())
    }

    /// Write the config with its commented header, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let body = toml::to_string_pretty(self)?;
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .map_err(|e| format!("Cannot create {}: {}", dir.display(), e))?;
        }
        fs::write(path, [CONFIG_HEADER, body.as_str()].concat())
            .map_err(|e| format!("Cannot write {}: {}", path.display(), e))?;
        Ok(())
    }

    pub fn cipher_suite(&self) -> Result<CipherSuite, String> {
        match self.store.cipher.to_ascii_lowercase().as_str() {
            "aes-256-gcm" | "aes256gcm" => Ok(CipherSuite::Aes256Gcm),
            "chacha20-poly1305" | "chacha20poly1305" => Ok(CipherSuite::ChaCha20Poly1305),
            other => Err(format!(
                "Unknown cipher '{}' (expected aes-256-gcm or chacha20-poly1305)",
                other
            )),
        }
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            encryption: self.store.encryption,
            backup: self.backup.enabled,
            backup_interval: self.backup.interval,
            retention: self.backup.retention,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_delay: self.retry.initial_delay,
            max_delay: self.retry.max_delay,
            backoff_multiplier: self.retry.backoff_multiplier,
            jitter: self.retry.jitter,
        }
    }

    pub fn breaker_options(&self, name: &str) -> CircuitBreakerOptions {
        CircuitBreakerOptions {
            name: name.to_string(),
            failure_threshold: self.circuit_breaker.failure_threshold,
            reset_timeout: self.circuit_breaker.reset_timeout,
        }
    }

    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            probe_timeout: self.network.probe_timeout,
            refresh_interval: self.network.refresh_interval,
            poll_interval: self.network.poll_interval,
        }
    }
}

const CONFIG_HEADER: &str = "\
# Larder configuration
#
# Durations use humantime syntax: \"500ms\", \"30s\", \"1m 30s\".
# Raising store.key_epoch rotates the storage key; values sealed under
# earlier epochs are re-encrypted the next time they are read.

";

/// Default data directory: `{data_dir}/larder`
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("larder")
}

pub fn default_store_path() -> PathBuf {
    default_data_dir().join("store")
}

pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

/// The passphrase file is stored next to the config file.
pub fn default_passphrase_path(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .unwrap_or(config_path)
        .join("passphrase.txt")
}
