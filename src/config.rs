use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "compass-extension.toml";

/// 15 minutes, matching the unlock window shown in the popup.
pub const DEFAULT_PASSWORD_TTL_MS: u64 = 15 * 60 * 1000;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ExtensionConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub keyring: KeyringConfig,
    #[serde(default)]
    pub password_cache: PasswordCacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sled,
    Memory,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_storage_path() -> String {
    "./data/extension".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct KeyringConfig {
    /// PBKDF2 rounds used when encrypting new account secrets.
    #[serde(default = "default_kdf_rounds")]
    pub kdf_rounds: u32,
    /// Persist accounts flagged `isTesting` instead of keeping them in memory.
    #[serde(default)]
    pub store_testing_accounts: bool,
}

fn default_kdf_rounds() -> u32 {
    100_000
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PasswordCacheConfig {
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
}

fn default_ttl_ms() -> u64 {
    DEFAULT_PASSWORD_TTL_MS
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sled,
            path: default_storage_path(),
        }
    }
}

impl Default for KeyringConfig {
    fn default() -> Self {
        Self {
            kdf_rounds: default_kdf_rounds(),
            store_testing_accounts: false,
        }
    }
}

impl Default for PasswordCacheConfig {
    fn default() -> Self {
        Self { ttl_ms: default_ttl_ms() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            keyring: KeyringConfig::default(),
            password_cache: PasswordCacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ExtensionConfig {
    /// In-memory everything, used by tests and the `--ephemeral` flag.
    pub fn ephemeral() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                path: String::new(),
            },
            keyring: KeyringConfig {
                kdf_rounds: 1_000,
                ..KeyringConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn from_toml(s: &str) -> crate::error::Result<Self> {
        toml::from_str(s).map_err(|e| crate::error::ExtensionError::Config(e.to_string()))
    }

    pub fn load_or_default(path: &str) -> Self {
        if std::path::Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(s) => match Self::from_toml(&s) {
                    Ok(c) => {
                        info!("Config loaded from {}", path);
                        c
                    }
                    Err(e) => {
                        warn!("Error parsing config: {}. Using defaults.", e);
                        Self::default()
                    }
                },
                Err(e) => {
                    warn!("Error reading config: {}. Using defaults.", e);
                    Self::default()
                }
            }
        } else {
            info!("Config file not found at '{}'. Creating default.", path);
            let config = Self::default();
            if let Ok(s) = toml::to_string_pretty(&config) {
                let _ = std::fs::write(path, s);
            }
            config
        }
    }
}
