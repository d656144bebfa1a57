use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ChatlineError, Result};

/// Message sync behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    /// Max timestamp distance for matching a local echo to its server copy
    /// when neither a write ack nor a client token links them.
    pub reconciliation_window_ms: u64,
    /// Forward messages written while offline once connectivity returns.
    pub replay_offline_on_reconnect: bool,
    /// Cache bound; oldest confirmed messages are evicted first. 0 = unbounded.
    pub max_cached_messages: usize,
    /// Automatic retries for a rejected write. 0 leaves it pending until the
    /// user retries.
    pub max_write_retries: u32,
    pub retry_base_delay_ms: u64,
    /// How often the session checks the outbox for due retries.
    pub outbox_tick_ms: u64,
    /// Max text body size in bytes
    pub max_message_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            reconciliation_window_ms: 5_000,
            replay_offline_on_reconnect: false,
            max_cached_messages: 5_000,
            max_write_retries: 0,
            retry_base_delay_ms: 5_000,
            outbox_tick_ms: 1_000,
            max_message_size: 64 * 1024,
        }
    }
}

impl SyncSettings {
    pub fn reconciliation_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.reconciliation_window_ms as i64)
    }

    pub fn retry_base_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn outbox_tick(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.outbox_tick_ms.max(10))
    }
}

/// Where the cache snapshot lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    /// Prefix of the storage key, one per chat thread/user.
    pub namespace: String,
    pub data_dir: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            namespace: "chatline".to_string(),
            data_dir: None,
        }
    }
}

impl StorageSettings {
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|p| p.join("chatline"))
                .unwrap_or_else(|| PathBuf::from(".chatline"))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub sync: SyncSettings,
    pub storage: StorageSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            sync: SyncSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

/// Loads settings from an optional TOML file, then `CHATLINE__*` environment
/// variables (e.g. `CHATLINE__SYNC__MAX_WRITE_RETRIES=3`).
pub struct ConfigService {
    config: AppConfig,
    path: Option<PathBuf>,
}

impl ConfigService {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CHATLINE")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ChatlineError::ConfigError(format!("Load settings: {}", e)))?;

        log::info!(
            "Loaded settings (window={}ms, replay_offline={}, max_cached={})",
            config.sync.reconciliation_window_ms,
            config.sync.replay_offline_on_reconnect,
            config.sync.max_cached_messages
        );
        Ok(Self {
            config,
            path: path.map(Path::to_path_buf),
        })
    }

    pub fn from_config(config: AppConfig) -> Self {
        Self { config, path: None }
    }

    pub fn get(&self) -> &AppConfig {
        &self.config
    }

    pub fn update(&mut self, config: AppConfig) {
        self.config = config;
    }

    /// Write the current settings back to the file they were loaded from.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Err(ChatlineError::ConfigError(
                "No settings file to save to".to_string(),
            ));
        };
        let data = toml::to_string_pretty(&self.config)
            .map_err(|e| ChatlineError::ConfigError(format!("Serialize settings: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        Ok(())
    }
}
