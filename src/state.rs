use std::sync::Arc;

use crate::error::Result;
use crate::services::chat_backend::RemoteBackend;
use crate::services::chat_persistence::{snapshot_key, FileStorage, LocalStorage};
use crate::services::config::{AppConfig, SyncSettings};

/// Collaborators of the sync layer, built once at start-up and passed down
/// explicitly.
#[derive(Clone)]
pub struct SyncContext {
    pub backend: Arc<dyn RemoteBackend>,
    pub storage: Arc<dyn LocalStorage>,
    pub settings: SyncSettings,
    pub namespace: String,
}

impl SyncContext {
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        storage: Arc<dyn LocalStorage>,
        settings: SyncSettings,
        namespace: &str,
    ) -> Self {
        Self {
            backend,
            storage,
            settings,
            namespace: namespace.to_string(),
        }
    }

    /// File-backed context using the configured data directory.
    pub fn from_config(backend: Arc<dyn RemoteBackend>, config: &AppConfig) -> Result<Self> {
        let data_dir = config.storage.resolved_data_dir();
        log::info!("Using message cache directory {:?}", data_dir);
        let storage = Arc::new(FileStorage::new(&data_dir)?);
        Ok(Self::new(
            backend,
            storage,
            config.sync.clone(),
            &config.storage.namespace,
        ))
    }

    pub fn storage_key(&self) -> String {
        snapshot_key(&self.namespace)
    }
}
