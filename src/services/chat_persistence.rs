//! Durable local storage for the message snapshot.
//!
//! Layout of `FileStorage`:
//!   {base}/{sanitized key}.json   – one value per key
//!
//! Snapshots are written as `{"version": 1, "messages": [...]}`. Readers
//! accept any version plus the bare array written by older clients; unknown
//! fields are ignored and missing optional fields take their defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::chat_types::{Message, WireMessage};
use crate::error::{ChatlineError, Result};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Scoped key-value byte storage.
pub trait LocalStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// One file per key under a base directory.
pub struct FileStorage {
    base_dir: PathBuf,
}

impl FileStorage {
    pub fn new(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir).map_err(|e| {
            ChatlineError::PersistenceFailed(format!("Create storage dir {:?}: {}", base_dir, e))
        })?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.json", sanitize_filename(key)))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl LocalStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read(&path)
            .map(Some)
            .map_err(|e| ChatlineError::PersistenceFailed(format!("Read {}: {}", key, e)))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        // Write beside the target and rename so a crash never leaves half a
        // snapshot behind.
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)
            .map_err(|e| ChatlineError::PersistenceFailed(format!("Write {}: {}", key, e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| ChatlineError::PersistenceFailed(format!("Replace {}: {}", key, e)))
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| ChatlineError::PersistenceFailed(format!("Delete {}: {}", key, e)))?;
        }
        Ok(())
    }
}

/// Process-local storage, for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.values
            .lock()
            .map_err(|_| ChatlineError::PersistenceFailed("memory storage poisoned".to_string()))
    }
}

impl LocalStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

// ── Snapshot codec ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SnapshotOut<'a> {
    version: u32,
    messages: &'a [WireMessage],
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotIn {
    Versioned {
        version: u32,
        messages: Vec<serde_json::Value>,
    },
    Legacy(Vec<serde_json::Value>),
}

pub fn snapshot_key(namespace: &str) -> String {
    format!("{}.messages", namespace)
}

pub fn encode_snapshot(messages: &[Message]) -> Result<Vec<u8>> {
    let wire: Vec<WireMessage> = messages.iter().map(Message::to_wire).collect();
    let bytes = serde_json::to_vec(&SnapshotOut {
        version: SNAPSHOT_VERSION,
        messages: &wire,
    })?;
    Ok(bytes)
}

/// Decode a persisted snapshot. Individual records that no longer parse are
/// skipped rather than failing the whole snapshot.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Vec<Message>> {
    let records = match serde_json::from_slice::<SnapshotIn>(bytes)? {
        SnapshotIn::Versioned { version, messages } => {
            if version > SNAPSHOT_VERSION {
                log::info!(
                    "Reading snapshot version {} with version {} reader",
                    version,
                    SNAPSHOT_VERSION
                );
            }
            messages
        }
        SnapshotIn::Legacy(messages) => messages,
    };

    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let parsed = serde_json::from_value::<WireMessage>(record)
            .map_err(ChatlineError::from)
            .and_then(Message::try_from);
        match parsed {
            Ok(message) => out.push(message),
            Err(e) => log::warn!("Skipping unreadable cached message: {}", e),
        }
    }
    Ok(out)
}

fn sanitize_filename(name: &str) -> String {
    name.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_")
}
