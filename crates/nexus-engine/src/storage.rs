//! Durable key-value storage behind the session store and tool registry.
//!
//! The persisted layout is a handful of JSON records under well-known
//! keys, last-writer-wins, with a single active writer per running
//! instance. Two implementations: an in-memory store for tests and
//! transient use, and a JSON-file-backed store at a platform default
//! path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use nexus_common::StorageError;

/// Well-known record keys.
pub mod keys {
    pub const SESSIONS: &str = "sessions";
    pub const PENDING_SESSION: &str = "pending_session";
    pub const PENDING_EXPIRES_AT: &str = "pending_expires_at";
    pub const TOOL_SERVERS: &str = "tool_servers";
    pub const ACTIVE_TOOL_SERVER: &str = "active_tool_server";
    pub const MODEL_DEFAULTS: &str = "model_defaults";
}

/// Abstract durable key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError>;
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory store. Contents vanish with the process.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        self.records.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.records.lock().await.remove(key);
        Ok(())
    }
}

/// JSON-file-backed store: one object, one key per record.
///
/// The whole file is rewritten after every mutation; records are small
/// (session list, tool-server configs, one pending marker).
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<HashMap<String, serde_json::Value>>,
}

impl JsonFileStore {
    /// Open a store at a specific path, loading existing records.
    ///
    /// A missing file starts empty; an unparseable file is logged and
    /// treated as empty rather than failing startup.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let records = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| StorageError::Read(format!("{}: {e}", path.display())))?;
            match serde_json::from_str::<HashMap<String, serde_json::Value>>(&content) {
                Ok(map) => map,
                Err(e) => {
                    warn!("discarding unparseable store at {}: {e}", path.display());
                    HashMap::new()
                }
            }
        } else {
            info!("no store found at {}, starting empty", path.display());
            HashMap::new()
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Open the store at the platform default path.
    ///
    /// On macOS: `~/Library/Application Support/nexus/store.json`
    /// On Linux: `~/.config/nexus/store.json`
    pub fn open_default() -> Result<Self, StorageError> {
        Self::open(default_store_path()?)
    }

    async fn flush(
        &self,
        records: &HashMap<String, serde_json::Value>,
    ) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Write(format!("{}: {e}", parent.display())))?;
        }
        let content = serde_json::to_string_pretty(records)
            .map_err(|e| StorageError::Serialize(e.to_string()))?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| StorageError::Write(format!("{}: {e}", self.path.display())))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Platform-specific default store file path.
pub fn default_store_path() -> Result<PathBuf, StorageError> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| StorageError::Read("could not determine config directory".into()))?;
    Ok(config_dir.join("nexus").join("store.json"))
}

#[async_trait]
impl KvStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let mut records = self.records.lock().await;
        records.insert(key.to_string(), value);
        self.flush(&records).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut records = self.records.lock().await;
        if records.remove(key).is_some() {
            self.flush(&records).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.get("missing").await.unwrap().is_none());

        store
            .set("k", serde_json::json!({ "a": 1 }))
            .await
            .unwrap();
        assert_eq!(
            store.get("k").await.unwrap(),
            Some(serde_json::json!({ "a": 1 }))
        );

        store.remove("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = JsonFileStore::open(&path).unwrap();
        store
            .set(keys::SESSIONS, serde_json::json!([{ "id": "s1" }]))
            .await
            .unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).unwrap();
        let sessions = reopened.get(keys::SESSIONS).await.unwrap().unwrap();
        assert_eq!(sessions[0]["id"], "s1");
    }

    #[tokio::test]
    async fn file_store_tolerates_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "not json at all").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.get(keys::SESSIONS).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_missing_key_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("store.json")).unwrap();
        store.remove("absent").await.unwrap();
        assert!(!store.path().exists());
    }
}
