use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

pub const LOGS_KEY: &str = "logs";
pub const SYNC_CURSORS_KEY: &str = "syncCursors";

/// Namespaced key/value persistence for the canonical set and sync cursors.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, String>;
    async fn set(&self, key: &str, value: Value) -> Result<(), String>;
    async fn delete(&self, key: &str) -> Result<(), String>;
}

/// One JSON document per store id, rewritten atomically on every change.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<Map<String, Value>>,
}

impl JsonFileStore {
    pub fn open(directory: &Path, store_id: &str) -> Result<Self, String> {
        let path = directory.join(format!("{store_id}.json"));
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Map<String, Value>>(&content) {
                Ok(entries) => entries,
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        parse_error = %error,
                        "Store file is corrupt, starting empty"
                    );
                    Map::new()
                }
            },
            Err(error) if error.kind() == ErrorKind::NotFound => Map::new(),
            Err(error) => {
                return Err(format!("Failed to read store '{}': {error}", path.display()));
            }
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, String> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), String> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        write_store_file(&self.path, &entries)
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_none() {
            return Ok(());
        }
        write_store_file(&self.path, &entries)
    }
}

fn write_store_file(path: &Path, entries: &Map<String, Value>) -> Result<(), String> {
    if let Some(parent_directory) = path.parent() {
        std::fs::create_dir_all(parent_directory).map_err(|error| {
            format!(
                "Failed to create store directory '{}': {error}",
                parent_directory.display()
            )
        })?;
    }

    let temp_path = temporary_store_path(path);
    let serialized = serde_json::to_string(entries)
        .map_err(|error| format!("Failed to serialize store: {error}"))?;

    std::fs::write(&temp_path, serialized).map_err(|error| {
        format!(
            "Failed to write temporary store '{}': {error}",
            temp_path.display()
        )
    })?;

    if let Err(error) = std::fs::rename(&temp_path, path) {
        let cleanup_error = std::fs::remove_file(&temp_path).err();
        if let Some(cleanup_error) = cleanup_error {
            return Err(format!(
                "Failed to finalize store '{}': {error}; temporary cleanup failed '{}': {cleanup_error}",
                path.display(),
                temp_path.display()
            ));
        }

        return Err(format!("Failed to finalize store '{}': {error}", path.display()));
    }

    Ok(())
}

fn temporary_store_path(path: &Path) -> PathBuf {
    let Some(file_name) = path.file_name().and_then(|value| value.to_str()) else {
        return path.with_extension("json.tmp");
    };

    path.with_file_name(format!("{file_name}.tmp"))
}

/// In-process store, used by tests and when no store directory is configured.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, String> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), String> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{JsonFileStore, KeyValueStore, MemoryStore};
    use serde_json::json;

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let temp_directory = tempfile::tempdir().expect("Failed to create temporary store directory");

        let store = JsonFileStore::open(temp_directory.path(), "logs-store")
            .expect("Expected empty store to open");
        assert_eq!(store.get("logs").await.expect("read succeeds"), None);

        store
            .set("logs", json!([{ "id": "a" }]))
            .await
            .expect("Expected store write to succeed");
        store
            .set("syncCursors", json!({ "peer": "2024-06-07T12:00:00.000Z" }))
            .await
            .expect("Expected store write to succeed");
        store.delete("syncCursors").await.expect("Expected delete to succeed");

        let reopened = JsonFileStore::open(temp_directory.path(), "logs-store")
            .expect("Expected existing store to open");
        assert_eq!(
            reopened.get("logs").await.expect("read succeeds"),
            Some(json!([{ "id": "a" }]))
        );
        assert_eq!(reopened.get("syncCursors").await.expect("read succeeds"), None);
        assert!(!temp_directory.path().join("logs-store.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_store_file_starts_empty() {
        let temp_directory = tempfile::tempdir().expect("Failed to create temporary store directory");
        std::fs::write(temp_directory.path().join("broken.json"), b"{not json")
            .expect("Failed to write corrupt store");

        let store = JsonFileStore::open(temp_directory.path(), "broken").expect("Expected store to open");
        assert_eq!(store.get("logs").await.expect("read succeeds"), None);
    }

    #[tokio::test]
    async fn memory_store_round_trips_values() {
        let store = MemoryStore::default();
        store.set("k", json!(1)).await.expect("set succeeds");
        assert_eq!(store.get("k").await.expect("get succeeds"), Some(json!(1)));
        store.delete("k").await.expect("delete succeeds");
        assert_eq!(store.get("k").await.expect("get succeeds"), None);
    }
}
