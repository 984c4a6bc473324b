//! Durable session records. Keyed by thread id; survives in-memory session
//! eviction so a later message in the same thread can rehydrate the
//! conversation. Writes are read-after-write consistent within a process.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use agent_relay_error::RelayError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub accumulated_cost_usd: f64,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, thread_id: &str) -> Result<Option<SessionRecord>, RelayError>;
    async fn save(&self, thread_id: &str, record: &SessionRecord) -> Result<(), RelayError>;
    async fn remove(&self, thread_id: &str) -> Result<(), RelayError>;
    async fn list(&self) -> Result<Vec<(String, SessionRecord)>, RelayError>;
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, thread_id: &str) -> Result<Option<SessionRecord>, RelayError> {
        Ok(self.records.lock().await.get(thread_id).cloned())
    }

    async fn save(&self, thread_id: &str, record: &SessionRecord) -> Result<(), RelayError> {
        self.records
            .lock()
            .await
            .insert(thread_id.to_string(), record.clone());
        Ok(())
    }

    async fn remove(&self, thread_id: &str) -> Result<(), RelayError> {
        self.records.lock().await.remove(thread_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(String, SessionRecord)>, RelayError> {
        let mut entries = self
            .records
            .lock()
            .await
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

/// Flat JSON file under the platform data directory. Loaded eagerly at
/// construction; every mutation rewrites the file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl JsonFileStore {
    pub fn open_default() -> Result<Self, RelayError> {
        Self::open(default_store_path())
    }

    pub fn open(path: PathBuf) -> Result<Self, RelayError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| RelayError::StoreError {
                message: format!("failed to create store directory: {err}"),
            })?;
        }
        let records = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|err| RelayError::StoreError {
                message: format!("failed to read {}: {err}", path.display()),
            })?;
            serde_json::from_str(&content).map_err(|err| RelayError::StoreError {
                message: format!("corrupt store file {}: {err}", path.display()),
            })?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn persist(&self, records: &HashMap<String, SessionRecord>) -> Result<(), RelayError> {
        let content =
            serde_json::to_string_pretty(records).map_err(|err| RelayError::StoreError {
                message: format!("failed to serialize store: {err}"),
            })?;
        fs::write(&self.path, content).map_err(|err| RelayError::StoreError {
            message: format!("failed to write {}: {err}", self.path.display()),
        })
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn load(&self, thread_id: &str) -> Result<Option<SessionRecord>, RelayError> {
        Ok(self.records.lock().await.get(thread_id).cloned())
    }

    async fn save(&self, thread_id: &str, record: &SessionRecord) -> Result<(), RelayError> {
        let mut records = self.records.lock().await;
        records.insert(thread_id.to_string(), record.clone());
        self.persist(&records)
    }

    async fn remove(&self, thread_id: &str) -> Result<(), RelayError> {
        let mut records = self.records.lock().await;
        if records.remove(thread_id).is_some() {
            self.persist(&records)?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(String, SessionRecord)>, RelayError> {
        let mut entries = self
            .records
            .lock()
            .await
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agent-relay")
        .join("sessions.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_store_round_trips_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let store = JsonFileStore::open(path.clone()).unwrap();
        let record = SessionRecord {
            remote_session_id: Some("sess_1".to_string()),
            working_dir: Some(PathBuf::from("/work")),
            accumulated_cost_usd: 1.25,
        };
        store.save("thread-1", &record).await.unwrap();
        drop(store);

        let reopened = JsonFileStore::open(path).unwrap();
        let loaded = reopened.load("thread-1").await.unwrap().unwrap();
        assert_eq!(loaded.remote_session_id.as_deref(), Some("sess_1"));
        assert_eq!(loaded.accumulated_cost_usd, 1.25);

        reopened.remove("thread-1").await.unwrap();
        assert!(reopened.load("thread-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_lists_sorted() {
        let store = MemoryStore::new();
        store
            .save("b", &SessionRecord::default())
            .await
            .unwrap();
        store
            .save("a", &SessionRecord::default())
            .await
            .unwrap();
        let entries = store.list().await.unwrap();
        assert_eq!(entries[0].0, "a");
        assert_eq!(entries[1].0, "b");
    }
}
