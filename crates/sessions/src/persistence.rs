use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use relay_backends::BackendKind;
use relay_domain::trace::TraceEvent;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

const DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(500);

/// The durable, on-disk form of a session binding, keyed by `conversationId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub session_id: String,
    pub backend_kind: BackendKind,
    #[serde(default)]
    pub model: Option<String>,
    pub cwd: PathBuf,
    pub updated_at: DateTime<Utc>,
}

struct Inner {
    path: PathBuf,
    map: RwLock<HashMap<String, PersistedEntry>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Debounced, crash-tolerant persistence of `conversationId -> PersistedEntry`.
///
/// Cheap to clone: wraps an `Arc`, so the registry and the periodic sweeper
/// can share one store.
#[derive(Clone)]
pub struct PersistenceStore {
    inner: Arc<Inner>,
}

impl PersistenceStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner {
                path,
                map: RwLock::new(HashMap::new()),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Best-effort read of the JSON file at startup. Survives a missing
    /// file (starts empty) and survives corrupt JSON (logs a warning,
    /// starts empty). Entries missing a session id or an unrecognized
    /// backend kind are dropped.
    pub async fn load_from_disk(&self) {
        let raw = match tokio::fs::read_to_string(&self.inner.path).await {
            Ok(raw) => raw,
            Err(_) => return,
        };

        let parsed: HashMap<String, PersistedEntry> = match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(error = %e, path = %self.inner.path.display(), "corrupt session persistence file, starting empty");
                return;
            }
        };

        let valid = parsed
            .into_iter()
            .filter(|(_, entry)| !entry.session_id.is_empty())
            .collect();

        *self.inner.map.write() = valid;
    }

    pub fn get(&self, conv_id: &str) -> Option<PersistedEntry> {
        self.inner.map.read().get(conv_id).cloned()
    }

    /// Overwrite the in-memory entry and arm the debounce timer if it
    /// isn't already armed.
    pub fn persist(
        &self,
        conv_id: impl Into<String>,
        session_id: impl Into<String>,
        backend_kind: BackendKind,
        model: Option<String>,
        cwd: PathBuf,
    ) {
        let entry = PersistedEntry {
            session_id: session_id.into(),
            backend_kind,
            model,
            cwd,
            updated_at: Utc::now(),
        };
        self.inner.map.write().insert(conv_id.into(), entry);
        self.arm_timer();
    }

    /// Delete the entry for `conv_id`. Arms the debounce timer only if an
    /// entry was actually removed.
    pub fn clear(&self, conv_id: &str) {
        let removed = self.inner.map.write().remove(conv_id).is_some();
        if removed {
            self.arm_timer();
        }
    }

    /// Cancel any pending debounce timer and write synchronously.
    pub async fn flush(&self) {
        if let Some(handle) = self.inner.timer.lock().take() {
            handle.abort();
        }
        self.write_to_disk().await;
    }

    fn arm_timer(&self) {
        let mut timer = self.inner.timer.lock();
        if timer.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            let store = PersistenceStore { inner: inner.clone() };
            store.write_to_disk().await;
            *inner.timer.lock() = None;
        }));
    }

    async fn write_to_disk(&self) {
        let snapshot = self.inner.map.read().clone();
        if let Some(parent) = self.inner.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::error!(error = %e, "failed to create session persistence directory");
                return;
            }
        }
        let mut json = match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize session persistence file");
                return;
            }
        };
        json.push('\n');
        if let Err(e) = tokio::fs::write(&self.inner.path, json).await {
            tracing::error!(error = %e, path = %self.inner.path.display(), "failed to write session persistence file");
            return;
        }
        TraceEvent::PersistenceFlushed {
            entries: snapshot.len(),
        }
        .emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> (BackendKind, Option<String>, PathBuf) {
        (BackendKind::Persistent, None, PathBuf::from("/tmp"))
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("bridge-sessions.json"));
        store.load_from_disk().await;
        assert!(store.get("any").is_none());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge-sessions.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let store = PersistenceStore::new(path);
        store.load_from_disk().await;
        assert!(store.get("any").is_none());
    }

    #[tokio::test]
    async fn persist_then_flush_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge-sessions.json");
        let store = PersistenceStore::new(path.clone());
        let (kind, model, cwd) = entry();
        store.persist("conv-a", "S1", kind, model, cwd);
        store.flush().await;

        let store2 = PersistenceStore::new(path);
        store2.load_from_disk().await;
        let loaded = store2.get("conv-a").expect("entry present");
        assert_eq!(loaded.session_id, "S1");
    }

    #[tokio::test]
    async fn clear_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("bridge-sessions.json"));
        let (kind, model, cwd) = entry();
        store.persist("conv-a", "S1", kind, model, cwd);
        store.clear("conv-a");
        assert!(store.get("conv-a").is_none());
    }

    #[tokio::test]
    async fn persist_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge-sessions.json");
        let store = PersistenceStore::new(path);
        let (kind, model, cwd) = entry();
        store.persist("conv-a", "S1", kind.clone(), model.clone(), cwd.clone());
        store.flush().await;
        store.persist("conv-a", "S1", kind, model, cwd);
        store.flush().await;
        assert_eq!(store.get("conv-a").unwrap().session_id, "S1");
    }

    #[tokio::test]
    async fn entries_with_empty_session_id_are_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge-sessions.json");
        let raw = serde_json::json!({
            "conv-a": {
                "session_id": "",
                "backend_kind": "persistent",
                "model": null,
                "cwd": "/tmp",
                "updated_at": Utc::now().to_rfc3339(),
            }
        });
        tokio::fs::write(&path, serde_json::to_vec(&raw).unwrap())
            .await
            .unwrap();
        let store = PersistenceStore::new(path);
        store.load_from_disk().await;
        assert!(store.get("conv-a").is_none());
    }
}
