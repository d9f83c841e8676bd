use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use thiserror::Error;
use veld_resource::ResourceId;

use crate::record::{StateFile, StateRecord, StoredValue, STATE_VERSION};
use crate::secret::{SecretCipher, SecretError};
use crate::Value;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("another run holds the state lock: {path}")]
    ConcurrentRun { path: PathBuf },

    #[error("failed to read state file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write state file {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state file {path} is not valid JSON")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported state file version {found} (expected {STATE_VERSION})")]
    Version { found: u32 },

    #[error(transparent)]
    Secret(#[from] SecretError),
}

/// Advisory exclusive lock beside the state file. Held for the run's
/// duration; released on drop.
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(state_path: &Path) -> Result<Self, StateError> {
        let path = state_path.with_extension("lock");
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(Self { path }),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(StateError::ConcurrentRun { path })
            }
            Err(source) => Err(StateError::Write { path, source }),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Decrypted, in-memory view of the state for diffing.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub records: IndexMap<ResourceId, SnapshotRecord>,
}

#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub provider_id: String,
    pub inputs: IndexMap<String, String>,
    /// Property name to (value, secret flag).
    pub outputs: IndexMap<String, (Value, bool)>,
    pub dependency_ids: BTreeSet<ResourceId>,
    /// Superseded instance still awaiting deletion.
    pub pending_delete: Option<String>,
}

impl StateSnapshot {
    pub fn record(&self, id: &ResourceId) -> Option<&SnapshotRecord> {
        self.records.get(id)
    }

    pub fn output(&self, id: &ResourceId, property: &str) -> Option<&(Value, bool)> {
        self.records.get(id)?.outputs.get(property)
    }
}

/// The durable state store: a JSON file plus an advisory lock.
///
/// Every mutation writes through to disk (temp file + rename), so a
/// partially applied run leaves the store describing exactly the
/// subset that completed.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    cipher: SecretCipher,
    file: StateFile,
    _lock: LockFile,
}

impl StateStore {
    /// Open the store, taking the run lock. Fails with
    /// [`StateError::ConcurrentRun`] if another run holds it.
    pub async fn open(path: impl Into<PathBuf>, cipher: SecretCipher) -> Result<Self, StateError> {
        let path = path.into();
        let lock = LockFile::acquire(&path)?;

        let file = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: StateFile =
                    serde_json::from_slice(&bytes).map_err(|source| StateError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                if file.version != STATE_VERSION {
                    return Err(StateError::Version { found: file.version });
                }
                file
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => StateFile::default(),
            Err(source) => {
                return Err(StateError::Read {
                    path: path.clone(),
                    source,
                });
            }
        };

        Ok(Self {
            path,
            cipher,
            file,
            _lock: lock,
        })
    }

    pub fn record(&self, id: &ResourceId) -> Option<&StateRecord> {
        self.file.resources.get(id)
    }

    /// Decrypt all records for the diff engine.
    pub fn snapshot(&self) -> Result<StateSnapshot, StateError> {
        let mut records = IndexMap::with_capacity(self.file.resources.len());
        for (id, record) in &self.file.resources {
            let mut outputs = IndexMap::with_capacity(record.outputs.len());
            for (property, stored) in &record.outputs {
                let entry = match stored {
                    StoredValue::Plain(value) => (value.clone(), false),
                    StoredValue::Secret(secret) => (self.cipher.decrypt(secret)?, true),
                };
                outputs.insert(property.clone(), entry);
            }
            records.insert(
                id.clone(),
                SnapshotRecord {
                    provider_id: record.provider_id.clone(),
                    inputs: record.inputs.clone(),
                    outputs,
                    dependency_ids: record.dependency_ids.clone(),
                    pending_delete: record.pending_delete.clone(),
                },
            );
        }
        Ok(StateSnapshot { records })
    }

    /// Record a successful apply, encrypting secret outputs, and
    /// persist. `pending_delete` carries a superseded instance the
    /// run still has to (or failed to) delete.
    pub async fn record_applied(
        &mut self,
        id: &ResourceId,
        provider_id: String,
        inputs: IndexMap<String, String>,
        outputs: IndexMap<String, (Value, bool)>,
        dependency_ids: BTreeSet<ResourceId>,
        pending_delete: Option<String>,
    ) -> Result<(), StateError> {
        let mut stored = IndexMap::with_capacity(outputs.len());
        for (property, (value, secret)) in outputs {
            let entry = if secret {
                StoredValue::Secret(self.cipher.encrypt(&value)?)
            } else {
                StoredValue::Plain(value)
            };
            stored.insert(property, entry);
        }

        self.file.resources.insert(
            id.clone(),
            StateRecord {
                provider_id,
                inputs,
                outputs: stored,
                dependency_ids,
                pending_delete,
            },
        );
        self.save().await
    }

    /// Drop a record's pending delete after the superseded instance is
    /// finally gone, and persist.
    pub async fn clear_pending_delete(&mut self, id: &ResourceId) -> Result<(), StateError> {
        if let Some(record) = self.file.resources.get_mut(id) {
            if record.pending_delete.take().is_some() {
                self.save().await?;
            }
        }
        Ok(())
    }

    /// Remove a record after a successful delete, and persist.
    pub async fn remove(&mut self, id: &ResourceId) -> Result<(), StateError> {
        if self.file.resources.shift_remove(id).is_some() {
            self.save().await?;
        }
        Ok(())
    }

    async fn save(&self) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(&self.file).map_err(|source| StateError::Parse {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| StateError::Write {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| StateError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn cipher() -> SecretCipher {
        SecretCipher::from_passphrase("test passphrase")
    }

    fn rid(name: &str) -> ResourceId {
        ResourceId::new("test:thing", name)
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veld.state.json");

        {
            let mut store = StateStore::open(&path, cipher()).await.unwrap();
            store
                .record_applied(
                    &rid("rg"),
                    "mem-1".to_string(),
                    IndexMap::from([("location".to_string(), "digest".to_string())]),
                    IndexMap::from([
                        ("name".to_string(), (json!("app-rg"), false)),
                        ("password".to_string(), (json!("hunter2"), true)),
                    ]),
                    BTreeSet::new(),
                    None,
                )
                .await
                .unwrap();
        }

        let store = StateStore::open(&path, cipher()).await.unwrap();
        let snapshot = store.snapshot().unwrap();
        assert_eq!(
            snapshot.output(&rid("rg"), "name"),
            Some(&(json!("app-rg"), false))
        );
        assert_eq!(
            snapshot.output(&rid("rg"), "password"),
            Some(&(json!("hunter2"), true))
        );
    }

    #[tokio::test]
    async fn secrets_never_hit_disk_in_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veld.state.json");

        let mut store = StateStore::open(&path, cipher()).await.unwrap();
        store
            .record_applied(
                &rid("sql"),
                "mem-1".to_string(),
                IndexMap::new(),
                IndexMap::from([("password".to_string(), (json!("hunter2"), true))]),
                BTreeSet::new(),
                None,
            )
            .await
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("hunter2"));
    }

    #[tokio::test]
    async fn second_concurrent_open_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veld.state.json");

        let first = StateStore::open(&path, cipher()).await.unwrap();
        let second = StateStore::open(&path, cipher()).await;
        assert!(matches!(second, Err(StateError::ConcurrentRun { .. })));

        drop(first);
        assert!(StateStore::open(&path, cipher()).await.is_ok());
    }

    #[tokio::test]
    async fn pending_delete_survives_reopen_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veld.state.json");

        {
            let mut store = StateStore::open(&path, cipher()).await.unwrap();
            store
                .record_applied(
                    &rid("rg"),
                    "mem-2".to_string(),
                    IndexMap::new(),
                    IndexMap::new(),
                    BTreeSet::new(),
                    Some("mem-1".to_string()),
                )
                .await
                .unwrap();
        }

        let mut store = StateStore::open(&path, cipher()).await.unwrap();
        let snapshot = store.snapshot().unwrap();
        assert_eq!(
            snapshot.record(&rid("rg")).unwrap().pending_delete,
            Some("mem-1".to_string())
        );

        store.clear_pending_delete(&rid("rg")).await.unwrap();
        assert_eq!(store.record(&rid("rg")).unwrap().pending_delete, None);
    }

    #[tokio::test]
    async fn remove_deletes_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veld.state.json");

        let mut store = StateStore::open(&path, cipher()).await.unwrap();
        store
            .record_applied(
                &rid("rg"),
                "mem-1".to_string(),
                IndexMap::new(),
                IndexMap::new(),
                BTreeSet::new(),
                None,
            )
            .await
            .unwrap();
        store.remove(&rid("rg")).await.unwrap();
        assert!(store.record(&rid("rg")).is_none());
    }
}
