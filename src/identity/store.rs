//! Snapshot persistence for verified identities.
//!
//! The snapshot is a JSON list of verified records, read at startup and
//! rewritten after every successful admission cycle. A persisted list is
//! untrusted input: the rotation policy re-confirms liveness of every entry
//! before re-admission, so loading here performs no validation of its own.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Credentials, IdentityRecord, ProtocolKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Wire shape of one persisted record.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    address: String,
    port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(rename = "protocolKind")]
    protocol_kind: ProtocolKind,
}

impl From<&IdentityRecord> for StoredRecord {
    fn from(record: &IdentityRecord) -> Self {
        Self {
            address: record.address.clone(),
            port: record.port,
            username: record.credentials.as_ref().map(|c| c.username.clone()),
            password: record.credentials.as_ref().map(|c| c.password.clone()),
            protocol_kind: record.protocol.unwrap_or(ProtocolKind::Http),
        }
    }
}

impl StoredRecord {
    fn into_record(self) -> IdentityRecord {
        let credentials = match (self.username, self.password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        };
        IdentityRecord::candidate(self.address, self.port, credentials)
            .into_verified(self.protocol_kind)
    }
}

/// File-backed snapshot of the verified-record list.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted list. Missing or corrupt snapshots degrade to an
    /// empty list; a bad snapshot must never stop the process.
    pub async fn load(&self) -> Vec<IdentityRecord> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                log::warn!("snapshot read failed ({}): {err}", self.path.display());
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<StoredRecord>>(&raw) {
            Ok(stored) => {
                log::info!("loaded {} persisted identities", stored.len());
                stored.into_iter().map(StoredRecord::into_record).collect()
            }
            Err(err) => {
                log::warn!("snapshot parse failed ({}): {err}", self.path.display());
                Vec::new()
            }
        }
    }

    /// Rewrite the snapshot with the current verified list.
    pub async fn save(&self, records: &[IdentityRecord]) -> Result<(), StoreError> {
        let stored: Vec<StoredRecord> = records.iter().map(StoredRecord::from).collect();
        let raw = serde_json::to_string_pretty(&stored)?;
        tokio::fs::write(&self.path, raw).await?;
        log::debug!("persisted {} identities to {}", stored.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ProtocolKind;

    #[tokio::test]
    async fn persists_and_reloads_verified_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("identities.json"));

        let record = IdentityRecord::candidate(
            "1.2.3.4",
            8080,
            Some(Credentials {
                username: "u".into(),
                password: "p".into(),
            }),
        )
        .into_verified(ProtocolKind::Socks5);

        store.save(std::slice::from_ref(&record)).await.unwrap();
        let loaded = store.load().await;
        assert_eq!(loaded, vec![record]);
    }

    #[tokio::test]
    async fn snapshot_uses_stable_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.json");
        let store = SnapshotStore::new(&path);
        let record =
            IdentityRecord::candidate("1.2.3.4", 8080, None).into_verified(ProtocolKind::Http);
        store.save(&[record]).await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(raw.contains("\"protocolKind\": \"http\""));
        assert!(raw.contains("\"address\": \"1.2.3.4\""));
    }

    #[tokio::test]
    async fn missing_or_corrupt_snapshot_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("missing.json"));
        assert!(store.load().await.is_empty());

        let path = dir.path().join("corrupt.json");
        tokio::fs::write(&path, "not json at all").await.unwrap();
        let store = SnapshotStore::new(path);
        assert!(store.load().await.is_empty());
    }
}
