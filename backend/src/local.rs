//! Single-writer key-value fallback.
//!
//! The whole `ImageId -> VoteMap` structure lives as one serialized record under
//! [`STORAGE_KEY`] and is read and written wholesale on every operation. Other
//! keys in the same document are left untouched.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use shared::models::{ImageId, Vote, VoteMap};

use crate::store::{StoreError, VoteStore};

pub const STORAGE_KEY: &str = "image_ratings";

pub type RatingsRecord = HashMap<ImageId, VoteMap>;

enum Backing {
    File(PathBuf),
    Memory(std::sync::Mutex<Option<String>>),
}

pub struct LocalStore {
    backing: Backing,
    write_lock: Mutex<()>,
}

impl LocalStore {
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self { backing: Backing::File(path.as_ref().to_path_buf()), write_lock: Mutex::new(()) }
    }

    pub fn in_memory() -> Self {
        Self { backing: Backing::Memory(std::sync::Mutex::new(None)), write_lock: Mutex::new(()) }
    }

    /// Backing file, or `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File(path) => Some(path),
            Backing::Memory(_) => None,
        }
    }

    async fn read_document(&self) -> Result<BTreeMap<String, Value>, StoreError> {
        let raw = match &self.backing {
            Backing::File(path) => match tokio::fs::read_to_string(path).await {
                Ok(raw) => Some(raw),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(StoreError::Unavailable(format!("{}: {}", path.display(), e))),
            },
            Backing::Memory(slot) => read_slot(slot)?,
        };

        match raw {
            Some(raw) if !raw.trim().is_empty() => {
                serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(e.to_string()))
            }
            _ => Ok(BTreeMap::new()),
        }
    }

    async fn write_document(&self, document: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        let raw = serde_json::to_string(document).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        match &self.backing {
            Backing::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await
                        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                }
                let staging = path.with_extension("tmp");
                tokio::fs::write(&staging, raw).await
                    .map_err(|e| StoreError::Unavailable(format!("{}: {}", staging.display(), e)))?;
                tokio::fs::rename(&staging, path).await
                    .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))
            }
            Backing::Memory(slot) => write_slot(slot, raw),
        }
    }

    /// The full ratings record as currently persisted.
    pub async fn load_record(&self) -> Result<RatingsRecord, StoreError> {
        let mut document = self.read_document().await?;
        match document.remove(STORAGE_KEY) {
            Some(value) => serde_json::from_value(value).map_err(|e| StoreError::Corrupt(e.to_string())),
            None => Ok(RatingsRecord::new()),
        }
    }

    async fn update_record<F>(&self, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut RatingsRecord),
    {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        let mut record: RatingsRecord = match document.remove(STORAGE_KEY) {
            Some(value) => serde_json::from_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            None => RatingsRecord::new(),
        };
        update(&mut record);
        let value = serde_json::to_value(&record).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        document.insert(STORAGE_KEY.to_string(), value);
        self.write_document(&document).await
    }
}

fn read_slot(slot: &std::sync::Mutex<Option<String>>) -> Result<Option<String>, StoreError> {
    slot.lock()
        .map(|raw| raw.clone())
        .map_err(|_| StoreError::Unavailable("local record lock poisoned".into()))
}

fn write_slot(slot: &std::sync::Mutex<Option<String>>, raw: String) -> Result<(), StoreError> {
    let mut slot = slot.lock()
        .map_err(|_| StoreError::Unavailable("local record lock poisoned".into()))?;
    *slot = Some(raw);
    Ok(())
}

#[async_trait]
impl VoteStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn read_all(&self, image_id: &str) -> Result<VoteMap, StoreError> {
        Ok(self.load_record().await?.remove(image_id).unwrap_or_default())
    }

    async fn write_one(&self, image_id: &str, voter: &str, vote: Vote) -> Result<(), StoreError> {
        debug!("Local write {} -> {} = {}", image_id, voter, vote);
        self.update_record(|record| {
            record.entry(image_id.to_string()).or_default().insert(voter, vote);
        }).await
    }

    async fn delete_one(&self, image_id: &str, voter: &str) -> Result<(), StoreError> {
        debug!("Local delete {} -> {}", image_id, voter);
        self.update_record(|record| {
            if let Some(votes) = record.get_mut(image_id) {
                votes.remove(voter);
            }
        }).await
    }
}
