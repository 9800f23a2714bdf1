use std::sync::Arc;
use async_trait::async_trait;
use thiserror::Error;
use shared::models::{CellChange, Vote, VoteMap};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Vote store unavailable: {0}")]
    Unavailable(String),
    #[error("Vote record is corrupt: {0}")]
    Corrupt(String),
}

/// Receives full map snapshots pushed by a store for a watched image.
pub type SnapshotSink = Arc<dyn Fn(&str, VoteMap) + Send + Sync>;

/// Live feed registration. Cancelling or dropping it tears the feed down.
pub struct WatchHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }

    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn is_live(&self) -> bool {
        self.cancel.is_some()
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").field("live", &self.is_live()).finish()
    }
}

/// Cell-addressed persistence of votes. Writers only ever touch their own
/// `(image, voter)` cell, so no call reads-modifies-writes a whole map.
#[async_trait]
pub trait VoteStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Unknown images yield an empty map.
    async fn read_all(&self, image_id: &str) -> Result<VoteMap, StoreError>;

    async fn write_one(&self, image_id: &str, voter: &str, vote: Vote) -> Result<(), StoreError>;

    /// Deleting a missing cell is not an error.
    async fn delete_one(&self, image_id: &str, voter: &str) -> Result<(), StoreError>;

    /// Stores without push notification hand back a no-op handle.
    fn watch(&self, _image_id: &str, _sink: SnapshotSink) -> WatchHandle {
        WatchHandle::noop()
    }

    async fn apply(&self, image_id: &str, voter: &str, change: CellChange) -> Result<(), StoreError> {
        match change {
            CellChange::Set(vote) => self.write_one(image_id, voter, vote).await,
            CellChange::Retracted => self.delete_one(image_id, voter).await,
        }
    }
}
