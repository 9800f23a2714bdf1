//! Multi-writer Postgres backend.
//!
//! One row per `(image_id, voter_id)` cell in `image_votes`. A trigger issues
//! `pg_notify('image_votes', image_id)` on every change; a single listener task
//! re-reads the affected image and pushes the snapshot to every watcher of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use shared::models::{ImageId, Vote, VoteMap};

use crate::store::{SnapshotSink, StoreError, VoteStore, WatchHandle};

pub const NOTIFY_CHANNEL: &str = "image_votes";
const LISTENER_RETRY: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Watchers {
    next_id: u64,
    by_image: HashMap<ImageId, HashMap<u64, SnapshotSink>>,
    listener: Option<JoinHandle<()>>,
}

impl Watchers {
    fn sinks_for(&self, image_id: &str) -> Vec<SnapshotSink> {
        self.by_image.get(image_id)
            .map(|sinks| sinks.values().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct RemoteStore {
    pool: PgPool,
    watchers: Arc<Mutex<Watchers>>,
}

impl RemoteStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, watchers: Arc::new(Mutex::new(Watchers::default())) }
    }

    fn ensure_listener(&self, watchers: &mut Watchers) {
        if watchers.listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available; push notifications disabled");
            return;
        };
        info!("📡 Starting vote change listener on channel {}", NOTIFY_CHANNEL);
        watchers.listener = Some(runtime.spawn(run_listener(self.pool.clone(), Arc::downgrade(&self.watchers))));
    }
}

async fn read_cells(pool: &PgPool, image_id: &str) -> Result<VoteMap, StoreError> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT voter_id, vote FROM image_votes WHERE image_id = $1"
    )
    .bind(image_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StoreError::Unavailable(e.to_string()))?;

    Ok(rows.into_iter()
        .filter_map(|(voter, raw)| match raw.parse::<Vote>() {
            Ok(vote) => Some((voter, vote)),
            Err(_) => {
                warn!("Skipping malformed vote {:?} by {} on {}", raw, voter, image_id);
                None
            }
        })
        .collect())
}

async fn run_listener(pool: PgPool, watchers: Weak<Mutex<Watchers>>) {
    let mut listener = loop {
        match connect_listener(&pool).await {
            Ok(listener) => break listener,
            Err(e) => {
                error!("Vote change listener failed to connect: {}", e);
                if watchers.strong_count() == 0 {
                    return;
                }
                tokio::time::sleep(LISTENER_RETRY).await;
            }
        }
    };

    loop {
        let notification = match listener.recv().await {
            Ok(notification) => notification,
            Err(e) => {
                warn!("Vote change listener interrupted: {}", e);
                tokio::time::sleep(LISTENER_RETRY).await;
                continue;
            }
        };
        let image_id = notification.payload().to_string();

        let sinks = {
            let Some(watchers) = watchers.upgrade() else { break };
            let Ok(watchers) = watchers.lock() else { break };
            watchers.sinks_for(&image_id)
        };
        if sinks.is_empty() {
            continue;
        }

        match read_cells(&pool, &image_id).await {
            Ok(votes) => {
                debug!("Pushing snapshot of {} to {} watcher(s)", image_id, sinks.len());
                for sink in sinks {
                    sink(&image_id, votes.clone());
                }
            }
            Err(e) => warn!("Failed to refresh {} after notification: {}", image_id, e),
        }
    }
}

async fn connect_listener(pool: &PgPool) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(NOTIFY_CHANNEL).await?;
    Ok(listener)
}

#[async_trait]
impl VoteStore for RemoteStore {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn read_all(&self, image_id: &str) -> Result<VoteMap, StoreError> {
        read_cells(&self.pool, image_id).await
    }

    async fn write_one(&self, image_id: &str, voter: &str, vote: Vote) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO image_votes (image_id, voter_id, vote, updated_at)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (image_id, voter_id)
             DO UPDATE SET vote = EXCLUDED.vote, updated_at = NOW()"
        )
        .bind(image_id)
        .bind(voter)
        .bind(vote.as_str())
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn delete_one(&self, image_id: &str, voter: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM image_votes WHERE image_id = $1 AND voter_id = $2")
            .bind(image_id)
            .bind(voter)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn watch(&self, image_id: &str, sink: SnapshotSink) -> WatchHandle {
        let Ok(mut watchers) = self.watchers.lock() else {
            error!("Watcher registry lock poisoned; {} will not receive pushes", image_id);
            return WatchHandle::noop();
        };
        let id = watchers.next_id;
        watchers.next_id += 1;
        watchers.by_image.entry(image_id.to_string()).or_default().insert(id, sink);
        self.ensure_listener(&mut watchers);
        drop(watchers);

        let registry = Arc::downgrade(&self.watchers);
        let image_id = image_id.to_string();
        WatchHandle::new(move || {
            let Some(registry) = registry.upgrade() else { return };
            let Ok(mut watchers) = registry.lock() else { return };
            if let Some(sinks) = watchers.by_image.get_mut(&image_id) {
                sinks.remove(&id);
                if sinks.is_empty() {
                    watchers.by_image.remove(&image_id);
                }
            }
            if watchers.by_image.is_empty() {
                if let Some(task) = watchers.listener.take() {
                    debug!("Last watcher gone; stopping vote change listener");
                    task.abort();
                }
            }
        })
    }
}
