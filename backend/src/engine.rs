//! Rating cache and sync engine.
//!
//! Holds the in-memory `ImageId -> VoteMap` mirror, applies toggle-aware votes
//! optimistically, persists them in the background with a local fallback, and
//! fans changes out to subscribers.
//!
//! Every optimistic write is recorded as a *pending cell* tagged with a
//! per-image version. Snapshots coming back from a store (hydration reads and
//! pushed updates) are laid under the pending cells, so a stale snapshot can
//! never bring back a value the user already replaced. A pending cell is
//! dropped once the primary store acknowledged it and a snapshot confirms it.
//!
//! Delivery to subscribers is serialized per image. Each cache change bumps the
//! entry's revision; one caller at a time drains deliveries until the delivered
//! revision catches up, so the last map a subscriber sees is always the cached one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Serialize, Deserialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use shared::models::{CellChange, ImageId, RatingChange, Vote, VoteMap};
use shared::user_info::SessionIdentity;
use shared::validation::{parse_vote, require_image_id};

use crate::registry::{Callback, SubscriptionRegistry};
use crate::store::{SnapshotSink, VoteStore};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Where a vote finally landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persisted {
    Primary,
    Fallback,
    /// Neither store accepted the write; only the session cache holds it.
    Lost,
}

type SharedFetch = Shared<BoxFuture<'static, VoteMap>>;

struct PendingCell {
    version: u64,
    change: CellChange,
    acked: bool,
}

#[derive(Default)]
struct CacheEntry {
    votes: VoteMap,
    /// False while the entry only holds optimistic writes.
    hydrated: bool,
    version: u64,
    pending: HashMap<String, PendingCell>,
    revision: u64,
    delivered: u64,
    notifying: bool,
}

impl CacheEntry {
    /// Records a change subscribers must hear about. True when the caller has
    /// to run the delivery loop.
    fn mark_dirty(&mut self) -> bool {
        self.revision += 1;
        !std::mem::replace(&mut self.notifying, true)
    }
}

#[derive(Default)]
struct RatingsState {
    images: HashMap<ImageId, CacheEntry>,
}

enum Lookup {
    Cached(VoteMap),
    Fetching(SharedFetch),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    primary: Arc<dyn VoteStore>,
    fallback: Arc<dyn VoteStore>,
    identity: SessionIdentity,
    state: Mutex<RatingsState>,
    registry: Mutex<SubscriptionRegistry>,
    inflight: Mutex<HashMap<ImageId, SharedFetch>>,
    changes: broadcast::Sender<RatingChange>,
}

impl Inner {
    fn cached(&self, image_id: &str) -> Option<VoteMap> {
        lock(&self.state).images.get(image_id)
            .filter(|entry| entry.hydrated)
            .map(|entry| entry.votes.clone())
    }

    fn peek(&self, image_id: &str) -> Option<VoteMap> {
        lock(&self.state).images.get(image_id).map(|entry| entry.votes.clone())
    }

    fn lookup(self: &Arc<Self>, image_id: &str) -> Lookup {
        let mut inflight = lock(&self.inflight);
        if let Some(votes) = self.cached(image_id) {
            return Lookup::Cached(votes);
        }
        let fetch = inflight.entry(image_id.to_string())
            .or_insert_with(|| self.start_fetch(image_id))
            .clone();
        Lookup::Fetching(fetch)
    }

    fn start_fetch(self: &Arc<Self>, image_id: &str) -> SharedFetch {
        let inner = Arc::clone(self);
        let image_id = image_id.to_string();
        async move {
            let snapshot = inner.read_through(&image_id).await;
            let votes = inner.apply_snapshot(&image_id, snapshot, true);
            lock(&inner.inflight).remove(&image_id);
            votes
        }
        .boxed()
        .shared()
    }

    async fn votes(self: &Arc<Self>, image_id: &str) -> VoteMap {
        match self.lookup(image_id) {
            Lookup::Cached(votes) => votes,
            Lookup::Fetching(fetch) => fetch.await,
        }
    }

    /// Read failures count as "no votes yet".
    async fn read_through(&self, image_id: &str) -> VoteMap {
        match self.primary.read_all(image_id).await {
            Ok(votes) => votes,
            Err(e) => {
                warn!("Reading {} from {} store failed: {}", image_id, self.primary.name(), e);
                match self.fallback.read_all(image_id).await {
                    Ok(votes) => votes,
                    Err(e) => {
                        warn!("Reading {} from {} store failed: {}", image_id, self.fallback.name(), e);
                        VoteMap::new()
                    }
                }
            }
        }
    }

    /// Merges a store snapshot under the pending cells. Subscribers hear about
    /// it when the cache changed, or always when `force` is set.
    fn apply_snapshot(&self, image_id: &str, mut snapshot: VoteMap, force: bool) -> VoteMap {
        let (votes, changed, deliver) = {
            let mut state = lock(&self.state);
            let entry = state.images.entry(image_id.to_string()).or_default();
            entry.pending.retain(|voter, cell| {
                !(cell.acked && snapshot.get(voter) == cell.change.vote())
            });
            for (voter, cell) in &entry.pending {
                snapshot.apply(voter, cell.change);
            }
            let changed = entry.votes != snapshot;
            entry.votes = snapshot;
            entry.hydrated = true;
            let deliver = (changed || force) && entry.mark_dirty();
            (entry.votes.clone(), changed, deliver)
        };

        if deliver {
            self.fan_out(image_id);
        }
        if changed {
            self.broadcast(image_id);
        }
        votes
    }

    /// Delivers the latest cached map until no newer revision is waiting.
    /// Callbacks run without any lock held.
    fn fan_out(&self, image_id: &str) {
        loop {
            let votes = {
                let mut state = lock(&self.state);
                let Some(entry) = state.images.get_mut(image_id) else { return };
                if entry.delivered >= entry.revision {
                    entry.notifying = false;
                    return;
                }
                entry.delivered = entry.revision;
                entry.votes.clone()
            };
            let callbacks = lock(&self.registry).callbacks(image_id);
            for callback in callbacks {
                callback(&votes);
            }
        }
    }

    fn broadcast(&self, image_id: &str) {
        let _ = self.changes.send(RatingChange::now(image_id));
    }

    async fn persist(&self, image_id: String, voter: String, change: CellChange, version: u64) -> Persisted {
        let outcome = match self.primary.apply(&image_id, &voter, change).await {
            Ok(()) => Persisted::Primary,
            Err(e) => {
                warn!(
                    "Writing {}/{} to {} store failed, falling back to {}: {}",
                    image_id, voter, self.primary.name(), self.fallback.name(), e
                );
                match self.fallback.apply(&image_id, &voter, change).await {
                    Ok(()) => Persisted::Fallback,
                    Err(e) => {
                        error!("Vote {}/{} kept in session only: {}", image_id, voter, e);
                        Persisted::Lost
                    }
                }
            }
        };

        if outcome == Persisted::Primary {
            self.acknowledge(&image_id, &voter, version);
        }
        debug!("Persisted {}/{} v{} -> {:?}", image_id, voter, version, outcome);
        outcome
    }

    /// Superseded writes leave the newer pending cell alone.
    fn acknowledge(&self, image_id: &str, voter: &str, version: u64) {
        let mut state = lock(&self.state);
        if let Some(cell) = state.images.get_mut(image_id).and_then(|e| e.pending.get_mut(voter)) {
            if cell.version == version {
                cell.acked = true;
            }
        }
    }

    fn unsubscribe(&self, image_id: &str, id: u64) {
        let watch = lock(&self.registry).remove(image_id, id);
        if watch.is_some() {
            debug!("Released store feed for {}", image_id);
        }
        drop(watch);
    }
}

/// Session-scoped rating cache. Cheap to clone; clones share one cache.
#[derive(Clone)]
pub struct RatingsEngine {
    inner: Arc<Inner>,
}

impl RatingsEngine {
    pub fn new(primary: Arc<dyn VoteStore>, fallback: Arc<dyn VoteStore>, identity: SessionIdentity) -> Self {
        Self::with_event_capacity(primary, fallback, identity, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(
        primary: Arc<dyn VoteStore>,
        fallback: Arc<dyn VoteStore>,
        identity: SessionIdentity,
        capacity: usize,
    ) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        debug!("Ratings engine on {} store with {} fallback", primary.name(), fallback.name());
        Self {
            inner: Arc::new(Inner {
                primary,
                fallback,
                identity,
                state: Mutex::new(RatingsState::default()),
                registry: Mutex::new(SubscriptionRegistry::default()),
                inflight: Mutex::new(HashMap::new()),
                changes,
            }),
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.inner.identity
    }

    /// Process-wide change feed carrying the affected image id.
    pub fn changes(&self) -> broadcast::Receiver<RatingChange> {
        self.inner.changes.subscribe()
    }

    /// Hydrated cache entries only; never touches a store.
    pub fn cached(&self, image_id: &str) -> Option<VoteMap> {
        self.inner.cached(image_id)
    }

    /// Concurrent calls for an uncached image share one store read.
    pub async fn get_votes(&self, image_id: &str) -> VoteMap {
        self.inner.votes(image_id).await
    }

    pub async fn get_many(&self, image_ids: &[ImageId]) -> HashMap<ImageId, VoteMap> {
        let reads = image_ids.iter().map(|id| async move { (id.clone(), self.get_votes(id).await) });
        futures::future::join_all(reads).await.into_iter().collect()
    }

    /// Toggle-aware vote. The cache and every subscriber see the result before
    /// this returns, unless another thread is already delivering for the image,
    /// in which case that thread hands it on. Persistence runs on its own task
    /// and cannot be cancelled.
    ///
    /// Returns `None` when the call was ignored (blank image id, or no async
    /// runtime to persist on).
    pub fn set_vote(&self, image_id: &str, voter: Option<&str>, vote: Vote) -> Option<JoinHandle<Persisted>> {
        let Ok(image_id) = require_image_id(image_id) else {
            debug!("Ignoring vote for blank image id");
            return None;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("Ignoring vote on {}: no async runtime to persist on", image_id);
            return None;
        };
        let voter = self.inner.identity.resolve(voter);

        let (change, version, hydrated, deliver) = {
            let mut state = lock(&self.inner.state);
            let entry = state.images.entry(image_id.to_string()).or_default();
            let change = entry.votes.toggle(&voter, vote);
            entry.version += 1;
            entry.pending.insert(voter.clone(), PendingCell { version: entry.version, change, acked: false });
            (change, entry.version, entry.hydrated, entry.mark_dirty())
        };
        debug!("{} on {}: {:?} (v{})", voter, image_id, change, version);

        if deliver {
            self.inner.fan_out(image_id);
        }
        self.inner.broadcast(image_id);

        let inner = Arc::clone(&self.inner);
        let target = image_id.to_string();
        let pending = runtime.spawn(async move { inner.persist(target, voter, change, version).await });

        // Other voters' cells still have to be loaded underneath this one.
        if !hydrated {
            if let Lookup::Fetching(fetch) = self.inner.lookup(image_id) {
                runtime.spawn(fetch);
            }
        }
        Some(pending)
    }

    /// Raw-input entry point; anything that is not a vote is dropped silently.
    pub fn cast(&self, image_id: &str, voter: Option<&str>, raw_vote: &str) -> Option<JoinHandle<Persisted>> {
        match parse_vote(raw_vote) {
            Ok(vote) => self.set_vote(image_id, voter, vote),
            Err(e) => {
                debug!("Ignoring malformed vote on {}: {}", image_id, e);
                None
            }
        }
    }

    /// Delivers the current map right away and every change after it. An
    /// uncached image is hydrated once and delivered again when that lands.
    pub fn subscribe<F>(&self, image_id: &str, callback: F) -> Subscription
    where
        F: Fn(&VoteMap) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let (id, first) = lock(&self.inner.registry).add(image_id, Arc::clone(&callback));

        if first {
            let engine: Weak<Inner> = Arc::downgrade(&self.inner);
            let sink: SnapshotSink = Arc::new(move |image_id: &str, snapshot: VoteMap| {
                if let Some(inner) = engine.upgrade() {
                    inner.apply_snapshot(image_id, snapshot, false);
                }
            });
            let watch = self.inner.primary.watch(image_id, sink);
            let orphan = lock(&self.inner.registry).attach_watch(image_id, watch);
            drop(orphan);
        }

        match self.inner.lookup(image_id) {
            Lookup::Cached(votes) => callback(&votes),
            Lookup::Fetching(fetch) => {
                callback(&self.inner.peek(image_id).unwrap_or_default());
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(fetch);
                    }
                    Err(_) => warn!("No async runtime; {} stays unhydrated", image_id),
                }
            }
        }

        Subscription {
            engine: Arc::downgrade(&self.inner),
            image_id: image_id.to_string(),
            id: Some(id),
        }
    }

    pub fn subscriber_count(&self, image_id: &str) -> usize {
        lock(&self.inner.registry).subscriber_count(image_id)
    }

    pub fn subscribed_images(&self) -> usize {
        lock(&self.inner.registry).image_count()
    }

    /// Ends the session: every callback and store feed is released.
    pub fn shutdown(&self) {
        let watches = lock(&self.inner.registry).drain();
        debug!("Engine shutdown released {} store feed(s)", watches.len());
        drop(watches);
    }
}

/// Registration handle returned by [`RatingsEngine::subscribe`]. Releasing it
/// twice is harmless; dropping it releases it.
pub struct Subscription {
    engine: Weak<Inner>,
    image_id: ImageId,
    id: Option<u64>,
}

impl Subscription {
    pub fn unsubscribe(&mut self) {
        let Some(id) = self.id.take() else { return };
        if let Some(inner) = self.engine.upgrade() {
            inner.unsubscribe(&self.image_id, id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
