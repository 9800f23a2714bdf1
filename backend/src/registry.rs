use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use shared::models::{ImageId, VoteMap};

use crate::store::WatchHandle;

pub type Callback = Arc<dyn Fn(&VoteMap) + Send + Sync>;

#[derive(Default)]
struct ImageSubscribers {
    callbacks: BTreeMap<u64, Callback>,
    watch: Option<WatchHandle>,
}

/// Per-image observer lists. Owns no vote data; an image's entry disappears
/// together with its last callback.
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: u64,
    images: HashMap<ImageId, ImageSubscribers>,
}

impl SubscriptionRegistry {
    /// Returns the subscription id and whether it is the first for the image.
    pub fn add(&mut self, image_id: &str, callback: Callback) -> (u64, bool) {
        let id = self.next_id;
        self.next_id += 1;
        let subscribers = self.images.entry(image_id.to_string()).or_default();
        let first = subscribers.callbacks.is_empty();
        subscribers.callbacks.insert(id, callback);
        (id, first)
    }

    /// Attaches the store feed for an image. Handed back if nobody is left to
    /// own it, so the caller can release it.
    pub fn attach_watch(&mut self, image_id: &str, watch: WatchHandle) -> Option<WatchHandle> {
        match self.images.get_mut(image_id) {
            Some(subscribers) if subscribers.watch.is_none() => {
                subscribers.watch = Some(watch);
                None
            }
            _ => Some(watch),
        }
    }

    /// Removes one callback. When it was the image's last one, the store
    /// feed is returned for the caller to drop outside any lock.
    pub fn remove(&mut self, image_id: &str, id: u64) -> Option<WatchHandle> {
        let subscribers = self.images.get_mut(image_id)?;
        subscribers.callbacks.remove(&id);
        if subscribers.callbacks.is_empty() {
            return self.images.remove(image_id).and_then(|s| s.watch);
        }
        None
    }

    /// Callbacks in registration order.
    pub fn callbacks(&self, image_id: &str) -> Vec<Callback> {
        self.images.get(image_id)
            .map(|s| s.callbacks.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, image_id: &str) -> usize {
        self.images.get(image_id).map_or(0, |s| s.callbacks.len())
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Empties the registry, handing back every live store feed.
    pub fn drain(&mut self) -> Vec<WatchHandle> {
        self.images.drain().filter_map(|(_, s)| s.watch).collect()
    }
}
