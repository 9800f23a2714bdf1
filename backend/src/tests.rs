#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use async_trait::async_trait;
    use tokio::sync::Semaphore;
    use shared::models::{Vote, VoteMap};
    use shared::user_info::SessionIdentity;

    use crate::config::{BackendKind, Settings};
    use crate::engine::{Persisted, RatingsEngine};
    use crate::local::{LocalStore, STORAGE_KEY};
    use crate::registry::SubscriptionRegistry;
    use crate::store::{SnapshotSink, StoreError, VoteStore, WatchHandle};

    /// In-memory stand-in for the remote store: push-capable, can be made to
    /// fail, and can hold writes until released.
    #[derive(Default)]
    struct MemoryStore {
        cells: Mutex<HashMap<String, VoteMap>>,
        sinks: Arc<Mutex<HashMap<u64, (String, SnapshotSink)>>>,
        next_sink: AtomicU64,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
        reads: AtomicUsize,
        writes: AtomicUsize,
        gate: Option<Arc<Semaphore>>,
    }

    impl MemoryStore {
        fn gated() -> (Self, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            (Self { gate: Some(gate.clone()), ..Self::default() }, gate)
        }

        fn seed(&self, image_id: &str, voter: &str, vote: Vote) {
            self.cells.lock().unwrap().entry(image_id.to_string()).or_default().insert(voter, vote);
        }

        fn stored(&self, image_id: &str) -> VoteMap {
            self.cells.lock().unwrap().get(image_id).cloned().unwrap_or_default()
        }

        fn watcher_count(&self) -> usize {
            self.sinks.lock().unwrap().len()
        }

        fn push_snapshot(&self, image_id: &str, votes: VoteMap) {
            let sinks: Vec<SnapshotSink> = self.sinks.lock().unwrap()
                .values()
                .filter(|(id, _)| id == image_id)
                .map(|(_, sink)| sink.clone())
                .collect();
            for sink in sinks {
                sink(image_id, votes.clone());
            }
        }

        fn push(&self, image_id: &str) {
            self.push_snapshot(image_id, self.stored(image_id));
        }

        async fn pass_gate(&self) {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
        }
    }

    #[async_trait]
    impl VoteStore for MemoryStore {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn read_all(&self, image_id: &str) -> Result<VoteMap, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("reads disabled".into()));
            }
            Ok(self.stored(image_id))
        }

        async fn write_one(&self, image_id: &str, voter: &str, vote: Vote) -> Result<(), StoreError> {
            self.pass_gate().await;
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("writes disabled".into()));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.seed(image_id, voter, vote);
            Ok(())
        }

        async fn delete_one(&self, image_id: &str, voter: &str) -> Result<(), StoreError> {
            self.pass_gate().await;
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("writes disabled".into()));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            if let Some(votes) = self.cells.lock().unwrap().get_mut(image_id) {
                votes.remove(voter);
            }
            Ok(())
        }

        fn watch(&self, image_id: &str, sink: SnapshotSink) -> WatchHandle {
            let id = self.next_sink.fetch_add(1, Ordering::SeqCst);
            self.sinks.lock().unwrap().insert(id, (image_id.to_string(), sink));
            let sinks = self.sinks.clone();
            WatchHandle::new(move || {
                sinks.lock().unwrap().remove(&id);
            })
        }
    }

    fn engine_with(primary: Arc<MemoryStore>) -> (RatingsEngine, Arc<LocalStore>) {
        let local = Arc::new(LocalStore::in_memory());
        let engine = RatingsEngine::new(primary, local.clone(), SessionIdentity::default());
        (engine, local)
    }

    fn recorder(engine: &RatingsEngine, image_id: &str) -> (crate::Subscription, Arc<Mutex<Vec<VoteMap>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = engine.subscribe(image_id, move |votes| sink.lock().unwrap().push(votes.clone()));
        (subscription, seen)
    }

    #[tokio::test]
    async fn test_toggle_cycles_with_period_two() {
        let store = Arc::new(MemoryStore::default());
        let (engine, _) = engine_with(store.clone());

        engine.set_vote("img", Some("alice"), Vote::Like).unwrap().await.unwrap();
        assert_eq!(engine.get_votes("img").await.get("alice"), Some(Vote::Like));

        engine.set_vote("img", Some("alice"), Vote::Like).unwrap().await.unwrap();
        assert_eq!(engine.get_votes("img").await.get("alice"), None);
        assert_eq!(store.stored("img").get("alice"), None);

        engine.set_vote("img", Some("alice"), Vote::Like).unwrap().await.unwrap();
        assert_eq!(engine.get_votes("img").await.get("alice"), Some(Vote::Like));
        assert_eq!(store.stored("img").get("alice"), Some(Vote::Like));
    }

    #[tokio::test]
    async fn test_voter_isolation() {
        let store = Arc::new(MemoryStore::default());
        store.seed("img", "bob", Vote::Dislike);
        let (engine, _) = engine_with(store.clone());
        engine.get_votes("img").await;

        engine.set_vote("img", Some("alice"), Vote::Like).unwrap().await.unwrap();
        engine.set_vote("img", Some("alice"), Vote::Unsure).unwrap().await.unwrap();

        let votes = engine.get_votes("img").await;
        assert_eq!(votes.get("bob"), Some(Vote::Dislike));
        assert_eq!(votes.get("alice"), Some(Vote::Unsure));
        assert_eq!(store.stored("img").get("bob"), Some(Vote::Dislike));
    }

    #[tokio::test]
    async fn test_optimistic_update_precedes_persistence() {
        let (store, gate) = MemoryStore::gated();
        let store = Arc::new(store);
        let (engine, _) = engine_with(store.clone());
        engine.get_votes("img").await;
        let (_subscription, seen) = recorder(&engine, "img");

        let pending = engine.set_vote("img", Some("alice"), Vote::Like).unwrap();

        let observed = seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!(observed.get("alice"), Some(Vote::Like));
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);

        gate.add_permits(1);
        assert_eq!(pending.await.unwrap(), Persisted::Primary);
        assert_eq!(store.stored("img").get("alice"), Some(Vote::Like));
    }

    #[tokio::test]
    async fn test_late_acknowledgment_does_not_renotify() {
        let (store, gate) = MemoryStore::gated();
        let store = Arc::new(store);
        let (engine, _) = engine_with(store.clone());
        engine.get_votes("img").await;
        let (_subscription, seen) = recorder(&engine, "img");

        let first = engine.set_vote("img", Some("alice"), Vote::Like).unwrap();
        let second = engine.set_vote("img", Some("alice"), Vote::Dislike).unwrap();
        let deliveries = seen.lock().unwrap().len();

        gate.add_permits(2);
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), deliveries);
        assert_eq!(engine.get_votes("img").await.get("alice"), Some(Vote::Dislike));
    }

    #[tokio::test]
    async fn test_stale_snapshot_cannot_resurrect_old_state() {
        let (store, gate) = MemoryStore::gated();
        let store = Arc::new(store);
        store.seed("img", "bob", Vote::Like);
        let (engine, _) = engine_with(store.clone());
        let (_subscription, _seen) = recorder(&engine, "img");
        engine.get_votes("img").await;

        let pending = engine.set_vote("img", Some("alice"), Vote::Dislike).unwrap();

        // Snapshot taken before the write reached the store.
        store.push("img");
        assert_eq!(engine.cached("img").unwrap().get("alice"), Some(Vote::Dislike));

        gate.add_permits(1);
        pending.await.unwrap();
        store.push("img");

        // Confirmed now, so later remote changes to the cell flow in again.
        store.seed("img", "alice", Vote::Unsure);
        store.seed("img", "carol", Vote::Like);
        store.push("img");
        let votes = engine.cached("img").unwrap();
        assert_eq!(votes.get("alice"), Some(Vote::Unsure));
        assert_eq!(votes.get("carol"), Some(Vote::Like));
    }

    #[tokio::test]
    async fn test_push_updates_reach_subscribers() {
        let store = Arc::new(MemoryStore::default());
        let (engine, _) = engine_with(store.clone());
        let (_subscription, seen) = recorder(&engine, "img");
        engine.get_votes("img").await;
        let before = seen.lock().unwrap().len();

        store.seed("img", "dana", Vote::Like);
        store.push("img");
        assert_eq!(seen.lock().unwrap().len(), before + 1);
        assert_eq!(seen.lock().unwrap().last().unwrap().get("dana"), Some(Vote::Like));

        // An unchanged snapshot is not re-delivered.
        store.push("img");
        assert_eq!(seen.lock().unwrap().len(), before + 1);
    }

    #[tokio::test]
    async fn test_fallback_durability() {
        let store = Arc::new(MemoryStore::default());
        store.fail_writes.store(true, Ordering::SeqCst);
        let (engine, local) = engine_with(store.clone());

        let outcome = engine.set_vote("img", Some("alice"), Vote::Like).unwrap().await.unwrap();
        assert_eq!(outcome, Persisted::Fallback);

        assert_eq!(engine.get_votes("img").await.get("alice"), Some(Vote::Like));
        let record = local.load_record().await.unwrap();
        assert_eq!(record["img"].get("alice"), Some(Vote::Like));
        assert_eq!(store.stored("img").get("alice"), None);
    }

    #[tokio::test]
    async fn test_fallback_value_survives_remote_snapshots() {
        let store = Arc::new(MemoryStore::default());
        let (engine, _) = engine_with(store.clone());
        let (_subscription, _seen) = recorder(&engine, "img");
        engine.get_votes("img").await;

        store.fail_writes.store(true, Ordering::SeqCst);
        engine.set_vote("img", Some("alice"), Vote::Like).unwrap().await.unwrap();

        store.seed("img", "bob", Vote::Unsure);
        store.push("img");
        let votes = engine.cached("img").unwrap();
        assert_eq!(votes.get("alice"), Some(Vote::Like));
        assert_eq!(votes.get("bob"), Some(Vote::Unsure));
    }

    #[tokio::test]
    async fn test_read_failure_reads_fallback_then_empty() {
        let store = Arc::new(MemoryStore::default());
        store.fail_reads.store(true, Ordering::SeqCst);
        store.seed("img", "alice", Vote::Like);
        let (engine, local) = engine_with(store.clone());
        local.write_one("img", "bob", Vote::Dislike).await.unwrap();

        let votes = engine.get_votes("img").await;
        assert_eq!(votes.get("bob"), Some(Vote::Dislike));
        assert_eq!(votes.get("alice"), None);
        assert!(engine.get_votes("other").await.is_empty());
    }

    #[tokio::test]
    async fn test_hydration_reads_once() {
        let store = Arc::new(MemoryStore::default());
        store.seed("img", "bob", Vote::Like);
        let (engine, _) = engine_with(store.clone());

        let (_first, seen) = recorder(&engine, "img");
        let (_second, _) = recorder(&engine, "img");
        let (a, b) = tokio::join!(engine.get_votes("img"), engine.get_votes("img"));
        assert_eq!(a, b);
        engine.get_votes("img").await;

        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        let seen = seen.lock().unwrap();
        assert!(seen[0].is_empty());
        assert_eq!(seen.last().unwrap().get("bob"), Some(Vote::Like));
    }

    #[tokio::test]
    async fn test_vote_on_unread_image_keeps_other_voters() {
        let store = Arc::new(MemoryStore::default());
        store.seed("img", "bob", Vote::Dislike);
        let (engine, _) = engine_with(store.clone());

        engine.set_vote("img", Some("alice"), Vote::Like).unwrap().await.unwrap();
        let votes = engine.get_votes("img").await;
        assert_eq!(votes.get("alice"), Some(Vote::Like));
        assert_eq!(votes.get("bob"), Some(Vote::Dislike));
    }

    #[tokio::test]
    async fn test_unsubscribe_is_leak_free_and_idempotent() {
        let store = Arc::new(MemoryStore::default());
        let (engine, _) = engine_with(store.clone());
        engine.get_votes("img").await;
        let (mut subscription, seen) = recorder(&engine, "img");
        assert_eq!(engine.subscriber_count("img"), 1);
        assert_eq!(store.watcher_count(), 1);

        subscription.unsubscribe();
        subscription.unsubscribe();
        let deliveries = seen.lock().unwrap().len();

        engine.set_vote("img", Some("alice"), Vote::Like).unwrap().await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), deliveries);
        assert_eq!(engine.subscriber_count("img"), 0);
        assert_eq!(engine.subscribed_images(), 0);
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_subscription_releases_it() {
        let store = Arc::new(MemoryStore::default());
        let (engine, _) = engine_with(store.clone());
        let (first, _) = recorder(&engine, "img");
        let (second, _) = recorder(&engine, "img");
        assert_eq!(store.watcher_count(), 1);

        drop(first);
        assert_eq!(engine.subscriber_count("img"), 1);
        assert_eq!(store.watcher_count(), 1);
        drop(second);
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let store = Arc::new(MemoryStore::default());
        let (engine, _) = engine_with(store.clone());
        let (mut a, _) = recorder(&engine, "one");
        let (_b, _) = recorder(&engine, "two");
        assert_eq!(store.watcher_count(), 2);

        engine.shutdown();
        assert_eq!(engine.subscribed_images(), 0);
        assert_eq!(store.watcher_count(), 0);
        a.unsubscribe();
    }

    #[tokio::test]
    async fn test_invalid_input_is_ignored() {
        let store = Arc::new(MemoryStore::default());
        let (engine, _) = engine_with(store.clone());
        let (_subscription, seen) = recorder(&engine, "img");
        engine.get_votes("img").await;
        let deliveries = seen.lock().unwrap().len();

        assert!(engine.cast("img", Some("alice"), "love").is_none());
        assert!(engine.set_vote("  ", Some("alice"), Vote::Like).is_none());
        assert_eq!(seen.lock().unwrap().len(), deliveries);

        assert!(engine.cast("img", Some("alice"), "Unsure").is_none());
        assert!(engine.cast("img", Some("alice"), " unsure").is_none());
        assert_eq!(seen.lock().unwrap().len(), deliveries);

        engine.cast("img", Some("alice"), "unsure").unwrap().await.unwrap();
        assert_eq!(engine.get_votes("img").await.get("alice"), Some(Vote::Unsure));
    }

    #[tokio::test]
    async fn test_long_voter_names_stay_isolated() {
        let store = Arc::new(MemoryStore::default());
        let (engine, _) = engine_with(store.clone());
        let long = "a".repeat(65);

        engine.set_vote("img", None, Vote::Like).unwrap().await.unwrap();
        engine.set_vote("img", Some(long.as_str()), Vote::Like).unwrap().await.unwrap();
        engine.set_vote("img", Some("  padded "), Vote::Dislike).unwrap().await.unwrap();

        let votes = engine.get_votes("img").await;
        assert_eq!(votes.get("guest"), Some(Vote::Like));
        assert_eq!(votes.get(&long), Some(Vote::Like));
        assert_eq!(votes.get("padded"), Some(Vote::Dislike));
        assert_eq!(store.stored("img").len(), 3);
    }

    #[tokio::test]
    async fn test_long_image_ids_are_accepted() {
        let store = Arc::new(MemoryStore::default());
        let (engine, _) = engine_with(store.clone());
        let image_id = "i".repeat(300);

        engine.set_vote(&image_id, Some("alice"), Vote::Like).unwrap().await.unwrap();
        assert_eq!(store.stored(&image_id).get("alice"), Some(Vote::Like));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_writers_leave_subscribers_current() {
        for _ in 0..50 {
            let store = Arc::new(MemoryStore::default());
            let (engine, _) = engine_with(store.clone());
            let (_subscription, seen) = recorder(&engine, "img");
            engine.get_votes("img").await;

            let writers: Vec<_> = (0..16)
                .map(|i| {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        let voter = format!("voter-{i}");
                        engine.set_vote("img", Some(voter.as_str()), Vote::Like)
                    })
                })
                .collect();
            let pushes: Vec<_> = (0..4)
                .map(|_| {
                    let store = store.clone();
                    tokio::spawn(async move { store.push("img") })
                })
                .collect();

            for writer in writers {
                writer.await.unwrap().unwrap().await.unwrap();
            }
            for push in pushes {
                push.await.unwrap();
            }

            let cached = engine.cached("img").unwrap();
            assert_eq!(cached.len(), 16);
            assert_eq!(seen.lock().unwrap().last(), Some(&cached));
        }
    }

    #[tokio::test]
    async fn test_local_mode_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let unwritable = dir.path().join("ratings.json");
        std::fs::create_dir(&unwritable).unwrap();
        let settings = Settings::from_lookup(|key| match key {
            "RATINGS_BACKEND" => Some("local".into()),
            "RATINGS_LOCAL_PATH" => Some(unwritable.display().to_string()),
            _ => None,
        });

        let primary = Arc::new(LocalStore::file(&settings.local_path));
        let fallback = Arc::new(settings.fallback_store());
        assert!(fallback.path().is_none());
        let engine = RatingsEngine::new(primary, fallback.clone(), SessionIdentity::default());

        let persisted = engine.set_vote("img", Some("alice"), Vote::Like).unwrap().await.unwrap();
        assert_eq!(persisted, Persisted::Fallback);
        assert_eq!(fallback.read_all("img").await.unwrap().get("alice"), Some(Vote::Like));
    }

    #[tokio::test]
    async fn test_voter_resolution_order() {
        let store = Arc::new(MemoryStore::default());
        let (engine, _) = engine_with(store.clone());

        engine.set_vote("img", None, Vote::Like).unwrap().await.unwrap();
        engine.identity().set_current("erin");
        engine.set_vote("img", None, Vote::Unsure).unwrap().await.unwrap();
        engine.set_vote("img", Some("frank"), Vote::Dislike).unwrap().await.unwrap();

        let votes = engine.get_votes("img").await;
        assert_eq!(votes.get("guest"), Some(Vote::Like));
        assert_eq!(votes.get("erin"), Some(Vote::Unsure));
        assert_eq!(votes.get("frank"), Some(Vote::Dislike));
    }

    #[tokio::test]
    async fn test_change_events_carry_image_id() {
        let store = Arc::new(MemoryStore::default());
        let (engine, _) = engine_with(store.clone());
        let mut changes = engine.changes();

        engine.set_vote("img-7", Some("alice"), Vote::Like).unwrap().await.unwrap();
        assert_eq!(changes.recv().await.unwrap().image_id, "img-7");
    }

    #[tokio::test]
    async fn test_get_many() {
        let store = Arc::new(MemoryStore::default());
        store.seed("a", "x", Vote::Like);
        let (engine, _) = engine_with(store.clone());

        let maps = engine.get_many(&["a".to_string(), "b".to_string()]).await;
        assert_eq!(maps.len(), 2);
        assert_eq!(maps["a"].get("x"), Some(Vote::Like));
        assert!(maps["b"].is_empty());
    }

    #[tokio::test]
    async fn test_local_store_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ratings").join("store.json");
        let store = LocalStore::file(&path);

        assert!(store.read_all("img").await.unwrap().is_empty());
        store.write_one("img", "alice", Vote::Like).await.unwrap();
        store.write_one("img", "bob", Vote::Dislike).await.unwrap();
        store.delete_one("img", "bob").await.unwrap();
        store.delete_one("img", "nobody").await.unwrap();
        store.delete_one("missing", "alice").await.unwrap();

        let reopened = LocalStore::file(&path);
        let votes = reopened.read_all("img").await.unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes.get("alice"), Some(Vote::Like));

        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw[STORAGE_KEY]["img"]["alice"], "like");
    }

    #[tokio::test]
    async fn test_local_store_keeps_unrelated_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{"selectedName":"alice"}"#).unwrap();

        let store = LocalStore::file(&path);
        store.write_one("img", "alice", Vote::Unsure).await.unwrap();

        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["selectedName"], "alice");
        assert_eq!(raw[STORAGE_KEY]["img"]["alice"], "unsure");
    }

    #[tokio::test]
    async fn test_local_store_reports_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = LocalStore::file(&path);
        assert!(matches!(store.read_all("img").await, Err(StoreError::Corrupt(_))));
        let sink: SnapshotSink = Arc::new(|_: &str, _: VoteMap| {});
        assert!(!store.watch("img", sink).is_live());
    }

    #[test]
    fn test_registry_drains() {
        let mut registry = SubscriptionRegistry::default();
        let (a, first) = registry.add("img", Arc::new(|_: &VoteMap| {}));
        let (b, second) = registry.add("img", Arc::new(|_: &VoteMap| {}));
        assert!(first && !second);
        assert!(registry.attach_watch("img", WatchHandle::noop()).is_none());
        assert!(registry.attach_watch("gone", WatchHandle::noop()).is_some());

        assert!(registry.remove("img", a).is_none());
        assert!(registry.remove("img", b).is_some());
        assert!(registry.remove("img", b).is_none());
        assert_eq!(registry.image_count(), 0);
    }

    #[test]
    fn test_settings_from_lookup() {
        let settings = Settings::from_lookup(|key| match key {
            "RATINGS_BACKEND" => Some("local".into()),
            "RATINGS_EVENT_CAPACITY" => Some("not-a-number".into()),
            "RATINGS_FALLBACK_VOTER" => Some("visitor".into()),
            _ => None,
        });
        assert_eq!(settings.backend, BackendKind::Local);
        assert_eq!(settings.event_capacity, crate::engine::DEFAULT_EVENT_CAPACITY);
        assert_eq!(settings.fallback_voter, "visitor");
        assert!(settings.local_path.ends_with("image_ratings.json"));

        assert_eq!(Settings::default().backend, BackendKind::Remote);
    }

    #[test]
    fn test_fallback_store_follows_backend() {
        let remote = Settings::from_lookup(|key| match key {
            "RATINGS_LOCAL_PATH" => Some("/var/lib/ratings.json".into()),
            _ => None,
        });
        assert_eq!(remote.fallback_store().path(), Some(std::path::Path::new("/var/lib/ratings.json")));

        let local = Settings::from_lookup(|key| match key {
            "RATINGS_BACKEND" => Some("local".into()),
            _ => None,
        });
        assert!(local.fallback_store().path().is_none());
    }
}
