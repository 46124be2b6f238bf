//! Property tests for counting, ordering, rebuild and timing invariants.

use livesync::unread::count_unread;
use livesync::{
    CollectionPaths, Debouncer, EventLoop, ManualClock, MemoryStore, Message, MessageId,
    ProfileCache, ProfileCacheConfig, Query, RemoteStore, SubscriptionTree, SyncClient,
    SyncConfig, ThreadId, Timestamp, UserId, WatchKey,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

const AUTHORS: [&str; 3] = ["me", "ann", "bo"];

fn settle(clock: &ManualClock, lp: &EventLoop) {
    for _ in 0..5 {
        lp.run_until_idle();
        clock.advance(100);
    }
    lp.run_until_idle();
}

fn client() -> (ManualClock, EventLoop, Arc<MemoryStore>, SyncClient) {
    let clock = ManualClock::default();
    let lp = EventLoop::new(Arc::new(clock.clone()));
    let store = MemoryStore::new();
    let client = SyncClient::new(store.clone(), lp.clone(), SyncConfig::default()).unwrap();
    (clock, lp, store, client)
}

fn messages_strategy() -> impl Strategy<Value = Vec<(usize, i64)>> {
    prop::collection::vec((0..AUTHORS.len(), 0i64..50), 0..25)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_count_matches_definition(
        messages in messages_strategy(),
        cursor in prop::option::of(0i64..50),
    ) {
        let me = UserId::from("me");
        let messages: Vec<Message> = messages
            .iter()
            .enumerate()
            .map(|(i, (author, at))| Message {
                id: MessageId::new(format!("m{}", i)),
                thread_id: ThreadId::from("t"),
                author_id: UserId::from(AUTHORS[*author]),
                created_at: Timestamp(*at),
                text: None,
            })
            .collect();

        let expected = messages
            .iter()
            .filter(|m| m.author_id != me)
            .filter(|m| cursor.map_or(true, |c| m.created_at.0 > c))
            .count();
        prop_assert_eq!(count_unread(&messages, cursor.map(Timestamp), &me), expected);
    }

    #[test]
    fn prop_rail_count_matches_store(
        messages in messages_strategy(),
        cursor in prop::option::of(0i64..50),
    ) {
        let (clock, lp, store, client) = client();
        store.set_document("threads/t1", json!({"participants": ["me", "ann"], "lastActivityAt": 1}));
        if let Some(at) = cursor {
            store.set_document("threads/t1/reads/me", json!({"lastReadAt": at}));
        }
        for (i, (author, at)) in messages.iter().enumerate() {
            store.set_document(
                &format!("threads/t1/messages/m{}", i),
                json!({"authorId": AUTHORS[*author], "createdAt": at}),
            );
        }

        let rail = client.subscribe_unread_rail(&UserId::from("me"), |_| {}).unwrap();
        settle(&clock, &lp);

        let expected = messages
            .iter()
            .filter(|(author, at)| AUTHORS[*author] != "me" && cursor.map_or(true, |c| *at > c))
            .count();
        let actual = rail
            .entries()
            .unwrap()
            .iter()
            .find(|e| e.thread_id.as_str() == "t1")
            .map_or(0, |e| e.unread_count);
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn prop_rail_strictly_ordered(activities in prop::collection::vec(0i64..5, 1..20)) {
        let (clock, lp, store, client) = client();
        for (i, activity) in activities.iter().enumerate() {
            store.set_document(
                &format!("threads/t{}", i),
                json!({"participants": ["me", "ann"], "lastActivityAt": activity}),
            );
            store.set_document(
                &format!("threads/t{}/messages/m", i),
                json!({"authorId": "ann", "createdAt": 1}),
            );
        }

        let rail = client.subscribe_unread_rail(&UserId::from("me"), |_| {}).unwrap();
        settle(&clock, &lp);

        let entries = rail.entries().unwrap();
        prop_assert_eq!(entries.len(), activities.len());
        for pair in entries.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            let ordered = a.last_activity > b.last_activity
                || (a.last_activity == b.last_activity && a.thread_id < b.thread_id);
            prop_assert!(ordered, "{:?} before {:?}", a.thread_id, b.thread_id);
        }
    }

    #[test]
    fn prop_rebuild_is_idempotent(snapshots in prop::collection::vec(prop::collection::btree_set(0u8..12, 0..12), 1..8)) {
        let clock = ManualClock::default();
        let lp = EventLoop::new(Arc::new(clock.clone()));
        let store = MemoryStore::new();
        let remote: Arc<dyn RemoteStore> = store.clone();

        // One key per member plus one shared by all members.
        let tree = SubscriptionTree::new(remote, lp.clone(), Query::collection("items"))
            .derive(|member, _view| {
                vec![
                    WatchKey::document(format!("detail/{}", member.id())),
                    WatchKey::document("detail/shared"),
                ]
            })
            .attach(|_| {});

        let mut present: BTreeSet<u8> = BTreeSet::new();
        for members in snapshots {
            for gone in present.difference(&members) {
                store.delete_document(&format!("items/{}", gone));
            }
            for id in &members {
                store.set_document(&format!("items/{}", id), json!({"rev": members.len()}));
            }
            present = members;
            lp.run_until_idle();

            let expected = present.len() + usize::from(!present.is_empty());
            prop_assert_eq!(tree.open_inner_count(), expected);
            prop_assert_eq!(store.open_watches_under("detail/"), expected);
        }

        tree.detach();
        prop_assert_eq!(store.open_watch_count(), 0);
    }

    #[test]
    fn prop_debounce_runs_last_payload_once(burst in 1usize..40, gaps in prop::collection::vec(0u64..50, 40)) {
        let clock = ManualClock::default();
        let lp = EventLoop::new(Arc::new(clock.clone()));
        let debouncer = Debouncer::new(lp.clone());
        let runs = Arc::new(Mutex::new(Vec::new()));

        for (i, gap) in gaps.iter().take(burst).enumerate() {
            let runs = Arc::clone(&runs);
            debouncer.schedule("key", 50, move || runs.lock().push(i));
            // Each call lands inside the previous call's window.
            clock.advance(*gap.min(&49));
            lp.run_until_idle();
        }
        clock.advance(50);
        lp.run_until_idle();

        prop_assert_eq!(runs.lock().clone(), vec![burst - 1]);
    }

    #[test]
    fn prop_ttl_serves_cached_until_expiry(ttl in 1u64..10_000, probe in 0u64..10_000) {
        let clock = ManualClock::default();
        let lp = EventLoop::new(Arc::new(clock.clone()));
        let store = MemoryStore::new();
        let remote: Arc<dyn RemoteStore> = store.clone();
        let config = ProfileCacheConfig { ttl_ms: ttl, batch_window_ms: 0, ..Default::default() };
        let cache = ProfileCache::new(remote, lp.clone(), config, CollectionPaths::default());
        let user = UserId::from("ada");

        store.set_document("users/ada", json!({"displayName": "Ada"}));
        cache.request(&user);
        lp.run_until_idle();
        let fetched = cache.get(&user).unwrap();
        let fetches = store.fetch_count();

        store.set_document("users/ada", json!({"displayName": "Ada L."}));
        clock.set(fetched.fetched_at.plus_millis(probe));
        prop_assert_eq!(&cache.get(&user).unwrap().profile, &fetched.profile);
        cache.request(&user);
        lp.run_until_idle();

        let refreshes = store.fetch_count() - fetches;
        if probe < ttl {
            prop_assert_eq!(refreshes, 0);
        } else {
            prop_assert_eq!(refreshes, 1);
            prop_assert_eq!(cache.get(&user).unwrap().profile.display_name, "Ada L.");
        }
    }
}
