//! Scaling tests with hundreds of threads and users.
//!
//! Checks resource bounds hold at size and reports timings for:
//! - Initial rail build over many threads
//! - Membership churn
//! - Live profile pool pressure
//! - Batched profile loading

use livesync::{
    EventLoop, LiveOutcome, ManualClock, MemoryStore, Priority, SyncClient, SyncConfig, UserId,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

const THREAD_COUNT: usize = 500;
const USER_COUNT: usize = 1_000;

struct Harness {
    clock: ManualClock,
    lp: EventLoop,
    store: Arc<MemoryStore>,
    client: SyncClient,
}

fn harness() -> Harness {
    let clock = ManualClock::default();
    let lp = EventLoop::new(Arc::new(clock.clone()));
    let store = MemoryStore::new();
    let client = SyncClient::new(store.clone(), lp.clone(), SyncConfig::default()).unwrap();
    Harness {
        clock,
        lp,
        store,
        client,
    }
}

impl Harness {
    fn settle(&self) {
        for _ in 0..5 {
            self.lp.run_until_idle();
            self.clock.advance(100);
        }
        self.lp.run_until_idle();
    }
}

/// Timing helper
struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    fn report_with_count(&self, count: usize) {
        let ms = self.elapsed_ms();
        let per_item = if count > 0 { ms / count as f64 } else { 0.0 };
        println!(
            "  {} took {:.2}ms ({} items, {:.4}ms/item)",
            self.name, ms, count, per_item
        );
    }
}

// =============================================================================
// Test: Rail over many threads
// =============================================================================

#[test]
fn test_scaling_rail_over_many_threads() {
    println!("\n=== Rail over {} threads ===", THREAD_COUNT);
    let h = harness();

    for i in 0..THREAD_COUNT {
        let other = format!("u{}", i % 40);
        h.store.set_document(
            &format!("threads/t{:04}", i),
            json!({"participants": ["me", other], "lastActivityAt": i}),
        );
        h.store.set_document(
            &format!("threads/t{:04}/messages/m1", i),
            json!({"authorId": other, "createdAt": 1}),
        );
    }

    let timer = Timer::new("initial build");
    let rail = h
        .client
        .subscribe_unread_rail(&UserId::from("me"), |_| {})
        .unwrap();
    h.settle();
    timer.report_with_count(THREAD_COUNT);

    let entries = rail.entries().unwrap();
    assert_eq!(entries.len(), THREAD_COUNT);
    assert_eq!(entries[0].thread_id.as_str(), "t0499");
    // Cursor plus message tail per thread, nothing more.
    assert_eq!(rail.rail().open_inner_count(), THREAD_COUNT * 2);
    // 40 distinct counterparts contend for 10 live slots.
    assert!(h.client.profiles().live_count() <= 10);

    // Drop every other thread from the membership.
    let timer = Timer::new("membership churn");
    for i in (0..THREAD_COUNT).step_by(2) {
        h.store.set_document(
            &format!("threads/t{:04}", i),
            json!({"participants": ["someone-else"], "lastActivityAt": i}),
        );
    }
    h.settle();
    timer.report_with_count(THREAD_COUNT / 2);

    assert_eq!(rail.entries().unwrap().len(), THREAD_COUNT / 2);
    assert_eq!(rail.rail().open_inner_count(), THREAD_COUNT);
    assert_eq!(h.store.open_watches_under("threads/"), THREAD_COUNT);

    rail.detach();
    assert_eq!(h.store.open_watches_under("threads"), 0);
}

// =============================================================================
// Test: Live pool pressure
// =============================================================================

#[test]
fn test_scaling_live_pool_bound() {
    println!("\n=== Live pool with {} users ===", USER_COUNT);
    let h = harness();
    let max_live = h.client.config().profiles.max_live;
    let profiles = h.client.profiles();

    let timer = Timer::new("subscribe_live");
    let mut evictions = 0;
    for i in 0..USER_COUNT {
        let user = UserId::new(format!("u{}", i));
        if let LiveOutcome::Evicted(_) = profiles.subscribe_live(&user, Priority::Visible) {
            evictions += 1;
        }
        assert!(profiles.live_count() <= max_live);
        assert!(h.store.open_watches_under("users/") <= max_live);
    }
    h.settle();
    timer.report_with_count(USER_COUNT);

    assert_eq!(profiles.live_count(), max_live);
    assert_eq!(evictions, USER_COUNT - max_live);
    assert_eq!(profiles.stats().evictions as usize, evictions);
    assert_eq!(profiles.polled_count(), USER_COUNT - max_live);

    // Demoted users refresh in small groups per tick.
    let before = h.store.fetch_count();
    h.clock.advance(h.client.config().profiles.poll_interval_ms);
    h.lp.run_until_idle();
    let polled = &h.store.fetch_log()[before..];
    assert_eq!(polled.len(), 1);
    assert_eq!(polled[0].len(), h.client.config().profiles.poll_batch_size);
}

// =============================================================================
// Test: Batched loading
// =============================================================================

#[test]
fn test_scaling_batched_profile_load() {
    println!("\n=== Batched load of {} profiles ===", USER_COUNT);
    let h = harness();
    for i in 0..USER_COUNT {
        h.store.set_document(
            &format!("users/u{}", i),
            json!({"displayName": format!("User {}", i)}),
        );
    }

    let timer = Timer::new("request + settle");
    for i in 0..USER_COUNT {
        h.client.request_profile(&UserId::new(format!("u{}", i)));
    }
    h.settle();
    timer.report_with_count(USER_COUNT);

    let batch = h.client.config().profiles.max_batch_size;
    assert_eq!(h.store.fetch_count(), USER_COUNT / batch);
    assert!(h.store.fetch_log().iter().all(|keys| keys.len() <= batch));
    assert_eq!(h.client.profiles().len(), USER_COUNT);

    let stats = h.client.profiles().stats();
    assert_eq!(stats.keys_fetched as usize, USER_COUNT);
    assert_eq!(stats.batches as usize, USER_COUNT / batch);
}
