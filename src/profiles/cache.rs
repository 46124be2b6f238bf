//! Bounded profile cache: TTL with stale-while-revalidate, request
//! coalescing into batch fetches, and a fixed-size pool of live watches.

use crate::config::{CollectionPaths, ProfileCacheConfig};
use crate::error::{Result, SyncError};
use crate::remote::{Document, RemoteStore, SnapshotSink, Teardown};
use crate::runtime::{EventLoop, IntervalHandle, TimerId};
use crate::types::{Profile, ProfileCacheEntry, ProfileSource, Timestamp, UserId};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use super::types::{CacheStats, CacheStatus, ChangeListener, ListenerId, LiveOutcome, Priority};

struct Slot {
    entry: ProfileCacheEntry,
    /// Sequence stamp of the value in `entry`.
    applied_seq: u64,
}

struct LiveSlot {
    priority: Priority,
    generation: u64,
    teardown: Teardown,
}

struct CacheState {
    status: CacheStatus,
    slots: HashMap<UserId, Slot>,

    /// Fetches issued and not yet answered.
    in_flight: HashSet<UserId>,
    /// Requests waiting for the batch window, in arrival order.
    queued: Vec<UserId>,
    batch_timer: Option<TimerId>,

    /// Live watches, most recently accessed first. Never above `max_live`.
    live: LruCache<UserId, LiveSlot>,
    next_live_generation: u64,
    /// Users refreshed by polling instead of a live watch.
    polled: VecDeque<UserId>,
    poller: Option<IntervalHandle>,

    /// Stamps fetch issuance and live arrival; lower stamps never overwrite.
    next_seq: u64,
    /// Responses stamped below this were issued before the last `clear`.
    min_valid_seq: u64,

    listeners: Vec<(ListenerId, ChangeListener)>,
    next_listener: u64,
    stats: CacheStats,
}

impl CacheState {
    fn new() -> Self {
        Self {
            status: CacheStatus::Idle,
            slots: HashMap::new(),
            in_flight: HashSet::new(),
            queued: Vec::new(),
            batch_timer: None,
            live: LruCache::unbounded(),
            next_live_generation: 0,
            polled: VecDeque::new(),
            poller: None,
            next_seq: 0,
            min_valid_seq: 0,
            listeners: Vec::new(),
            next_listener: 0,
            stats: CacheStats::default(),
        }
    }

    fn issue_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn needs_fetch(&self, user: &UserId, now: Timestamp) -> bool {
        if self.live.contains(user) || self.in_flight.contains(user) || self.queued.contains(user) {
            return false;
        }
        match self.slots.get(user) {
            Some(slot) => !slot.entry.is_fresh(now),
            None => true,
        }
    }

    /// Store a fetched or pushed value unless a newer one was already applied.
    fn apply(
        &mut self,
        user: &UserId,
        profile: Profile,
        seq: u64,
        source: ProfileSource,
        now: Timestamp,
        ttl_ms: u64,
    ) -> bool {
        if seq < self.min_valid_seq {
            self.stats.stale_discarded += 1;
            return false;
        }
        if let Some(slot) = self.slots.get(user) {
            if seq <= slot.applied_seq {
                self.stats.stale_discarded += 1;
                trace!(user = %user, seq, applied = slot.applied_seq, "discarding stale profile");
                return false;
            }
        }
        let source = if self.live.contains(user) {
            ProfileSource::Live
        } else {
            source
        };
        self.slots.insert(
            user.clone(),
            Slot {
                entry: ProfileCacheEntry {
                    user_id: user.clone(),
                    profile,
                    fetched_at: now,
                    expires_at: now.plus_millis(ttl_ms),
                    source,
                },
                applied_seq: seq,
            },
        );
        true
    }

    fn demote(&mut self, user: &UserId) {
        if let Some(slot) = self.slots.get_mut(user) {
            slot.entry.source = ProfileSource::OneShot;
        }
        if !self.polled.contains(user) {
            self.polled.push_back(user.clone());
        }
    }

    fn listeners(&self) -> Vec<ChangeListener> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

struct CacheInner {
    store: Arc<dyn RemoteStore>,
    lp: EventLoop,
    config: ProfileCacheConfig,
    paths: CollectionPaths,
    state: Mutex<CacheState>,
}

impl CacheInner {
    fn now(&self) -> Timestamp {
        self.lp.now()
    }

    fn request(self: &Arc<Self>, user: &UserId) {
        let flush_now = {
            let mut state = self.state.lock();
            if state.status == CacheStatus::Disposed || !state.needs_fetch(user, self.now()) {
                return;
            }
            state.stats.requests += 1;
            state.queued.push(user.clone());

            if state.queued.len() >= self.config.max_batch_size {
                true
            } else {
                if state.batch_timer.is_none() {
                    let weak = Arc::downgrade(self);
                    let timer = self.lp.schedule_after(self.config.batch_window_ms, move || {
                        if let Some(cache) = weak.upgrade() {
                            cache.flush_batches();
                        }
                    });
                    state.batch_timer = Some(timer);
                }
                false
            }
        };
        if flush_now {
            self.flush_batches();
        }
    }

    /// Issue every queued request, `max_batch_size` keys per fetch.
    fn flush_batches(self: &Arc<Self>) {
        let batches = {
            let mut state = self.state.lock();
            if let Some(timer) = state.batch_timer.take() {
                self.lp.cancel(timer);
            }
            let queued = std::mem::take(&mut state.queued);
            let mut batches = Vec::new();
            for chunk in queued.chunks(self.config.max_batch_size) {
                let seq = state.issue_seq();
                state.in_flight.extend(chunk.iter().cloned());
                state.stats.batches += 1;
                state.stats.keys_fetched += chunk.len() as u64;
                batches.push((chunk.to_vec(), seq));
            }
            batches
        };
        for (users, seq) in batches {
            debug!(keys = users.len(), seq, "fetching profile batch");
            self.fetch(users, seq);
        }
    }

    fn fetch(self: &Arc<Self>, users: Vec<UserId>, seq: u64) {
        let paths = users.iter().map(|u| self.paths.profile(u)).collect();
        let weak = Arc::downgrade(self);
        let lp = self.lp.clone();
        self.store.fetch_many(
            paths,
            Box::new(move |result| {
                lp.spawn(move || {
                    if let Some(cache) = weak.upgrade() {
                        cache.on_fetched(users, seq, result);
                    }
                });
            }),
        );
    }

    fn on_fetched(&self, users: Vec<UserId>, seq: u64, result: Result<HashMap<String, Document>>) {
        let (changed, listeners) = {
            let mut state = self.state.lock();
            for user in &users {
                state.in_flight.remove(user);
            }
            if state.status == CacheStatus::Disposed {
                return;
            }

            let mut changed = Vec::new();
            match result {
                Err(err) => {
                    // Previous values stay; the next request retries.
                    state.stats.fetch_failures += 1;
                    warn!(keys = users.len(), error = %err, "profile fetch failed");
                }
                Ok(docs) => {
                    let now = self.now();
                    for user in users {
                        let Some(doc) = docs.get(&self.paths.profile(&user)) else {
                            trace!(user = %user, "profile does not exist");
                            continue;
                        };
                        match Profile::from_document(doc) {
                            Ok(profile) => {
                                if state.apply(&user, profile, seq, ProfileSource::OneShot, now, self.config.ttl_ms) {
                                    changed.push(user);
                                }
                            }
                            Err(err) => warn!(user = %user, error = %err, "undecodable profile"),
                        }
                    }
                }
            }
            (changed, state.listeners())
        };
        notify(&listeners, &changed);
    }

    fn subscribe_live(self: &Arc<Self>, user: &UserId, priority: Priority) -> LiveOutcome {
        let (outcome, evicted, generation) = {
            let mut state = self.state.lock();
            if state.status == CacheStatus::Disposed {
                return LiveOutcome::Rejected;
            }

            if let Some(slot) = state.live.get_mut(user) {
                slot.priority = slot.priority.max(priority);
                return LiveOutcome::AlreadyLive;
            }

            let mut outcome = LiveOutcome::Opened;
            let mut evicted = None;
            if state.live.len() >= self.config.max_live {
                // Least recently accessed slot this request outranks or ties.
                let victim = state
                    .live
                    .iter()
                    .rev()
                    .find(|(_, slot)| slot.priority <= priority)
                    .map(|(id, _)| id.clone());

                match victim {
                    Some(victim) => {
                        if let Some(slot) = state.live.pop(&victim) {
                            evicted = Some(slot.teardown);
                        }
                        state.demote(&victim);
                        state.stats.evictions += 1;
                        outcome = LiveOutcome::Evicted(victim);
                    }
                    None => {
                        state.demote(user);
                        drop(state);
                        trace!(user = %user, "live pool full, polling instead");
                        self.request(user);
                        return LiveOutcome::Demoted;
                    }
                }
            }

            state.next_live_generation += 1;
            let generation = state.next_live_generation;
            state.live.put(
                user.clone(),
                LiveSlot {
                    priority,
                    generation,
                    teardown: Teardown::noop(),
                },
            );
            state.polled.retain(|u| u != user);
            if let Some(slot) = state.slots.get_mut(user) {
                slot.entry.source = ProfileSource::Live;
            }
            state.stats.live_opens += 1;
            (outcome, evicted, generation)
        };

        // Close before open so the pool never exceeds its bound.
        if let Some(mut teardown) = evicted {
            teardown.run();
            if let LiveOutcome::Evicted(victim) = &outcome {
                debug!(evicted = %victim, admitted = %user, "evicted live profile watch");
            }
        }

        let teardown = self.open_live(user, generation);
        let rejected = {
            let mut state = self.state.lock();
            match state.live.peek_mut(user) {
                Some(slot) if slot.generation == generation => {
                    slot.teardown = teardown;
                    None
                }
                _ => Some(teardown),
            }
        };
        if let Some(mut teardown) = rejected {
            teardown.run();
        }
        outcome
    }

    fn open_live(self: &Arc<Self>, user: &UserId, generation: u64) -> Teardown {
        let weak = Arc::downgrade(self);
        let lp = self.lp.clone();
        let owner = user.clone();
        let sink: SnapshotSink<Option<Document>> = Arc::new(move |snapshot| {
            let weak = weak.clone();
            let user = owner.clone();
            lp.spawn(move || {
                if let Some(cache) = weak.upgrade() {
                    cache.on_live_snapshot(user, generation, snapshot);
                }
            });
        });
        self.store.watch_document(&self.paths.profile(user), sink)
    }

    fn on_live_snapshot(&self, user: UserId, generation: u64, snapshot: Result<Option<Document>>) {
        let (changed, listeners, failed) = {
            let mut state = self.state.lock();
            let current = state
                .live
                .peek(&user)
                .map_or(false, |slot| slot.generation == generation);
            if !current || state.status == CacheStatus::Disposed {
                state.stats.stale_discarded += 1;
                return;
            }

            let mut changed = Vec::new();
            let mut failed = None;
            match snapshot {
                Ok(Some(doc)) => match Profile::from_document(&doc) {
                    Ok(profile) => {
                        let seq = state.issue_seq();
                        let now = self.now();
                        if state.apply(&user, profile, seq, ProfileSource::Live, now, self.config.ttl_ms) {
                            changed.push(user.clone());
                        }
                    }
                    Err(err) => warn!(user = %user, error = %err, "undecodable live profile"),
                },
                Ok(None) => trace!(user = %user, "live profile does not exist"),
                Err(err) => {
                    warn!(user = %user, error = %err, "live profile watch failed, polling instead");
                    failed = state.live.pop(&user).map(|slot| slot.teardown);
                    state.demote(&user);
                }
            }
            (changed, state.listeners(), failed)
        };
        if let Some(mut teardown) = failed {
            teardown.run();
        }
        notify(&listeners, &changed);
    }

    fn poll_tick(self: &Arc<Self>) {
        let (users, seq) = {
            let mut state = self.state.lock();
            if state.status != CacheStatus::Running || state.polled.is_empty() {
                return;
            }
            let mut users = Vec::new();
            let rounds = state.polled.len().min(self.config.poll_batch_size);
            for _ in 0..rounds {
                if let Some(user) = state.polled.pop_front() {
                    if !state.in_flight.contains(&user) && !state.live.contains(&user) {
                        users.push(user.clone());
                    }
                    state.polled.push_back(user);
                }
            }
            if users.is_empty() {
                return;
            }
            let seq = state.issue_seq();
            state.in_flight.extend(users.iter().cloned());
            state.stats.polls += 1;
            state.stats.keys_fetched += users.len() as u64;
            (users, seq)
        };
        trace!(keys = users.len(), "polling demoted profiles");
        self.fetch(users, seq);
    }

    /// Drop all entries and watches. Returns the teardowns to run unlocked.
    fn reset(&self, state: &mut CacheState) -> Vec<Teardown> {
        if let Some(timer) = state.batch_timer.take() {
            self.lp.cancel(timer);
        }
        let mut teardowns = Vec::with_capacity(state.live.len());
        while let Some((_, slot)) = state.live.pop_lru() {
            teardowns.push(slot.teardown);
        }
        state.slots.clear();
        state.queued.clear();
        state.in_flight.clear();
        state.polled.clear();
        state.min_valid_seq = state.next_seq + 1;
        teardowns
    }
}

fn notify(listeners: &[ChangeListener], changed: &[UserId]) {
    if changed.is_empty() {
        return;
    }
    for listener in listeners {
        listener(changed);
    }
}

/// Resolves `userId → display fields` without one live watch per user.
///
/// All reads and writes go through `get` / `request` / `subscribe_live`, so
/// TTL, batching and the live-pool bound are enforced in one place. Clones
/// share the same cache.
#[derive(Clone)]
pub struct ProfileCache {
    inner: Arc<CacheInner>,
}

impl ProfileCache {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        lp: EventLoop,
        config: ProfileCacheConfig,
        paths: CollectionPaths,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                lp,
                config,
                paths,
                state: Mutex::new(CacheState::new()),
            }),
        }
    }

    /// Start polling demoted entries. Idempotent.
    pub fn init(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        match state.status {
            CacheStatus::Disposed => return Err(SyncError::Disposed),
            CacheStatus::Running => return Ok(()),
            CacheStatus::Idle => {}
        }
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let poller = self.inner.lp.every(self.inner.config.poll_interval_ms, move || {
            if let Some(cache) = weak.upgrade() {
                cache.poll_tick();
            }
        });
        state.poller = Some(poller);
        state.status = CacheStatus::Running;
        Ok(())
    }

    /// Forget every entry and close every live watch. The cache stays usable.
    pub fn clear(&self) {
        let teardowns = {
            let mut state = self.inner.state.lock();
            self.inner.reset(&mut state)
        };
        debug!(closing = teardowns.len(), "cleared profile cache");
        for mut teardown in teardowns {
            teardown.run();
        }
    }

    /// Clear and stop for good. Later calls are no-ops.
    pub fn dispose(&self) {
        let teardowns = {
            let mut state = self.inner.state.lock();
            if state.status == CacheStatus::Disposed {
                return;
            }
            state.status = CacheStatus::Disposed;
            if let Some(poller) = state.poller.take() {
                poller.cancel();
            }
            state.listeners.clear();
            self.inner.reset(&mut state)
        };
        for mut teardown in teardowns {
            teardown.run();
        }
    }

    pub fn status(&self) -> CacheStatus {
        self.inner.state.lock().status
    }

    /// Cached value, fresh or stale. Never blocks; a stale hit schedules a
    /// background refresh and a miss schedules nothing.
    pub fn get(&self, user: &UserId) -> Option<ProfileCacheEntry> {
        let (entry, refresh) = {
            let mut state = self.inner.state.lock();
            if state.status == CacheStatus::Disposed {
                return None;
            }
            // Bump recency in the live pool.
            state.live.get(user);
            let now = self.inner.now();
            let found = state
                .slots
                .get(user)
                .map(|slot| (slot.entry.clone(), slot.entry.is_fresh(now)));
            match found {
                Some((entry, true)) => {
                    state.stats.hits += 1;
                    (Some(entry), false)
                }
                Some((entry, false)) => {
                    state.stats.stale_hits += 1;
                    (Some(entry), true)
                }
                None => {
                    state.stats.misses += 1;
                    (None, false)
                }
            }
        };
        if refresh {
            self.inner.request(user);
        }
        entry
    }

    /// Queue a fetch unless the entry is fresh, live, queued or in flight.
    pub fn request(&self, user: &UserId) {
        self.inner.request(user);
    }

    /// Cached profile or the placeholder identity, requesting on a miss.
    /// The flag is true for the placeholder.
    pub fn display_or_placeholder(&self, user: &UserId) -> (Profile, bool) {
        match self.get(user) {
            Some(entry) => (entry.profile, false),
            None => {
                self.request(user);
                (Profile::placeholder(user), true)
            }
        }
    }

    /// Keep `user` updated by push, within the bounded live pool.
    pub fn subscribe_live(&self, user: &UserId, priority: Priority) -> LiveOutcome {
        self.inner.subscribe_live(user, priority)
    }

    /// Give up interest in `user`: the live slot if it holds one, otherwise
    /// its place in the poll rotation. The cached value stays.
    pub fn release_live(&self, user: &UserId) -> bool {
        let (released, unpolled) = {
            let mut state = self.inner.state.lock();
            let released = state.live.pop(user).map(|slot| slot.teardown);
            if released.is_some() {
                if let Some(slot) = state.slots.get_mut(user) {
                    slot.entry.source = ProfileSource::OneShot;
                }
            }
            let before = state.polled.len();
            state.polled.retain(|polled| polled != user);
            (released, state.polled.len() != before)
        };
        match released {
            Some(mut teardown) => {
                teardown.run();
                true
            }
            None => unpolled,
        }
    }

    /// Register a listener for profile changes.
    pub fn on_change(&self, listener: impl Fn(&[UserId]) + Send + Sync + 'static) -> ListenerId {
        let mut state = self.inner.state.lock();
        state.next_listener += 1;
        let id = ListenerId(state.next_listener);
        state.listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        state.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners.len()
    }

    pub fn is_live(&self, user: &UserId) -> bool {
        self.inner.state.lock().live.contains(user)
    }

    pub fn live_count(&self) -> usize {
        self.inner.state.lock().live.len()
    }

    pub fn polled_count(&self) -> usize {
        self.inner.state.lock().polled.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.state.lock().stats.clone()
    }

    pub fn config(&self) -> &ProfileCacheConfig {
        &self.inner.config
    }
}
