//! Two-level live-query tree: one outer collection watch, and per member a
//! set of inner watches whose keys are derived from that member.

use crate::error::{Result, SyncError};
use crate::remote::{Document, Query, RemoteStore, SnapshotSink, Teardown, WatchKey};
use crate::runtime::EventLoop;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use super::types::{
    DeriveFn, ErrorFn, InnerSnapshot, InnerState, InnerView, TreeStats, TreeStatus, TreeView,
    UpdateFn,
};

/// An inner subscription slot. `teardown` is `None` while the watch is
/// being opened and after it failed.
struct InnerHandle {
    generation: u64,
    teardown: Option<Teardown>,
}

struct TreeState {
    status: TreeStatus,
    outer: Option<Teardown>,
    members: Vec<Document>,
    handles: HashMap<WatchKey, InnerHandle>,
    states: HashMap<WatchKey, InnerState>,
    /// Stamps every opened inner watch; snapshots from older stamps are stale.
    next_generation: u64,
    flush_scheduled: bool,
    stats: TreeStats,
}

impl TreeState {
    fn new() -> Self {
        Self {
            status: TreeStatus::Waiting,
            outer: None,
            members: Vec::new(),
            handles: HashMap::new(),
            states: HashMap::new(),
            next_generation: 0,
            flush_scheduled: false,
            stats: TreeStats::default(),
        }
    }

    /// Take every open teardown, outer included, leaving the tree empty.
    fn take_all_teardowns(&mut self) -> Vec<Teardown> {
        let mut teardowns: Vec<Teardown> = self
            .handles
            .drain()
            .filter_map(|(_, handle)| handle.teardown)
            .collect();
        self.stats.inner_closed += teardowns.len() as u64;
        if let Some(outer) = self.outer.take() {
            teardowns.push(outer);
        }
        self.states.clear();
        self.members.clear();
        teardowns
    }
}

struct TreeInner {
    store: Arc<dyn RemoteStore>,
    lp: EventLoop,
    root: Query,
    derive: DeriveFn,
    on_update: UpdateFn,
    on_error: ErrorFn,
    state: Mutex<TreeState>,
}

impl TreeInner {
    fn on_outer(self: &Arc<Self>, snapshot: Result<Vec<Document>>) {
        match snapshot {
            Ok(docs) => {
                {
                    let mut state = self.state.lock();
                    if !state.status.is_active() {
                        return;
                    }
                    state.status = TreeStatus::Live;
                    state.members = docs;
                }
                self.rebuild(true);
                self.schedule_flush();
            }
            Err(err) => {
                let teardowns = {
                    let mut state = self.state.lock();
                    if !state.status.is_active() {
                        return;
                    }
                    state.status = TreeStatus::Failed(err.clone());
                    state.take_all_teardowns()
                };
                warn!(root = %self.root, error = %err, "outer watch failed, tearing down tree");
                for mut teardown in teardowns {
                    teardown.run();
                }
                (self.on_error)(&err);
            }
        }
    }

    fn on_inner(self: &Arc<Self>, key: WatchKey, generation: u64, snapshot: Result<InnerSnapshot>) {
        let failed = {
            let mut state = self.state.lock();
            if !state.status.is_active() {
                return;
            }
            let current = state
                .handles
                .get(&key)
                .map_or(false, |handle| handle.generation == generation);
            if !current {
                state.stats.stale_discarded += 1;
                trace!(key = %key, generation, "discarding stale inner snapshot");
                return;
            }
            match snapshot {
                Ok(snapshot) => {
                    state.states.insert(key, InnerState::Ready(snapshot));
                    None
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "inner watch failed, member degrades to empty state");
                    state.stats.inner_failed += 1;
                    state.states.insert(key.clone(), InnerState::Failed(err));
                    state.handles.get_mut(&key).and_then(|handle| handle.teardown.take())
                }
            }
        };

        if let Some(mut teardown) = failed {
            teardown.run();
        }
        // Derived keys may depend on the state that just changed.
        self.rebuild(false);
        self.schedule_flush();
    }

    /// Bring open inner watches in line with the keys derived from the
    /// current members. All closes happen before any open.
    fn rebuild(self: &Arc<Self>, retry_failed: bool) {
        let (closing, opening) = {
            let mut state = self.state.lock();
            if !state.status.is_active() {
                return;
            }

            let mut required = Vec::new();
            let mut seen = HashSet::new();
            {
                let view = InnerView::new(&state.states);
                for member in &state.members {
                    for key in (self.derive)(member, &view) {
                        if seen.insert(key.clone()) {
                            required.push(key);
                        }
                    }
                }
            }

            let obsolete: Vec<WatchKey> = state
                .handles
                .keys()
                .filter(|key| !seen.contains(*key))
                .cloned()
                .collect();
            let mut closing = Vec::with_capacity(obsolete.len());
            for key in obsolete {
                if let Some(handle) = state.handles.remove(&key) {
                    if let Some(teardown) = handle.teardown {
                        closing.push(teardown);
                    }
                }
                state.states.remove(&key);
            }
            state.stats.inner_closed += closing.len() as u64;

            let mut opening = Vec::new();
            for key in required {
                let needs_open = match state.handles.get(&key) {
                    None => true,
                    Some(_) => {
                        retry_failed
                            && matches!(state.states.get(&key), Some(InnerState::Failed(_)))
                    }
                };
                if needs_open {
                    state.next_generation += 1;
                    let generation = state.next_generation;
                    state.handles.insert(
                        key.clone(),
                        InnerHandle {
                            generation,
                            teardown: None,
                        },
                    );
                    state.states.insert(key.clone(), InnerState::Pending);
                    opening.push((key, generation));
                }
            }

            state.stats.rebuilds += 1;
            (closing, opening)
        };

        if !closing.is_empty() || !opening.is_empty() {
            debug!(
                root = %self.root,
                closed = closing.len(),
                opened = opening.len(),
                "rebuilt inner subscriptions"
            );
        }

        for mut teardown in closing {
            teardown.run();
        }

        for (key, generation) in opening {
            let teardown = self.open_inner(&key, generation);
            let rejected = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let active = state.status.is_active();
                match state.handles.get_mut(&key) {
                    Some(handle) if active && handle.generation == generation => {
                        handle.teardown = Some(teardown);
                        state.stats.inner_opened += 1;
                        None
                    }
                    _ => Some(teardown),
                }
            };
            if let Some(mut teardown) = rejected {
                teardown.run();
            }
        }
    }

    fn open_inner(self: &Arc<Self>, key: &WatchKey, generation: u64) -> Teardown {
        let weak = Arc::downgrade(self);
        let lp = self.lp.clone();
        match key {
            WatchKey::Document(path) => {
                let key = key.clone();
                let sink: SnapshotSink<Option<Document>> = Arc::new(move |snapshot| {
                    post_inner(&lp, &weak, &key, generation, snapshot.map(InnerSnapshot::Document));
                });
                self.store.watch_document(path, sink)
            }
            WatchKey::Collection(query) => {
                let key = key.clone();
                let sink: SnapshotSink<Vec<Document>> = Arc::new(move |snapshot| {
                    post_inner(&lp, &weak, &key, generation, snapshot.map(InnerSnapshot::Collection));
                });
                self.store.watch_collection(query, sink)
            }
        }
    }

    fn schedule_flush(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.flush_scheduled || !state.status.is_active() {
                return;
            }
            state.flush_scheduled = true;
        }
        let weak = Arc::downgrade(self);
        self.lp.spawn(move || {
            if let Some(tree) = weak.upgrade() {
                tree.flush();
            }
        });
    }

    /// Emit one update for everything that changed since the last flush.
    fn flush(&self) {
        let view = {
            let mut state = self.state.lock();
            state.flush_scheduled = false;
            if state.status != TreeStatus::Live {
                return;
            }
            state.stats.updates_emitted += 1;
            TreeView {
                members: state.members.clone(),
                inner: state.states.clone(),
            }
        };
        (self.on_update)(&view);
    }

    fn detach(&self) {
        let teardowns = {
            let mut state = self.state.lock();
            if state.status == TreeStatus::Detached {
                return;
            }
            state.status = TreeStatus::Detached;
            state.take_all_teardowns()
        };
        debug!(root = %self.root, closing = teardowns.len(), "detaching subscription tree");
        for mut teardown in teardowns {
            teardown.run();
        }
    }
}

fn post_inner(
    lp: &EventLoop,
    tree: &Weak<TreeInner>,
    key: &WatchKey,
    generation: u64,
    snapshot: Result<InnerSnapshot>,
) {
    let tree = tree.clone();
    let key = key.clone();
    lp.spawn(move || {
        if let Some(tree) = tree.upgrade() {
            tree.on_inner(key, generation, snapshot);
        }
    });
}

/// Builder for a [`TreeHandle`].
///
/// # Example
///
/// ```ignore
/// let handle = SubscriptionTree::new(store, lp, Query::collection("threads"))
///     .derive(|thread, _view| vec![WatchKey::document(format!("{}/reads/me", thread.path))])
///     .attach(|view| println!("{} members", view.members.len()));
/// ```
pub struct SubscriptionTree {
    store: Arc<dyn RemoteStore>,
    lp: EventLoop,
    root: Query,
    derive: DeriveFn,
    on_error: ErrorFn,
}

impl SubscriptionTree {
    pub fn new(store: Arc<dyn RemoteStore>, lp: EventLoop, root: Query) -> Self {
        Self {
            store,
            lp,
            root,
            derive: Arc::new(|_, _| Vec::new()),
            on_error: Arc::new(|_| {}),
        }
    }

    /// Set how inner keys are derived from a member. Without this the tree
    /// only watches the outer collection.
    pub fn derive<F>(mut self, derive: F) -> Self
    where
        F: Fn(&Document, &InnerView<'_>) -> Vec<WatchKey> + Send + Sync + 'static,
    {
        self.derive = Arc::new(derive);
        self
    }

    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&SyncError) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(on_error);
        self
    }

    /// Open the outer watch. Never fails synchronously: an outer error is
    /// delivered to `on_error` from the loop.
    pub fn attach<F>(self, on_update: F) -> TreeHandle
    where
        F: Fn(&TreeView) + Send + Sync + 'static,
    {
        let inner = Arc::new(TreeInner {
            store: self.store,
            lp: self.lp,
            root: self.root,
            derive: self.derive,
            on_update: Arc::new(on_update),
            on_error: self.on_error,
            state: Mutex::new(TreeState::new()),
        });

        let weak = Arc::downgrade(&inner);
        let lp = inner.lp.clone();
        let sink: SnapshotSink<Vec<Document>> = Arc::new(move |snapshot| {
            let weak = weak.clone();
            lp.spawn(move || {
                if let Some(tree) = weak.upgrade() {
                    tree.on_outer(snapshot);
                }
            });
        });

        debug!(root = %inner.root, "attaching subscription tree");
        let outer = inner.store.watch_collection(&inner.root, sink);
        inner.state.lock().outer = Some(outer);

        TreeHandle { inner }
    }
}

/// Owner of an attached tree. Dropping it detaches.
pub struct TreeHandle {
    inner: Arc<TreeInner>,
}

impl TreeHandle {
    /// Tear down the outer and every inner watch. Idempotent, and safe after
    /// the tree failed or before it ever received a snapshot.
    pub fn detach(&self) {
        self.inner.detach();
    }

    /// Re-derive inner keys on the next loop turn, e.g. after a local
    /// projection the derive function reads has changed.
    pub fn refresh(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.lp.spawn(move || {
            if let Some(tree) = weak.upgrade() {
                tree.rebuild(false);
                tree.schedule_flush();
            }
        });
    }

    pub fn status(&self) -> TreeStatus {
        self.inner.state.lock().status.clone()
    }

    pub fn root(&self) -> &Query {
        &self.inner.root
    }

    /// Inner watches currently open against the store.
    pub fn open_inner_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .handles
            .values()
            .filter(|handle| handle.teardown.is_some())
            .count()
    }

    pub fn open_inner_keys(&self) -> Vec<WatchKey> {
        let mut keys: Vec<WatchKey> = self
            .inner
            .state
            .lock()
            .handles
            .iter()
            .filter(|(_, handle)| handle.teardown.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> TreeStats {
        self.inner.state.lock().stats.clone()
    }
}

impl Drop for TreeHandle {
    fn drop(&mut self) {
        self.inner.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::remote::{FilterOp, FilterValue, MemoryStore};
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        lp: EventLoop,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        Fixture {
            store: MemoryStore::new(),
            lp: EventLoop::new(Arc::new(clock)),
        }
    }

    fn cursor_key(member: &Document) -> WatchKey {
        WatchKey::document(format!("{}/reads/me", member.path))
    }

    fn attach_with_cursors(
        fx: &Fixture,
    ) -> (TreeHandle, Arc<Mutex<Vec<TreeView>>>, Arc<Mutex<Vec<SyncError>>>) {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let u = Arc::clone(&updates);
        let e = Arc::clone(&errors);
        let store: Arc<dyn RemoteStore> = fx.store.clone();
        let handle = SubscriptionTree::new(store, fx.lp.clone(), Query::collection("threads"))
            .derive(|member: &Document, _view: &InnerView<'_>| vec![cursor_key(member)])
            .on_error(move |err: &SyncError| e.lock().push(err.clone()))
            .attach(move |view: &TreeView| u.lock().push(view.clone()));
        (handle, updates, errors)
    }

    #[test]
    fn test_opens_one_inner_per_member() {
        let fx = fixture();
        fx.store.set_document("threads/a", json!({}));
        fx.store.set_document("threads/b", json!({}));

        let (handle, updates, _) = attach_with_cursors(&fx);
        fx.lp.run_until_idle();

        assert_eq!(handle.status(), TreeStatus::Live);
        assert_eq!(handle.open_inner_count(), 2);
        // Outer + 2 inner.
        assert_eq!(fx.store.open_watch_count(), 3);

        let last = updates.lock().last().cloned().unwrap();
        assert_eq!(last.members.len(), 2);
        assert!(last
            .inner
            .values()
            .all(|state| matches!(state, InnerState::Ready(InnerSnapshot::Document(None)))));
    }

    #[test]
    fn test_removed_member_closes_inner() {
        let fx = fixture();
        fx.store.set_document("threads/a", json!({}));
        fx.store.set_document("threads/b", json!({}));
        let (handle, _, _) = attach_with_cursors(&fx);
        fx.lp.run_until_idle();

        fx.store.delete_document("threads/a");
        fx.lp.run_until_idle();

        assert_eq!(handle.open_inner_keys(), vec![WatchKey::document("threads/b/reads/me")]);
        assert_eq!(fx.store.open_watch_count(), 2);
        assert_eq!(handle.stats().inner_closed, 1);
    }

    #[test]
    fn test_empty_outer_still_updates() {
        let fx = fixture();
        fx.store.set_document("threads/a", json!({}));
        let (handle, updates, _) = attach_with_cursors(&fx);
        fx.lp.run_until_idle();

        fx.store.delete_document("threads/a");
        fx.lp.run_until_idle();

        assert_eq!(handle.open_inner_count(), 0);
        let last = updates.lock().last().cloned().unwrap();
        assert!(last.members.is_empty());
        assert!(last.inner.is_empty());
    }

    #[test]
    fn test_detach_before_first_snapshot_is_noop() {
        let fx = fixture();
        let (handle, updates, errors) = attach_with_cursors(&fx);
        handle.detach();
        handle.detach();
        fx.lp.run_until_idle();

        assert_eq!(handle.status(), TreeStatus::Detached);
        assert!(updates.lock().is_empty());
        assert!(errors.lock().is_empty());
        assert_eq!(fx.store.open_watch_count(), 0);
    }

    #[test]
    fn test_outer_error_tears_down_everything() {
        let fx = fixture();
        fx.store.set_document("threads/a", json!({}));
        let (handle, _, errors) = attach_with_cursors(&fx);
        fx.lp.run_until_idle();
        assert_eq!(fx.store.open_watch_count(), 2);

        // Breaks inner and outer; the outer error is terminal either way.
        fx.store.break_watches_under("threads", "permission denied");
        fx.lp.run_until_idle();

        assert!(matches!(handle.status(), TreeStatus::Failed(_)));
        assert_eq!(errors.lock().len(), 1);
        assert_eq!(handle.open_inner_count(), 0);
        assert_eq!(fx.store.open_watch_count(), 0);
        handle.detach();
    }

    #[test]
    fn test_inner_error_isolated_and_retried() {
        let fx = fixture();
        fx.store.set_document("threads/a", json!({}));
        fx.store.set_document("threads/b", json!({}));
        fx.store.fail_watches_under("threads/a/");

        let (handle, updates, errors) = attach_with_cursors(&fx);
        fx.lp.run_until_idle();

        assert!(errors.lock().is_empty());
        assert_eq!(handle.open_inner_keys(), vec![WatchKey::document("threads/b/reads/me")]);
        let last = updates.lock().last().cloned().unwrap();
        assert!(matches!(
            last.state(&WatchKey::document("threads/a/reads/me")),
            Some(InnerState::Failed(_))
        ));

        // The next outer snapshot retries the failed key.
        fx.store.clear_failures();
        fx.store.set_document("threads/c", json!({}));
        fx.lp.run_until_idle();
        assert_eq!(handle.open_inner_count(), 3);
    }

    #[test]
    fn test_dependent_key_rebuilds_on_inner_change() {
        let fx = fixture();
        fx.store.set_document("threads/a", json!({}));

        let store: Arc<dyn RemoteStore> = fx.store.clone();
        let handle = SubscriptionTree::new(store, fx.lp.clone(), Query::collection("threads"))
            .derive(|member: &Document, view: &InnerView<'_>| {
                let cursor = cursor_key(member);
                let mut keys = vec![cursor.clone()];
                if let Some(snapshot) = view.snapshot(&cursor) {
                    let after = snapshot
                        .document()
                        .and_then(|doc| doc.field("lastReadAt"))
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    keys.push(WatchKey::Collection(
                        Query::collection(format!("{}/messages", member.path))
                            .filter("createdAt", FilterOp::Gt, after),
                    ));
                }
                keys
            })
            .attach(|_view: &TreeView| {});
        fx.lp.run_until_idle();
        assert_eq!(handle.open_inner_count(), 2);

        fx.store.set_document("threads/a/reads/me", json!({"lastReadAt": 5}));
        fx.lp.run_until_idle();

        // The old message query was replaced, not duplicated.
        assert_eq!(handle.open_inner_count(), 2);
        assert_eq!(handle.stats().inner_closed, 1);
        assert!(handle.open_inner_keys().iter().any(|key| matches!(
            key,
            WatchKey::Collection(q) if q.filters.iter().any(|f| f.value == FilterValue::Int(5))
        )));
    }

    #[test]
    fn test_burst_of_outer_snapshots_coalesces_updates() {
        let fx = fixture();
        let (_handle, updates, _) = attach_with_cursors(&fx);
        for i in 0..5 {
            fx.store.set_document(&format!("threads/t{}", i), json!({}));
        }
        fx.lp.run_until_idle();

        // One update for the whole outer burst, one once the inner
        // snapshots it opened have landed.
        let updates = updates.lock();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].members.len(), 5);
        assert!(updates[1]
            .inner
            .values()
            .all(|state| matches!(state, InnerState::Ready(_))));
    }

    #[test]
    fn test_drop_detaches() {
        let fx = fixture();
        fx.store.set_document("threads/a", json!({}));
        let (handle, _, _) = attach_with_cursors(&fx);
        fx.lp.run_until_idle();
        assert_eq!(fx.store.open_watch_count(), 2);

        drop(handle);
        assert_eq!(fx.store.open_watch_count(), 0);
    }

    /// Forwards to a `MemoryStore` but keeps document sinks callable after
    /// teardown, so a test can deliver a response that was already on the wire.
    struct LaggingStore {
        inner: Arc<MemoryStore>,
        sinks: Mutex<Vec<SnapshotSink<Option<Document>>>>,
    }

    impl RemoteStore for LaggingStore {
        fn watch_collection(&self, query: &Query, sink: SnapshotSink<Vec<Document>>) -> Teardown {
            self.inner.watch_collection(query, sink)
        }

        fn watch_document(&self, _path: &str, sink: SnapshotSink<Option<Document>>) -> Teardown {
            self.sinks.lock().push(sink);
            Teardown::noop()
        }

        fn fetch_many(
            &self,
            paths: Vec<String>,
            done: crate::remote::Completion<HashMap<String, Document>>,
        ) {
            self.inner.fetch_many(paths, done)
        }

        fn write_document(
            &self,
            path: &str,
            patch: serde_json::Value,
            done: crate::remote::Completion<()>,
        ) {
            self.inner.write_document(path, patch, done)
        }
    }

    #[test]
    fn test_late_snapshot_from_old_generation_is_discarded() {
        let fx = fixture();
        let lagging = Arc::new(LaggingStore {
            inner: fx.store.clone(),
            sinks: Mutex::new(Vec::new()),
        });
        let updates = Arc::new(Mutex::new(Vec::new()));
        let u = Arc::clone(&updates);
        let store: Arc<dyn RemoteStore> = lagging.clone();
        let handle = SubscriptionTree::new(store, fx.lp.clone(), Query::collection("threads"))
            .derive(|member: &Document, _view: &InnerView<'_>| vec![cursor_key(member)])
            .attach(move |view: &TreeView| u.lock().push(view.clone()));

        fx.store.set_document("threads/a", json!({}));
        fx.lp.run_until_idle();
        assert_eq!(lagging.sinks.lock().len(), 1);

        // Member leaves and rejoins: same key, new generation.
        fx.store.delete_document("threads/a");
        fx.lp.run_until_idle();
        fx.store.set_document("threads/a", json!({}));
        fx.lp.run_until_idle();
        let sinks = lagging.sinks.lock().clone();
        assert_eq!(sinks.len(), 2);

        let key = WatchKey::document("threads/a/reads/me");
        let newer = Document::new("threads/a/reads/me", json!({"lastReadAt": 20}));
        let older = Document::new("threads/a/reads/me", json!({"lastReadAt": 10}));

        (sinks[1])(Ok(Some(newer.clone())));
        fx.lp.run_until_idle();
        (sinks[0])(Ok(Some(older)));
        fx.lp.run_until_idle();

        assert_eq!(handle.stats().stale_discarded, 1);
        let last = updates.lock().last().cloned().unwrap();
        assert_eq!(
            last.state(&key),
            Some(&InnerState::Ready(InnerSnapshot::Document(Some(newer))))
        );
    }
}
