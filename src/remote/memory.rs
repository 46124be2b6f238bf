//! In-process [`RemoteStore`] with live notification and fault injection.

use super::types::{parent_of, Document, Query, Teardown};
use super::{Completion, RemoteStore, SnapshotSink};
use crate::error::{Result, SyncError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tracing::trace;

enum Watcher {
    Collection {
        query: Query,
        sink: SnapshotSink<Vec<Document>>,
    },
    Document {
        path: String,
        sink: SnapshotSink<Option<Document>>,
    },
}

impl Watcher {
    fn path(&self) -> &str {
        match self {
            Watcher::Collection { query, .. } => &query.collection,
            Watcher::Document { path, .. } => path,
        }
    }
}

/// A snapshot ready to hand to a sink once the lock is released.
enum Delivery {
    Collection(SnapshotSink<Vec<Document>>, Result<Vec<Document>>),
    Document(SnapshotSink<Option<Document>>, Result<Option<Document>>),
}

impl Delivery {
    fn deliver(self) {
        match self {
            Delivery::Collection(sink, snapshot) => sink(snapshot),
            Delivery::Document(sink, snapshot) => sink(snapshot),
        }
    }
}

#[derive(Default)]
struct MemoryState {
    docs: BTreeMap<String, Value>,
    watchers: HashMap<u64, Watcher>,
    next_watcher: u64,

    failing_watch_prefixes: Vec<String>,
    failing_fetches: usize,
    fail_writes: bool,
    hold_completions: bool,
    held: Vec<Box<dyn FnOnce() + Send>>,

    fetch_log: Vec<Vec<String>>,
    writes: usize,
    watches_opened: usize,
}

impl MemoryState {
    fn collection_snapshot(&self, query: &Query) -> Vec<Document> {
        let prefix = format!("{}/", query.collection);
        self.docs
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .map(|(path, data)| Document::new(path.clone(), data.clone()))
            .filter(|doc| query.matches(doc))
            .collect()
    }

    fn document_snapshot(&self, path: &str) -> Option<Document> {
        self.docs
            .get(path)
            .map(|data| Document::new(path.to_string(), data.clone()))
    }

    fn watch_fails(&self, path: &str) -> bool {
        self.failing_watch_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Snapshots owed to watchers after `path` changed from `before`.
    fn deliveries_for(&self, path: &str, before: Option<&Value>) -> Vec<Delivery> {
        let collection = parent_of(path);
        let old = before.map(|data| Document::new(path.to_string(), data.clone()));
        let new = self.document_snapshot(path);

        let mut out = Vec::new();
        for watcher in self.watchers.values() {
            match watcher {
                Watcher::Document { path: watched, sink } if watched == path => {
                    out.push(Delivery::Document(Arc::clone(sink), Ok(new.clone())));
                }
                Watcher::Collection { query, sink } if query.collection == collection => {
                    let was_member = old.as_ref().map_or(false, |d| query.matches(d));
                    let is_member = new.as_ref().map_or(false, |d| query.matches(d));
                    if was_member || is_member {
                        out.push(Delivery::Collection(
                            Arc::clone(sink),
                            Ok(self.collection_snapshot(query)),
                        ));
                    }
                }
                _ => {}
            }
        }
        out
    }
}

/// An in-memory document store.
///
/// Writes notify matching watchers synchronously. Failures and latency can
/// be injected per operation kind, which is what the test suites use to
/// exercise error and stale-response paths.
#[derive(Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // --- Data ---

    /// Replace a document and notify watchers.
    pub fn set_document(&self, path: &str, data: Value) {
        let deliveries = {
            let mut state = self.state.lock();
            let before = state.docs.insert(path.to_string(), data);
            state.deliveries_for(path, before.as_ref())
        };
        deliveries.into_iter().for_each(Delivery::deliver);
    }

    /// Merge top-level fields of `patch` into a document and notify watchers.
    pub fn merge_document(&self, path: &str, patch: Value) {
        apply_merge(&self.state, path, patch);
    }

    pub fn delete_document(&self, path: &str) {
        let deliveries = {
            let mut state = self.state.lock();
            match state.docs.remove(path) {
                Some(before) => state.deliveries_for(path, Some(&before)),
                None => Vec::new(),
            }
        };
        deliveries.into_iter().for_each(Delivery::deliver);
    }

    pub fn document(&self, path: &str) -> Option<Value> {
        self.state.lock().docs.get(path).cloned()
    }

    // --- Fault injection ---

    /// New watches under `prefix` fail immediately.
    pub fn fail_watches_under(&self, prefix: &str) {
        self.state.lock().failing_watch_prefixes.push(prefix.to_string());
    }

    /// Error out every open watch under `prefix`, ending it.
    pub fn break_watches_under(&self, prefix: &str, reason: &str) {
        let deliveries: Vec<Delivery> = {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state
                .watchers
                .iter()
                .filter(|(_, w)| w.path().starts_with(prefix))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.watchers.remove(&id))
                .map(|watcher| {
                    let err = SyncError::WatchFailed {
                        key: watcher.path().to_string(),
                        reason: reason.to_string(),
                    };
                    match watcher {
                        Watcher::Collection { sink, .. } => Delivery::Collection(sink, Err(err)),
                        Watcher::Document { sink, .. } => Delivery::Document(sink, Err(err)),
                    }
                })
                .collect()
        };
        deliveries.into_iter().for_each(Delivery::deliver);
    }

    /// The next `count` calls to `fetch_many` fail.
    pub fn fail_next_fetches(&self, count: usize) {
        self.state.lock().failing_fetches = count;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_watch_prefixes.clear();
        state.failing_fetches = 0;
        state.fail_writes = false;
    }

    /// Hold fetch and write completions until [`MemoryStore::release_held`].
    pub fn set_hold_completions(&self, hold: bool) {
        self.state.lock().hold_completions = hold;
    }

    /// Deliver held completions in call order. Returns how many ran.
    pub fn release_held(&self) -> usize {
        let held = std::mem::take(&mut self.state.lock().held);
        let count = held.len();
        for completion in held {
            completion();
        }
        count
    }

    // --- Introspection ---

    pub fn open_watch_count(&self) -> usize {
        self.state.lock().watchers.len()
    }

    pub fn open_watches_under(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .watchers
            .values()
            .filter(|w| w.path().starts_with(prefix))
            .count()
    }

    pub fn watches_opened(&self) -> usize {
        self.state.lock().watches_opened
    }

    /// Paths requested by every `fetch_many` call, in order.
    pub fn fetch_log(&self) -> Vec<Vec<String>> {
        self.state.lock().fetch_log.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().fetch_log.len()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    fn register(&self, watcher: Watcher) -> Teardown {
        let id = {
            let mut state = self.state.lock();
            state.next_watcher += 1;
            state.watches_opened += 1;
            let id = state.next_watcher;
            state.watchers.insert(id, watcher);
            id
        };
        let weak: Weak<Mutex<MemoryState>> = Arc::downgrade(&self.state);
        Teardown::new(move || {
            if let Some(state) = weak.upgrade() {
                state.lock().watchers.remove(&id);
                trace!(watcher = id, "memory watch closed");
            }
        })
    }
}

fn apply_merge(state: &Arc<Mutex<MemoryState>>, path: &str, patch: Value) {
    let deliveries = {
        let mut state = state.lock();
        let before = state.docs.get(path).cloned();
        let merged = match (before.clone(), patch) {
            (Some(Value::Object(mut base)), Value::Object(fields)) => {
                base.extend(fields);
                Value::Object(base)
            }
            (_, patch) => patch,
        };
        state.docs.insert(path.to_string(), merged);
        state.deliveries_for(path, before.as_ref())
    };
    deliveries.into_iter().for_each(Delivery::deliver);
}

impl RemoteStore for MemoryStore {
    fn watch_collection(&self, query: &Query, sink: SnapshotSink<Vec<Document>>) -> Teardown {
        let initial = {
            let state = self.state.lock();
            if state.watch_fails(&query.collection) {
                Err(SyncError::WatchFailed {
                    key: query.to_string(),
                    reason: "injected failure".into(),
                })
            } else {
                Ok(state.collection_snapshot(query))
            }
        };

        match initial {
            Ok(snapshot) => {
                let teardown = self.register(Watcher::Collection {
                    query: query.clone(),
                    sink: Arc::clone(&sink),
                });
                sink(Ok(snapshot));
                teardown
            }
            Err(err) => {
                sink(Err(err));
                Teardown::noop()
            }
        }
    }

    fn watch_document(&self, path: &str, sink: SnapshotSink<Option<Document>>) -> Teardown {
        let initial = {
            let state = self.state.lock();
            if state.watch_fails(path) {
                Err(SyncError::WatchFailed {
                    key: path.to_string(),
                    reason: "injected failure".into(),
                })
            } else {
                Ok(state.document_snapshot(path))
            }
        };

        match initial {
            Ok(snapshot) => {
                let teardown = self.register(Watcher::Document {
                    path: path.to_string(),
                    sink: Arc::clone(&sink),
                });
                sink(Ok(snapshot));
                teardown
            }
            Err(err) => {
                sink(Err(err));
                Teardown::noop()
            }
        }
    }

    fn fetch_many(&self, paths: Vec<String>, done: Completion<HashMap<String, Document>>) {
        let mut state = self.state.lock();
        state.fetch_log.push(paths.clone());

        let result: Result<HashMap<String, Document>> = if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            Err(SyncError::FetchFailed("injected failure".into()))
        } else {
            Ok(paths
                .iter()
                .filter_map(|path| state.document_snapshot(path).map(|doc| (path.clone(), doc)))
                .collect())
        };

        if state.hold_completions {
            state.held.push(Box::new(move || done(result)));
        } else {
            drop(state);
            done(result);
        }
    }

    fn write_document(&self, path: &str, patch: Value, done: Completion<()>) {
        let mut state = self.state.lock();
        state.writes += 1;

        if state.fail_writes {
            drop(state);
            done(Err(SyncError::WriteFailed {
                path: path.to_string(),
                reason: "injected failure".into(),
            }));
            return;
        }

        let shared = Arc::clone(&self.state);
        let path = path.to_string();
        let apply = move || {
            apply_merge(&shared, &path, patch);
            done(Ok(()));
        };

        if state.hold_completions {
            state.held.push(Box::new(apply));
        } else {
            drop(state);
            apply();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::FilterOp;
    use serde_json::json;

    fn collect<T: Send + 'static>() -> (Arc<Mutex<Vec<Result<T>>>>, SnapshotSink<T>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: SnapshotSink<T> = Arc::new(move |snapshot| sink_seen.lock().push(snapshot));
        (seen, sink)
    }

    #[test]
    fn test_collection_watch_sees_matching_changes() {
        let store = MemoryStore::new();
        store.set_document("threads/t1", json!({"participants": ["a", "b"]}));

        let query = Query::collection("threads").filter("participants", FilterOp::ArrayContains, "a");
        let (seen, sink) = collect::<Vec<Document>>();
        let _teardown = store.watch_collection(&query, sink);

        store.set_document("threads/t2", json!({"participants": ["a"]}));
        // Not a member before or after: no snapshot.
        store.set_document("threads/t3", json!({"participants": ["c"]}));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_teardown_stops_notifications() {
        let store = MemoryStore::new();
        let (seen, sink) = collect::<Option<Document>>();
        let mut teardown = store.watch_document("users/u1", sink);
        assert_eq!(store.open_watch_count(), 1);

        teardown.run();
        assert_eq!(store.open_watch_count(), 0);
        store.set_document("users/u1", json!({"displayName": "U"}));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_merge_write_keeps_other_fields() {
        let store = MemoryStore::new();
        store.set_document("threads/t1/reads/a", json!({"userId": "a", "lastReadAt": 1}));

        let result = Arc::new(Mutex::new(None));
        let r = Arc::clone(&result);
        store.write_document(
            "threads/t1/reads/a",
            json!({"lastReadAt": 5}),
            Box::new(move |res| *r.lock() = Some(res)),
        );

        assert_eq!(*result.lock(), Some(Ok(())));
        assert_eq!(
            store.document("threads/t1/reads/a"),
            Some(json!({"userId": "a", "lastReadAt": 5}))
        );
    }

    #[test]
    fn test_held_completions() {
        let store = MemoryStore::new();
        store.set_document("users/u1", json!({"displayName": "U"}));
        store.set_hold_completions(true);

        let result = Arc::new(Mutex::new(None));
        let r = Arc::clone(&result);
        store.fetch_many(
            vec!["users/u1".into(), "users/missing".into()],
            Box::new(move |res| *r.lock() = Some(res)),
        );
        assert!(result.lock().is_none());

        assert_eq!(store.release_held(), 1);
        let fetched = result.lock().take().unwrap().unwrap();
        assert_eq!(fetched.len(), 1);
        assert!(fetched.contains_key("users/u1"));
    }

    #[test]
    fn test_injected_watch_failure() {
        let store = MemoryStore::new();
        store.fail_watches_under("threads/t1/");
        let (seen, sink) = collect::<Vec<Document>>();
        let _teardown = store.watch_collection(&Query::collection("threads/t1/messages"), sink);

        assert!(seen.lock()[0].is_err());
        assert_eq!(store.open_watch_count(), 0);
    }
}
