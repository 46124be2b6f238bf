//! The remote document store collaborator.
//!
//! The sync layer only ever talks to a store through [`RemoteStore`]: two
//! live primitives (watch a collection query, watch a document) and two
//! one-shot primitives (batch read, merge write). Callbacks may arrive on any
//! thread; consumers in this crate re-post them onto their
//! [`EventLoop`](crate::runtime::EventLoop) before touching state.

mod memory;
mod types;

pub use memory::MemoryStore;
pub use types::{parent_of, Document, Filter, FilterOp, FilterValue, Query, Teardown, WatchKey};

use crate::error::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Receives every snapshot of a live watch. An `Err` ends the watch.
pub type SnapshotSink<T> = Arc<dyn Fn(Result<T>) + Send + Sync>;

/// Receives the outcome of a one-shot operation.
pub type Completion<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// A push-capable document store.
///
/// Implementations must deliver an initial snapshot for every watch and
/// must never call a sink after its [`Teardown`] has run.
pub trait RemoteStore: Send + Sync {
    /// Watch the documents of `query`. Every snapshot is the full result set.
    fn watch_collection(&self, query: &Query, sink: SnapshotSink<Vec<Document>>) -> Teardown;

    /// Watch a single document; `None` while it does not exist.
    fn watch_document(&self, path: &str, sink: SnapshotSink<Option<Document>>) -> Teardown;

    /// Read many documents at once. Missing paths are absent from the map.
    fn fetch_many(&self, paths: Vec<String>, done: Completion<HashMap<String, Document>>);

    /// Merge `patch` into the document at `path`, creating it if needed.
    fn write_document(&self, path: &str, patch: serde_json::Value, done: Completion<()>);
}
