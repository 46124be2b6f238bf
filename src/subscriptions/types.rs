//! Types shared by the subscription tree and its consumers.

use crate::error::SyncError;
use crate::remote::{Document, WatchKey};
use std::collections::HashMap;
use std::sync::Arc;

/// The latest value delivered by an inner watch.
#[derive(Clone, Debug, PartialEq)]
pub enum InnerSnapshot {
    Document(Option<Document>),
    Collection(Vec<Document>),
}

impl InnerSnapshot {
    /// The watched document, for document watches. `None` when it does not
    /// exist or this is a collection snapshot.
    pub fn document(&self) -> Option<&Document> {
        match self {
            InnerSnapshot::Document(doc) => doc.as_ref(),
            InnerSnapshot::Collection(_) => None,
        }
    }

    /// The result set, for collection watches.
    pub fn documents(&self) -> &[Document] {
        match self {
            InnerSnapshot::Collection(docs) => docs,
            InnerSnapshot::Document(_) => &[],
        }
    }
}

/// Lifecycle of one inner key's derived state.
#[derive(Clone, Debug, PartialEq)]
pub enum InnerState {
    /// Opened, no snapshot yet.
    Pending,
    Ready(InnerSnapshot),
    /// The watch errored and was closed. Retried on the next outer snapshot.
    Failed(SyncError),
}

impl InnerState {
    pub fn snapshot(&self) -> Option<&InnerSnapshot> {
        match self {
            InnerState::Ready(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

/// Read access to inner states while deriving keys.
#[derive(Clone, Copy)]
pub struct InnerView<'a> {
    states: &'a HashMap<WatchKey, InnerState>,
}

impl<'a> InnerView<'a> {
    pub fn new(states: &'a HashMap<WatchKey, InnerState>) -> Self {
        Self { states }
    }

    pub fn state(&self, key: &WatchKey) -> Option<&'a InnerState> {
        self.states.get(key)
    }

    pub fn snapshot(&self, key: &WatchKey) -> Option<&'a InnerSnapshot> {
        self.states.get(key).and_then(InnerState::snapshot)
    }
}

/// A stabilized view of the whole tree, handed to `on_update`.
#[derive(Clone, Debug, Default)]
pub struct TreeView {
    /// Outer result set, in snapshot order.
    pub members: Vec<Document>,
    /// State of every currently derived inner key.
    pub inner: HashMap<WatchKey, InnerState>,
}

impl TreeView {
    pub fn inner_view(&self) -> InnerView<'_> {
        InnerView::new(&self.inner)
    }

    pub fn state(&self, key: &WatchKey) -> Option<&InnerState> {
        self.inner.get(key)
    }

    pub fn snapshot(&self, key: &WatchKey) -> Option<&InnerSnapshot> {
        self.inner.get(key).and_then(InnerState::snapshot)
    }
}

/// Lifecycle of a tree.
#[derive(Clone, Debug, PartialEq)]
pub enum TreeStatus {
    /// Attached, outer watch has not fired yet.
    Waiting,
    Live,
    /// The outer watch failed; everything was torn down.
    Failed(SyncError),
    Detached,
}

impl TreeStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, TreeStatus::Waiting | TreeStatus::Live)
    }
}

/// Counters for a tree's lifetime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub inner_opened: u64,
    pub inner_closed: u64,
    pub inner_failed: u64,
    pub stale_discarded: u64,
    pub rebuilds: u64,
    pub updates_emitted: u64,
}

/// Derives the inner keys a member needs, given current inner states.
pub type DeriveFn = Arc<dyn Fn(&Document, &InnerView<'_>) -> Vec<WatchKey> + Send + Sync>;

/// Receives each stabilized view.
pub type UpdateFn = Arc<dyn Fn(&TreeView) + Send + Sync>;

/// Receives the terminal outer-watch error.
pub type ErrorFn = Arc<dyn Fn(&SyncError) + Send + Sync>;
