//! Local projection of read cursors.
//!
//! A "mark read" lands here before the remote write confirms. The effective
//! cursor is the later of the optimistic local value and the last value the
//! remote store reported, so a read made on another device is never
//! regressed by a slower local write.

use crate::types::{ThreadId, Timestamp, UserId};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct CursorState {
    remote: Option<Timestamp>,
    optimistic: Option<Timestamp>,
}

impl CursorState {
    fn effective(&self) -> Option<Timestamp> {
        self.remote.max(self.optimistic)
    }
}

/// Shared by every rail of a client; keyed by (thread, user).
#[derive(Default)]
pub struct ReadStateProjection {
    cursors: Mutex<HashMap<(ThreadId, UserId), CursorState>>,
}

impl ReadStateProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the cursor the remote store reports. Drops the optimistic
    /// override once the remote value has caught up with it.
    pub fn observe_remote(&self, thread: &ThreadId, user: &UserId, remote: Option<Timestamp>) {
        let mut cursors = self.cursors.lock();
        let key = (thread.clone(), user.clone());
        let state = cursors.entry(key).or_default();
        state.remote = remote;
        if let (Some(remote), Some(optimistic)) = (remote, state.optimistic) {
            if remote >= optimistic {
                state.optimistic = None;
            }
        }
    }

    /// Optimistically mark `thread` read at `now`. Returns the cursor value
    /// to write remotely, never earlier than the current effective cursor.
    pub fn mark_local(&self, thread: &ThreadId, user: &UserId, now: Timestamp) -> Timestamp {
        let mut cursors = self.cursors.lock();
        let state = cursors.entry((thread.clone(), user.clone())).or_default();
        let value = state.effective().map_or(now, |current| current.max(now));
        state.optimistic = Some(value);
        value
    }

    /// Effective cursor from stored state alone.
    pub fn effective(&self, thread: &ThreadId, user: &UserId) -> Option<Timestamp> {
        self.cursors
            .lock()
            .get(&(thread.clone(), user.clone()))
            .and_then(CursorState::effective)
    }

    /// Effective cursor given a remote value that may be newer than the one
    /// last observed.
    pub fn effective_with(
        &self,
        thread: &ThreadId,
        user: &UserId,
        remote: Option<Timestamp>,
    ) -> Option<Timestamp> {
        let optimistic = self
            .cursors
            .lock()
            .get(&(thread.clone(), user.clone()))
            .and_then(|state| state.optimistic);
        remote.max(optimistic)
    }

    pub fn has_pending(&self, thread: &ThreadId, user: &UserId) -> bool {
        self.cursors
            .lock()
            .get(&(thread.clone(), user.clone()))
            .map_or(false, |state| state.optimistic.is_some())
    }

    /// Forget cursors for threads no longer visible to `user`.
    pub fn retain_threads(&self, user: &UserId, keep: impl Fn(&ThreadId) -> bool) {
        self.cursors
            .lock()
            .retain(|(thread, owner), _| owner != user || keep(thread));
    }

    pub fn len(&self) -> usize {
        self.cursors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
