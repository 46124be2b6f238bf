//! Types for the profile cache.

use crate::types::UserId;
use std::sync::Arc;

/// How much a caller needs push updates for a profile. When the live pool
/// is full, an entry can only displace one of equal or lower priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Background,
    Normal,
    /// Currently on screen.
    Visible,
}

/// Result of [`ProfileCache::subscribe_live`](super::ProfileCache::subscribe_live).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LiveOutcome {
    /// Already had a live slot; its recency (and priority, if higher) was bumped.
    AlreadyLive,
    /// Took a free slot.
    Opened,
    /// Took the slot of the given user, who now refreshes by polling.
    Evicted(UserId),
    /// No slot could be freed; the user refreshes by polling instead.
    Demoted,
    /// The cache was disposed.
    Rejected,
}

/// Lifecycle of a cache instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    /// Constructed; serves requests but does not poll.
    Idle,
    /// Polling demoted entries.
    Running,
    Disposed,
}

/// Counters for cache behavior.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub requests: u64,
    pub batches: u64,
    pub keys_fetched: u64,
    pub fetch_failures: u64,
    pub stale_discarded: u64,
    pub live_opens: u64,
    pub evictions: u64,
    pub polls: u64,
}

impl CacheStats {
    /// Hit rate over all `get` calls (0.0–1.0), counting stale hits as hits.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.stale_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.stale_hits) as f64 / total as f64
        }
    }
}

/// Identifies a change listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Called with the users whose cached profile changed.
pub type ChangeListener = Arc<dyn Fn(&[UserId]) + Send + Sync>;
