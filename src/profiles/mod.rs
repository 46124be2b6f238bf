//! Profile cache and batch loader.
//!
//! Profiles resolve in three tiers:
//! - a TTL cache that serves stale values while a refresh is in flight
//! - one-shot batch fetches, coalescing requests made within a short window
//! - a bounded pool of live watches for on-screen users, evicting the least
//!   recently accessed; evicted users fall back to periodic polling

mod cache;
mod types;

pub use cache::ProfileCache;
pub use types::{CacheStats, CacheStatus, ChangeListener, ListenerId, LiveOutcome, Priority};
