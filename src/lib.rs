//! # Livesync
//!
//! Client-side sync layer that turns nested live queries against a remote
//! document store into consistent, derived views.
//!
//! ## Core Concepts
//!
//! - **Subscription trees**: one outer collection watch plus inner watches
//!   derived per member, rebuilt without leaks or duplicates
//! - **Unread rails**: per-thread unread counts from read cursors and message
//!   tails, with optimistic "mark read"
//! - **Profile cache**: TTL cache with batched fetches and a bounded pool of
//!   live watches
//! - **Event loop**: every callback runs on one cooperative loop; bursts are
//!   debounced per key
//!
//! ## Example
//!
//! ```ignore
//! use livesync::{EventLoop, MemoryStore, SyncClient, SyncConfig, SystemClock, UserId, ViewEvent};
//! use std::sync::Arc;
//!
//! let lp = EventLoop::new(Arc::new(SystemClock));
//! let client = SyncClient::new(MemoryStore::new(), lp.clone(), SyncConfig::default())?;
//!
//! let me = UserId::from("alice");
//! let _rail = client.subscribe_unread_rail(&me, |event| {
//!     if let ViewEvent::Updated(entries) = event {
//!         println!("{} unread threads", entries.len());
//!     }
//! })?;
//!
//! lp.run_for(std::time::Duration::from_secs(1));
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod profiles;
pub mod remote;
pub mod runtime;
pub mod subscriptions;
pub mod sync;
pub mod types;
pub mod unread;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CollectionPaths, ProfileCacheConfig, SyncConfig, UnreadConfig};
pub use error::{Result, SyncError};
pub use profiles::{CacheStats, CacheStatus, ListenerId, LiveOutcome, Priority, ProfileCache};
pub use remote::{
    Document, FilterOp, FilterValue, MemoryStore, Query, RemoteStore, Teardown, WatchKey,
};
pub use runtime::{Debouncer, EventLoop, IntervalHandle, TimerId};
pub use subscriptions::{
    InnerSnapshot, InnerState, InnerView, SubscriptionTree, TreeHandle, TreeStats, TreeStatus,
    TreeView,
};
pub use sync::{PendingResult, RailHandle, SyncClient, ThreadListHandle};
pub use types::*;
pub use unread::{ReadStateProjection, ThreadList, UnreadContext, UnreadRail};
