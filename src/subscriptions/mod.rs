//! Subscription tree manager for dependent live queries.
//!
//! A tree watches one outer collection and, for every member of its result
//! set, the inner keys a derive function computes from that member. On every
//! change the tree:
//! - closes inner watches no longer derived (all closes before any open)
//! - opens newly derived keys, never two watches for the same key
//! - drops snapshots from watches it already replaced
//! - emits one stabilized [`TreeView`] per loop turn
//!
//! An outer error is terminal and tears the whole tree down. An inner error
//! only degrades that key to [`InnerState::Failed`].
//!
//! # Example
//!
//! ```ignore
//! let handle = SubscriptionTree::new(store, lp.clone(), Query::collection("threads"))
//!     .derive(|thread, _| vec![WatchKey::document(format!("{}/reads/alice", thread.path))])
//!     .on_error(|err| eprintln!("thread list failed: {err}"))
//!     .attach(|view| println!("{} threads", view.members.len()));
//!
//! lp.run_until_idle();
//! handle.detach();
//! ```

mod manager;
mod types;

pub use manager::{SubscriptionTree, TreeHandle};
pub use types::{
    DeriveFn, ErrorFn, InnerSnapshot, InnerState, InnerView, TreeStats, TreeStatus, TreeView,
    UpdateFn,
};
