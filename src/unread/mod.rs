//! Unread / read-state engine.
//!
//! Each rail watches the threads visible to one user and, per thread, the
//! user's read cursor plus the message tail after it. Counts are computed
//! locally against the effective cursor (see [`ReadStateProjection`]), then
//! filtered to non-zero, sorted by last activity and republished as one list.

mod engine;
mod read_state;

pub use engine::{
    compare_activity, count_unread, messages_key, sort_entries, sort_threads, threads_query,
    ThreadList, UnreadContext, UnreadRail, ViewCallback, WeakRail,
};
pub use read_state::ReadStateProjection;
