//! Unread rail and thread list views built on subscription trees.

use super::read_state::ReadStateProjection;
use crate::config::{CollectionPaths, UnreadConfig};
use crate::error::SyncError;
use crate::profiles::{ListenerId, Priority, ProfileCache};
use crate::remote::{Document, FilterOp, Query, RemoteStore, WatchKey};
use crate::runtime::{Debouncer, EventLoop};
use crate::subscriptions::{
    InnerSnapshot, InnerState, SubscriptionTree, TreeHandle, TreeStats, TreeStatus, TreeView,
};
use crate::types::{
    EnrichedDisplay, Message, ReadCursor, Thread, ThreadId, Timestamp, UnreadEntry, UserId,
    ViewEvent,
};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Receives every republished view.
pub type ViewCallback<T> = Arc<dyn Fn(ViewEvent<T>) + Send + Sync>;

static NEXT_RAIL: AtomicU64 = AtomicU64::new(1);

// --- Pure computation ---

/// Messages after `last_read` not written by `self_id`. A missing cursor
/// counts every message from someone else.
pub fn count_unread(messages: &[Message], last_read: Option<Timestamp>, self_id: &UserId) -> usize {
    messages
        .iter()
        .filter(|m| &m.author_id != self_id)
        .filter(|m| last_read.map_or(true, |cursor| m.created_at > cursor))
        .count()
}

/// Last activity descending, thread id ascending on ties.
pub fn compare_activity(a: (Timestamp, &ThreadId), b: (Timestamp, &ThreadId)) -> Ordering {
    b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1))
}

pub fn sort_entries(entries: &mut [UnreadEntry]) {
    entries.sort_by(|a, b| {
        compare_activity((a.last_activity, &a.thread_id), (b.last_activity, &b.thread_id))
    });
}

pub fn sort_threads(threads: &mut [Thread]) {
    threads.sort_by(|a, b| compare_activity((a.last_activity, &a.id), (b.last_activity, &b.id)));
}

/// Threads visible to `user`, as the outer query of both views.
pub fn threads_query(paths: &CollectionPaths, user: &UserId) -> Query {
    Query::collection(paths.threads.clone()).filter(
        "participants",
        FilterOp::ArrayContains,
        user.as_str(),
    )
}

/// Message tail after `cursor` from anyone but `user`.
pub fn messages_key(
    paths: &CollectionPaths,
    thread: &ThreadId,
    user: &UserId,
    cursor: Option<Timestamp>,
) -> WatchKey {
    let mut query = Query::collection(paths.messages(thread));
    if let Some(cursor) = cursor {
        query = query.filter("createdAt", FilterOp::Gt, cursor.0);
    }
    WatchKey::Collection(query.filter("authorId", FilterOp::Ne, user.as_str()))
}

fn is_hidden(member: &Document) -> bool {
    member.field("hidden").and_then(|v| v.as_bool()).unwrap_or(false)
}

/// `lastReadAt` from a cursor snapshot. An undecodable cursor reads as
/// "never read".
fn remote_cursor(snapshot: &InnerSnapshot, thread: &ThreadId, user: &UserId) -> Option<Timestamp> {
    let doc = snapshot.document()?;
    match ReadCursor::from_document(thread, user, doc) {
        Ok(cursor) => Some(cursor.last_read_at),
        Err(err) => {
            warn!(thread = %thread, error = %err, "ignoring undecodable read cursor");
            None
        }
    }
}

fn decode_threads(members: &[Document]) -> Vec<Thread> {
    members
        .iter()
        .filter_map(|doc| match Thread::from_document(doc) {
            Ok(thread) => Some(thread).filter(|t| !t.hidden),
            Err(err) => {
                warn!(path = %doc.path, error = %err, "skipping undecodable thread");
                None
            }
        })
        .collect()
}

/// Shared collaborators for views.
#[derive(Clone)]
pub struct UnreadContext {
    pub store: Arc<dyn RemoteStore>,
    pub lp: EventLoop,
    pub debouncer: Debouncer,
    pub projection: Arc<ReadStateProjection>,
    pub profiles: ProfileCache,
    pub paths: CollectionPaths,
    pub config: UnreadConfig,
}

// --- Unread rail ---

#[derive(Default)]
struct RailState {
    threads: Vec<Thread>,
    /// Last message-tail snapshot per thread. Filtered again by the effective
    /// cursor at recompute, so it may include already-read messages.
    messages: HashMap<ThreadId, Vec<Message>>,
    published: Option<Vec<UnreadEntry>>,
    /// Counterparts this rail holds live profile slots for.
    promoted: HashSet<UserId>,
    failed: bool,
    detached: bool,
    recomputes: u64,
}

struct RailInner {
    id: u64,
    user: UserId,
    ctx: UnreadContext,
    on_update: ViewCallback<UnreadEntry>,
    tree: Mutex<Option<TreeHandle>>,
    listener: Mutex<Option<ListenerId>>,
    state: Mutex<RailState>,
}

impl RailInner {
    fn debounce_key(&self) -> String {
        format!("rail:{}:{}", self.user, self.id)
    }

    fn on_tree(self: &Arc<Self>, view: &TreeView) {
        let paths = &self.ctx.paths;
        let threads = decode_threads(&view.members);

        for thread in &threads {
            let cursor_key = WatchKey::document(paths.cursor(&thread.id, &self.user));
            if let Some(snapshot) = view.snapshot(&cursor_key) {
                let remote = remote_cursor(snapshot, &thread.id, &self.user);
                self.ctx.projection.observe_remote(&thread.id, &self.user, remote);
            }
        }

        let removed: HashSet<ThreadId> = {
            let mut state = self.state.lock();
            if state.detached {
                return;
            }

            let mut messages = HashMap::with_capacity(threads.len());
            for thread in &threads {
                let collection = paths.messages(&thread.id);
                let inner = view.inner.iter().find_map(|(key, inner)| match key {
                    WatchKey::Collection(query) if query.collection == collection => Some(inner),
                    _ => None,
                });
                let tail = match inner {
                    Some(InnerState::Ready(snapshot)) => snapshot
                        .documents()
                        .iter()
                        .filter_map(|doc| match Message::from_document(&thread.id, doc) {
                            Ok(message) => Some(message),
                            Err(err) => {
                                warn!(path = %doc.path, error = %err, "skipping undecodable message");
                                None
                            }
                        })
                        .collect(),
                    // A narrower query is opening; the old tail still counts.
                    Some(InnerState::Pending) => state.messages.remove(&thread.id).unwrap_or_default(),
                    // No derived state: "no unread signal".
                    Some(InnerState::Failed(_)) | None => Vec::new(),
                };
                messages.insert(thread.id.clone(), tail);
            }

            let present: HashSet<&ThreadId> = threads.iter().map(|t| &t.id).collect();
            let removed = state
                .threads
                .iter()
                .filter(|t| !present.contains(&t.id))
                .map(|t| t.id.clone())
                .collect();

            state.threads = threads;
            state.messages = messages;
            removed
        };

        if !removed.is_empty() {
            self.ctx
                .projection
                .retain_threads(&self.user, |thread| !removed.contains(thread));
        }
        self.schedule_recompute();
    }

    fn on_tree_error(&self, err: &SyncError) {
        let released = {
            let mut state = self.state.lock();
            if state.detached || state.failed {
                return;
            }
            state.failed = true;
            state.published = None;
            std::mem::take(&mut state.promoted)
        };
        warn!(user = %self.user, error = %err, "unread rail failed");
        self.ctx.debouncer.cancel(&self.debounce_key());
        for user in &released {
            self.ctx.profiles.release_live(user);
        }
        (self.on_update)(ViewEvent::Failed(err.clone()));
    }

    fn schedule_recompute(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.ctx.debouncer.schedule(
            self.debounce_key(),
            self.ctx.config.recompute_debounce_ms,
            move || {
                if let Some(rail) = weak.upgrade() {
                    rail.recompute();
                }
            },
        );
    }

    fn recompute(&self) {
        let counted: Vec<(Thread, usize)> = {
            let mut state = self.state.lock();
            if state.detached || state.failed {
                return;
            }
            state.recomputes += 1;
            state
                .threads
                .iter()
                .filter_map(|thread| {
                    let last_read = self.ctx.projection.effective(&thread.id, &self.user);
                    let count = state
                        .messages
                        .get(&thread.id)
                        .map_or(0, |tail| count_unread(tail, last_read, &self.user));
                    (count > 0).then(|| (thread.clone(), count))
                })
                .collect()
        };

        // Profile lookups happen without the rail lock held.
        let mut entries: Vec<UnreadEntry> = counted
            .iter()
            .map(|(thread, count)| UnreadEntry {
                thread_id: thread.id.clone(),
                unread_count: *count,
                last_activity: thread.last_activity,
                display: self.enrich(thread),
            })
            .collect();
        sort_entries(&mut entries);

        let wanted: HashSet<UserId> = if self.ctx.config.promote_live_profiles {
            counted
                .iter()
                .filter(|(thread, _)| thread.group.is_none())
                .filter_map(|(thread, _)| thread.counterpart(&self.user).cloned())
                .collect()
        } else {
            HashSet::new()
        };

        let (publish, promote, release) = {
            let mut state = self.state.lock();
            if state.detached || state.failed {
                return;
            }
            let promote: Vec<UserId> = wanted.difference(&state.promoted).cloned().collect();
            let release: Vec<UserId> = state.promoted.difference(&wanted).cloned().collect();
            state.promoted = wanted;

            let publish = if state.published.as_ref() != Some(&entries) {
                state.published = Some(entries.clone());
                Some(entries)
            } else {
                None
            };
            (publish, promote, release)
        };

        for user in &release {
            self.ctx.profiles.release_live(user);
        }
        for user in &promote {
            let outcome = self.ctx.profiles.subscribe_live(user, Priority::Visible);
            trace!(user = %user, ?outcome, "promoted visible profile");
        }

        match publish {
            Some(entries) => {
                debug!(user = %self.user, entries = entries.len(), "republishing unread rail");
                (self.on_update)(ViewEvent::Updated(entries));
            }
            None => trace!(user = %self.user, "unread rail unchanged"),
        }
    }

    fn enrich(&self, thread: &Thread) -> EnrichedDisplay {
        let preview = thread.last_message.as_ref().map(|m| m.text.clone());
        if let Some(group) = &thread.group {
            return EnrichedDisplay {
                title: group.name.clone(),
                avatar_url: group.icon.clone(),
                preview,
                placeholder: false,
            };
        }
        // A thread with only the viewer shows the viewer.
        let other = thread.counterpart(&self.user).unwrap_or(&self.user);
        let (profile, placeholder) = self.ctx.profiles.display_or_placeholder(other);
        EnrichedDisplay {
            title: profile.display_name,
            avatar_url: profile.avatar_url,
            preview,
            placeholder,
        }
    }

    fn shows_any(&self, users: &[UserId]) -> bool {
        let state = self.state.lock();
        state.threads.iter().any(|thread| {
            thread.group.is_none()
                && thread
                    .counterpart(&self.user)
                    .map_or(false, |other| users.contains(other))
        })
    }

    fn detach(&self) {
        let released = {
            let mut state = self.state.lock();
            if state.detached {
                return;
            }
            state.detached = true;
            std::mem::take(&mut state.promoted)
        };
        if let Some(tree) = self.tree.lock().take() {
            tree.detach();
        }
        if let Some(listener) = self.listener.lock().take() {
            self.ctx.profiles.remove_listener(listener);
        }
        self.ctx.debouncer.cancel(&self.debounce_key());
        for user in &released {
            self.ctx.profiles.release_live(user);
        }
        debug!(user = %self.user, "detached unread rail");
    }
}

impl Drop for RailInner {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Live, sorted list of threads with unread messages for one user.
///
/// Clones share the rail. Dropping a clone does not detach; dropping the
/// last one does.
#[derive(Clone)]
pub struct UnreadRail {
    inner: Arc<RailInner>,
}

impl UnreadRail {
    pub fn attach(
        ctx: UnreadContext,
        user: UserId,
        on_update: impl Fn(ViewEvent<UnreadEntry>) + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(RailInner {
            id: NEXT_RAIL.fetch_add(1, AtomicOrdering::Relaxed),
            user: user.clone(),
            ctx: ctx.clone(),
            on_update: Arc::new(on_update),
            tree: Mutex::new(None),
            listener: Mutex::new(None),
            state: Mutex::new(RailState::default()),
        });

        let paths = ctx.paths.clone();
        let projection = Arc::clone(&ctx.projection);
        let derive_user = user.clone();
        let on_update_rail = Arc::downgrade(&inner);
        let on_error_rail = Arc::downgrade(&inner);
        let tree = SubscriptionTree::new(
            Arc::clone(&ctx.store),
            ctx.lp.clone(),
            threads_query(&ctx.paths, &user),
        )
        .derive(move |member, view| {
            if is_hidden(member) {
                return Vec::new();
            }
            let thread = ThreadId::new(member.id());
            let cursor_key = WatchKey::document(paths.cursor(&thread, &derive_user));
            let remote = match view.state(&cursor_key) {
                Some(InnerState::Ready(snapshot)) => remote_cursor(snapshot, &thread, &derive_user),
                // Wait for the cursor; a failed cursor contributes nothing.
                _ => return vec![cursor_key],
            };
            let cursor = projection.effective_with(&thread, &derive_user, remote);
            let messages = messages_key(&paths, &thread, &derive_user, cursor);
            vec![cursor_key, messages]
        })
        .on_error(move |err| {
            if let Some(rail) = on_error_rail.upgrade() {
                rail.on_tree_error(err);
            }
        })
        .attach(move |view| {
            if let Some(rail) = on_update_rail.upgrade() {
                rail.on_tree(view);
            }
        });
        *inner.tree.lock() = Some(tree);

        let listener_rail = Arc::downgrade(&inner);
        let listener = ctx.profiles.on_change(move |users| {
            if let Some(rail) = listener_rail.upgrade() {
                if rail.shows_any(users) {
                    rail.schedule_recompute();
                }
            }
        });
        *inner.listener.lock() = Some(listener);

        debug!(user = %user, "attached unread rail");
        Self { inner }
    }

    pub fn user(&self) -> &UserId {
        &self.inner.user
    }

    /// Re-derive inner keys and recompute, after the local read projection
    /// changed.
    pub fn invalidate(&self) {
        if let Some(tree) = self.inner.tree.lock().as_ref() {
            tree.refresh();
        }
        self.inner.schedule_recompute();
    }

    /// Idempotent. Releases live profile slots this rail promoted.
    pub fn detach(&self) {
        self.inner.detach();
    }

    pub fn is_detached(&self) -> bool {
        self.inner.state.lock().detached
    }

    /// The last published list, if any.
    pub fn entries(&self) -> Option<Vec<UnreadEntry>> {
        self.inner.state.lock().published.clone()
    }

    pub fn status(&self) -> TreeStatus {
        match self.inner.tree.lock().as_ref() {
            Some(tree) => tree.status(),
            None => TreeStatus::Detached,
        }
    }

    pub fn open_inner_count(&self) -> usize {
        self.inner
            .tree
            .lock()
            .as_ref()
            .map_or(0, |tree| tree.open_inner_count())
    }

    pub fn tree_stats(&self) -> TreeStats {
        self.inner
            .tree
            .lock()
            .as_ref()
            .map(|tree| tree.stats())
            .unwrap_or_default()
    }

    pub fn recompute_count(&self) -> u64 {
        self.inner.state.lock().recomputes
    }

    pub fn downgrade(&self) -> WeakRail {
        WeakRail(Arc::downgrade(&self.inner))
    }
}

/// Non-owning reference to a rail.
#[derive(Clone)]
pub struct WeakRail(Weak<RailInner>);

impl WeakRail {
    pub fn upgrade(&self) -> Option<UnreadRail> {
        self.0.upgrade().map(|inner| UnreadRail { inner })
    }
}

// --- Thread list ---

struct ListInner {
    user: UserId,
    on_update: ViewCallback<Thread>,
    tree: Mutex<Option<TreeHandle>>,
    published: Mutex<Option<Vec<Thread>>>,
}

impl ListInner {
    fn on_tree(&self, view: &TreeView) {
        let mut threads = decode_threads(&view.members);
        sort_threads(&mut threads);
        {
            let mut published = self.published.lock();
            if published.as_ref() == Some(&threads) {
                return;
            }
            *published = Some(threads.clone());
        }
        (self.on_update)(ViewEvent::Updated(threads));
    }
}

/// Every non-hidden thread visible to a user, sorted like the rail.
#[derive(Clone)]
pub struct ThreadList {
    inner: Arc<ListInner>,
}

impl ThreadList {
    pub fn attach(
        ctx: &UnreadContext,
        user: UserId,
        on_update: impl Fn(ViewEvent<Thread>) + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(ListInner {
            user: user.clone(),
            on_update: Arc::new(on_update),
            tree: Mutex::new(None),
            published: Mutex::new(None),
        });

        let on_update_list = Arc::downgrade(&inner);
        let on_error_list = Arc::downgrade(&inner);
        let tree = SubscriptionTree::new(
            Arc::clone(&ctx.store),
            ctx.lp.clone(),
            threads_query(&ctx.paths, &user),
        )
        .on_error(move |err| {
            if let Some(list) = on_error_list.upgrade() {
                warn!(user = %list.user, error = %err, "thread list failed");
                *list.published.lock() = None;
                (list.on_update)(ViewEvent::Failed(err.clone()));
            }
        })
        .attach(move |view| {
            if let Some(list) = on_update_list.upgrade() {
                list.on_tree(view);
            }
        });
        *inner.tree.lock() = Some(tree);
        Self { inner }
    }

    pub fn user(&self) -> &UserId {
        &self.inner.user
    }

    pub fn detach(&self) {
        if let Some(tree) = self.inner.tree.lock().take() {
            tree.detach();
        }
    }

    pub fn threads(&self) -> Option<Vec<Thread>> {
        self.inner.published.lock().clone()
    }

    pub fn status(&self) -> TreeStatus {
        match self.inner.tree.lock().as_ref() {
            Some(tree) => tree.status(),
            None => TreeStatus::Detached,
        }
    }
}
