//! Presentation-facing client: wires the store, loop, profile cache and
//! read projection together and hands out view subscriptions.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::profiles::ProfileCache;
use crate::remote::RemoteStore;
use crate::runtime::{Debouncer, EventLoop};
use crate::subscriptions::TreeStatus;
use crate::types::{ProfileCacheEntry, ReadCursor, Thread, ThreadId, UnreadEntry, UserId, ViewEvent};
use crate::unread::{ReadStateProjection, ThreadList, UnreadContext, UnreadRail, WeakRail};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of an asynchronous operation, delivered once from the loop.
pub struct PendingResult<T> {
    rx: Receiver<Result<T>>,
}

impl<T> PendingResult<T> {
    fn channel() -> (crossbeam_channel::Sender<Result<T>>, Self) {
        let (tx, rx) = bounded(1);
        (tx, Self { rx })
    }

    fn ready(value: Result<T>) -> Self {
        let (tx, pending) = Self::channel();
        // Capacity 1 and a fresh channel: cannot fail.
        let _ = tx.send(value);
        pending
    }

    /// The outcome if it has arrived. Returns it at most once.
    pub fn try_take(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(SyncError::Remote(
                "operation dropped before completing".into(),
            ))),
        }
    }

    /// Block until the outcome arrives. Only useful while another thread
    /// drives the loop.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(SyncError::Remote("timed out".into())),
            Err(RecvTimeoutError::Disconnected) => Err(SyncError::Remote(
                "operation dropped before completing".into(),
            )),
        }
    }
}

/// Owner of an unread rail subscription. Dropping it detaches.
pub struct RailHandle {
    rail: UnreadRail,
}

impl RailHandle {
    pub fn detach(&self) {
        self.rail.detach();
    }

    pub fn entries(&self) -> Option<Vec<UnreadEntry>> {
        self.rail.entries()
    }

    pub fn status(&self) -> TreeStatus {
        self.rail.status()
    }

    pub fn rail(&self) -> &UnreadRail {
        &self.rail
    }
}

impl Drop for RailHandle {
    fn drop(&mut self) {
        self.rail.detach();
    }
}

/// Owner of a thread list subscription. Dropping it detaches.
pub struct ThreadListHandle {
    list: ThreadList,
}

impl ThreadListHandle {
    pub fn detach(&self) {
        self.list.detach();
    }

    pub fn threads(&self) -> Option<Vec<Thread>> {
        self.list.threads()
    }

    pub fn status(&self) -> TreeStatus {
        self.list.status()
    }
}

impl Drop for ThreadListHandle {
    fn drop(&mut self) {
        self.list.detach();
    }
}

/// Entry point for the presentation layer.
///
/// All callbacks run on the client's [`EventLoop`]; nothing is delivered
/// until the loop is driven.
pub struct SyncClient {
    ctx: UnreadContext,
    config: SyncConfig,
    rails: Mutex<Vec<WeakRail>>,
    shut_down: AtomicBool,
}

impl SyncClient {
    /// Validate `config`, create the profile cache and start its poller.
    pub fn new(store: Arc<dyn RemoteStore>, lp: EventLoop, config: SyncConfig) -> Result<Self> {
        config.validate()?;

        let profiles = ProfileCache::new(
            Arc::clone(&store),
            lp.clone(),
            config.profiles.clone(),
            config.paths.clone(),
        );
        profiles.init()?;

        info!(
            max_live = config.profiles.max_live,
            ttl_ms = config.profiles.ttl_ms,
            "sync client started"
        );

        Ok(Self {
            ctx: UnreadContext {
                store,
                debouncer: Debouncer::new(lp.clone()),
                lp,
                projection: Arc::new(ReadStateProjection::new()),
                profiles,
                paths: config.paths.clone(),
                config: config.unread.clone(),
            },
            config,
            rails: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(SyncError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Sorted threads with unread messages for `user`.
    ///
    /// Watch failures arrive as [`ViewEvent::Failed`]; this only errors on a
    /// client that was shut down.
    pub fn subscribe_unread_rail(
        &self,
        user: &UserId,
        on_update: impl Fn(ViewEvent<UnreadEntry>) + Send + Sync + 'static,
    ) -> Result<RailHandle> {
        self.check_open()?;
        let rail = UnreadRail::attach(self.ctx.clone(), user.clone(), on_update);

        let mut rails = self.rails.lock();
        rails.retain(|weak| weak.upgrade().map_or(false, |r| !r.is_detached()));
        rails.push(rail.downgrade());
        Ok(RailHandle { rail })
    }

    /// Every non-hidden thread visible to `user`, regardless of unread state.
    pub fn subscribe_all_threads(
        &self,
        user: &UserId,
        on_update: impl Fn(ViewEvent<Thread>) + Send + Sync + 'static,
    ) -> Result<ThreadListHandle> {
        self.check_open()?;
        let list = ThreadList::attach(&self.ctx, user.clone(), on_update);
        Ok(ThreadListHandle { list })
    }

    pub fn get_profile(&self, user: &UserId) -> Option<ProfileCacheEntry> {
        self.ctx.profiles.get(user)
    }

    pub fn request_profile(&self, user: &UserId) {
        self.ctx.profiles.request(user);
    }

    /// Mark `thread` read for `user` now.
    ///
    /// The local projection moves first, so rails stop counting the thread
    /// at their next recompute. A failed write is reported through the
    /// result and leaves the local state in place.
    pub fn mark_read(&self, thread: &ThreadId, user: &UserId) -> PendingResult<()> {
        if let Err(err) = self.check_open() {
            return PendingResult::ready(Err(err));
        }

        let last_read_at = self.ctx.projection.mark_local(thread, user, self.ctx.lp.now());
        self.invalidate_rails(user);

        let cursor = ReadCursor {
            thread_id: thread.clone(),
            user_id: user.clone(),
            last_read_at,
        };
        let path = self.ctx.paths.cursor(thread, user);
        debug!(path = %path, at = ?last_read_at, "marking thread read");

        let (tx, pending) = PendingResult::channel();
        let lp = self.ctx.lp.clone();
        let write_path = path.clone();
        self.ctx.store.write_document(
            &write_path,
            cursor.to_patch(),
            Box::new(move |result| {
                lp.spawn(move || {
                    if let Err(err) = &result {
                        warn!(path = %path, error = %err, "mark read failed, keeping local state");
                    }
                    let _ = tx.send(result);
                });
            }),
        );
        pending
    }

    fn invalidate_rails(&self, user: &UserId) {
        let live: Vec<UnreadRail> = {
            let mut rails = self.rails.lock();
            rails.retain(|weak| weak.upgrade().map_or(false, |r| !r.is_detached()));
            rails.iter().filter_map(WeakRail::upgrade).collect()
        };
        for rail in live.iter().filter(|rail| rail.user() == user) {
            rail.invalidate();
        }
    }

    /// Detach every rail and dispose the profile cache. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let rails: Vec<UnreadRail> = self
            .rails
            .lock()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for rail in &rails {
            rail.detach();
        }
        self.ctx.profiles.dispose();
        info!("sync client shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn profiles(&self) -> &ProfileCache {
        &self.ctx.profiles
    }

    pub fn projection(&self) -> &ReadStateProjection {
        &self.ctx.projection
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.ctx.lp
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}
