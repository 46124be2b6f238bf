//! Keyed trailing-edge debouncing on top of the event loop.

use super::executor::{EventLoop, Job, TimerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

struct PendingCall {
    token: u64,
    timer: TimerId,
    job: Job,
}

#[derive(Default)]
struct DebounceState {
    pending: HashMap<String, PendingCall>,
    collapsed: u64,
    fired: u64,
}

/// Collapses bursts of `schedule` calls per key into one invocation.
///
/// Each call re-arms the key's timer and replaces its job, so the job that
/// runs is the one from the last call in the burst. Keys are independent.
#[derive(Clone)]
pub struct Debouncer {
    lp: EventLoop,
    state: Arc<Mutex<DebounceState>>,
    next_token: Arc<AtomicU64>,
}

impl Debouncer {
    pub fn new(lp: EventLoop) -> Self {
        Self {
            lp,
            state: Arc::new(Mutex::new(DebounceState::default())),
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn schedule(&self, key: impl Into<String>, delay_ms: u64, job: impl FnOnce() + Send + 'static) {
        let key = key.into();
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);

        let weak = Arc::downgrade(&self.state);
        let fire_key = key.clone();
        let timer = self.lp.schedule_after(delay_ms, move || {
            let Some(state) = weak.upgrade() else {
                return;
            };
            let job = {
                let mut state = state.lock();
                let current = state
                    .pending
                    .get(&fire_key)
                    .map_or(false, |call| call.token == token);
                if current {
                    state.fired += 1;
                    state.pending.remove(&fire_key).map(|call| call.job)
                } else {
                    None
                }
            };
            if let Some(job) = job {
                job();
            }
        });

        let previous = {
            let mut state = self.state.lock();
            let previous = state.pending.insert(
                key.clone(),
                PendingCall {
                    token,
                    timer,
                    job: Box::new(job),
                },
            );
            if previous.is_some() {
                state.collapsed += 1;
            }
            previous
        };

        if let Some(previous) = previous {
            self.lp.cancel(previous.timer);
            trace!(key = %key, "debounce collapsed");
        }
    }

    /// Drop a pending call without running it.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.state.lock().pending.remove(key);
        match removed {
            Some(call) => {
                self.lp.cancel(call.timer);
                true
            }
            None => false,
        }
    }

    /// Run a pending call now instead of waiting for its window.
    pub fn flush(&self, key: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.pending.remove(key);
            if removed.is_some() {
                state.fired += 1;
            }
            removed
        };
        match removed {
            Some(call) => {
                self.lp.cancel(call.timer);
                (call.job)();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.state.lock().pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Calls absorbed by a later call for the same key.
    pub fn collapsed_count(&self) -> u64 {
        self.state.lock().collapsed
    }

    pub fn fired_count(&self) -> u64 {
        self.state.lock().fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (ManualClock, EventLoop, Debouncer) {
        let clock = ManualClock::default();
        let lp = EventLoop::new(Arc::new(clock.clone()));
        let debouncer = Debouncer::new(lp.clone());
        (clock, lp, debouncer)
    }

    #[test]
    fn test_burst_runs_once_with_last_payload() {
        let (clock, lp, debouncer) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = Arc::clone(&seen);
            debouncer.schedule("rail", 50, move || seen.lock().push(i));
            clock.advance(10);
            lp.run_until_idle();
        }
        assert!(seen.lock().is_empty());

        clock.advance(50);
        lp.run_until_idle();
        assert_eq!(*seen.lock(), vec![9]);
        assert_eq!(debouncer.collapsed_count(), 9);
        assert_eq!(debouncer.fired_count(), 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let (clock, lp, debouncer) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for key in ["a", "b"] {
            let seen = Arc::clone(&seen);
            debouncer.schedule(key, 20, move || seen.lock().push(key));
        }
        clock.advance(20);
        lp.run_until_idle();

        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn test_calls_outside_window_run_separately() {
        let (clock, lp, debouncer) = setup();
        let count = Arc::new(Mutex::new(0));

        for _ in 0..2 {
            let count = Arc::clone(&count);
            debouncer.schedule("k", 30, move || *count.lock() += 1);
            clock.advance(30);
            lp.run_until_idle();
        }
        assert_eq!(*count.lock(), 2);
    }

    #[test]
    fn test_cancel_and_flush() {
        let (clock, lp, debouncer) = setup();
        let count = Arc::new(Mutex::new(0));

        let c = Arc::clone(&count);
        debouncer.schedule("k", 30, move || *c.lock() += 1);
        assert!(debouncer.cancel("k"));
        assert!(!debouncer.is_pending("k"));

        let c = Arc::clone(&count);
        debouncer.schedule("k", 30, move || *c.lock() += 10);
        assert!(debouncer.flush("k"));
        assert_eq!(*count.lock(), 10);

        clock.advance(30);
        lp.run_until_idle();
        assert_eq!(*count.lock(), 10);
    }
}
