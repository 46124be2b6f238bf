//! Single-threaded cooperative event loop with deadline timers.

use crate::clock::Clock;
use crate::types::Timestamp;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// A unit of work run on the loop.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a scheduled timer so it can be cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

struct TimerEntry {
    deadline: Timestamp,
    id: TimerId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Min-heap on (deadline, id): earliest first, FIFO among equal deadlines.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    /// Live timers. A heap entry without a job here was cancelled.
    jobs: HashMap<TimerId, Job>,
    next_id: u64,
}

impl TimerQueue {
    fn insert(&mut self, deadline: Timestamp, job: Job) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.heap.push(TimerEntry { deadline, id });
        self.jobs.insert(id, job);
        id
    }

    fn cancel(&mut self, id: TimerId) -> bool {
        self.jobs.remove(&id).is_some()
    }

    fn pop_due(&mut self, now: Timestamp) -> Option<Job> {
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                return None;
            }
            let id = top.id;
            self.heap.pop();
            if let Some(job) = self.jobs.remove(&id) {
                return Some(job);
            }
        }
        None
    }

    fn next_deadline(&mut self) -> Option<Timestamp> {
        while let Some(top) = self.heap.peek() {
            if self.jobs.contains_key(&top.id) {
                return Some(top.deadline);
            }
            self.heap.pop();
        }
        None
    }
}

struct LoopInner {
    clock: Arc<dyn Clock>,
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    timers: Mutex<TimerQueue>,
}

/// The execution context every component mutates its state on.
///
/// Remote callbacks never touch component state directly: they post a job
/// here, and the owner of the loop drives it with [`EventLoop::run_until_idle`]
/// (deterministic, for a `ManualClock`) or [`EventLoop::run_for`] (real time).
/// Clones share the same queue.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            inner: Arc::new(LoopInner {
                clock,
                sender,
                receiver,
                timers: Mutex::new(TimerQueue::default()),
            }),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    /// Queue a job to run on the next turn.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        // The receiver lives as long as `inner`, so this cannot disconnect.
        let _ = self.inner.sender.send(Box::new(job));
    }

    /// Run `job` once the clock reaches `deadline`.
    pub fn schedule_at(&self, deadline: Timestamp, job: impl FnOnce() + Send + 'static) -> TimerId {
        self.inner.timers.lock().insert(deadline, Box::new(job))
    }

    pub fn schedule_after(&self, delay_ms: u64, job: impl FnOnce() + Send + 'static) -> TimerId {
        let deadline = self.now().plus_millis(delay_ms);
        self.schedule_at(deadline, job)
    }

    /// Cancel a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.inner.timers.lock().cancel(id)
    }

    /// Run `tick` every `period_ms` until the handle is cancelled.
    pub fn every(&self, period_ms: u64, tick: impl Fn() + Send + Sync + 'static) -> IntervalHandle {
        let stopped = Arc::new(AtomicBool::new(false));
        arm_interval(
            Arc::downgrade(&self.inner),
            period_ms.max(1),
            Arc::new(tick),
            Arc::clone(&stopped),
        );
        IntervalHandle { stopped }
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.inner.timers.lock().next_deadline()
    }

    pub fn pending_jobs(&self) -> usize {
        self.inner.receiver.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.timers.lock().jobs.len()
    }

    /// Run queued jobs and due timers until neither remains. Returns the
    /// number of jobs run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let mut progressed = false;

            // One timer at a time: a fired job may cancel a later due timer.
            loop {
                let due = self.inner.timers.lock().pop_due(self.now());
                match due {
                    Some(job) => {
                        job();
                        ran += 1;
                        progressed = true;
                    }
                    None => break,
                }
            }

            while let Ok(job) = self.inner.receiver.try_recv() {
                job();
                ran += 1;
                progressed = true;
            }

            if !progressed {
                return ran;
            }
        }
    }

    /// Drive the loop in real time for `duration`, sleeping on the job
    /// queue between timers.
    pub fn run_for(&self, duration: Duration) -> usize {
        let end = Instant::now() + duration;
        let mut ran = 0;
        loop {
            ran += self.run_until_idle();

            let now = Instant::now();
            if now >= end {
                return ran;
            }

            let mut wait = end - now;
            if let Some(deadline) = self.next_deadline() {
                let until = deadline.millis_since(self.now()).max(0) as u64;
                wait = wait.min(Duration::from_millis(until));
            }

            match self.inner.receiver.recv_timeout(wait) {
                Ok(job) => {
                    job();
                    ran += 1;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return ran,
            }
        }
    }
}

fn arm_interval(
    inner: Weak<LoopInner>,
    period_ms: u64,
    tick: Arc<dyn Fn() + Send + Sync>,
    stopped: Arc<AtomicBool>,
) {
    let Some(strong) = inner.upgrade() else {
        return;
    };
    let deadline = strong.clock.now().plus_millis(period_ms);
    strong.timers.lock().insert(
        deadline,
        Box::new(move || {
            if stopped.load(Ordering::SeqCst) {
                return;
            }
            tick();
            if !stopped.load(Ordering::SeqCst) {
                arm_interval(inner, period_ms, tick, stopped);
            }
        }),
    );
}

/// Stops a repeating timer created by [`EventLoop::every`].
#[derive(Debug)]
pub struct IntervalHandle {
    stopped: Arc<AtomicBool>,
}

impl IntervalHandle {
    pub fn cancel(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
