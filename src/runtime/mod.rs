//! Execution context: the cooperative event loop, timers and debouncing.
//!
//! All component state in this crate is mutated from jobs run on one
//! [`EventLoop`]. Remote-store callbacks, fetch completions and timers are
//! all funnelled through its queue, so a burst of snapshots is processed in
//! arrival order and never concurrently.
//!
//! # Example
//!
//! ```ignore
//! let clock = ManualClock::default();
//! let lp = EventLoop::new(Arc::new(clock.clone()));
//! let debouncer = Debouncer::new(lp.clone());
//!
//! debouncer.schedule("rail", 50, || println!("recompute"));
//! clock.advance(50);
//! lp.run_until_idle();
//! ```

mod debounce;
mod executor;

pub use debounce::Debouncer;
pub use executor::{EventLoop, IntervalHandle, Job, TimerId};
