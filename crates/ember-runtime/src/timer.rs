//! Hashed timing wheel for idle expiry.
//!
//! Each timer lands in slot `due % slots`. A tick fires the due timers of
//! one slot, so inserting and cancelling are O(1) and a timer longer than a
//! revolution simply waits in its slot for later passes.
//!
//! The global wheel ticks on its own thread and hands fired callbacks to the
//! [`global_pool`](crate::pool::global_pool), so a slow eviction never delays
//! the next tick.
//!
//! ```rust
//! use ember_runtime::timer::TimerWheel;
//! use std::time::Duration;
//!
//! let wheel = TimerWheel::new();
//! let handle = wheel.schedule(Duration::from_millis(3), || println!("idle"));
//! assert_eq!(wheel.advance(3), 0);
//! assert_eq!(wheel.advance(1), 1);
//! assert!(!handle.cancel());
//! ```

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::pool::global_pool;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1);

const DEFAULT_SLOTS: usize = 512;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Timer {
    due: u64,
    callback: Callback,
    /// Set once the timer is cancelled or fired; shared with its handle.
    settled: Arc<AtomicBool>,
}

/// Cancels a scheduled timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    settled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Cancel the timer. Returns `false` if it had already fired or been
    /// cancelled.
    pub fn cancel(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

struct Wheel {
    slots: Vec<Vec<Timer>>,
    /// The next tick to process. Guarded together with `slots` so a timer
    /// is never placed behind the tick.
    now: u64,
}

impl Wheel {
    fn insert(&mut self, delay_ticks: u64, timer: impl FnOnce(u64) -> Timer) {
        let due = self.now.saturating_add(delay_ticks);
        let slot = (due % self.slots.len() as u64) as usize;
        self.slots[slot].push(timer(due));
    }

    fn tick(&mut self) -> Vec<Callback> {
        let tick = self.now;
        self.now += 1;
        let slot = (tick % self.slots.len() as u64) as usize;

        let (due, waiting): (Vec<Timer>, Vec<Timer>) = mem::take(&mut self.slots[slot])
            .into_iter()
            .filter(|timer| !timer.settled.load(Ordering::Acquire))
            .partition(|timer| timer.due <= tick);
        self.slots[slot] = waiting;

        due.into_iter()
            .filter(|timer| !timer.settled.swap(true, Ordering::AcqRel))
            .map(|timer| timer.callback)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    /// Run fired callbacks on the ticking thread.
    Inline,
    /// Hand fired callbacks to the global pool.
    Pool,
}

struct Shared {
    wheel: Mutex<Wheel>,
    tick: Duration,
    dispatch: Dispatch,
    stopped: AtomicBool,
}

impl Shared {
    fn fire(&self, callbacks: Vec<Callback>) -> usize {
        let fired = callbacks.len();
        for callback in callbacks {
            match self.dispatch {
                Dispatch::Pool => global_pool().execute(callback),
                Dispatch::Inline => {
                    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                        warn!("timer callback panicked");
                    }
                }
            }
        }
        fired
    }
}

/// A single-level hashed timing wheel.
pub struct TimerWheel {
    shared: Arc<Shared>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerWheel {
    /// A wheel with a 1ms tick and 512 slots.
    pub fn new() -> Self {
        Self::with_config(DEFAULT_TICK_INTERVAL, DEFAULT_SLOTS)
    }

    pub fn with_config(tick: Duration, slots: usize) -> Self {
        Self::build(tick, slots, Dispatch::Inline)
    }

    fn build(tick: Duration, slots: usize, dispatch: Dispatch) -> Self {
        let slots = (0..slots.max(1)).map(|_| Vec::new()).collect();
        Self {
            shared: Arc::new(Shared {
                wheel: Mutex::new(Wheel { slots, now: 0 }),
                tick: tick.max(Duration::from_micros(1)),
                dispatch,
                stopped: AtomicBool::new(false),
            }),
            ticker: Mutex::new(None),
        }
    }

    /// Start ticking in real time on a background thread. Idempotent.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("ember-timer".to_string())
            .spawn(move || {
                let mut next = Instant::now() + shared.tick;
                while !shared.stopped.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now < next {
                        thread::park_timeout(next - now);
                        continue;
                    }
                    let fired = shared.wheel.lock().tick();
                    shared.fire(fired);
                    next += shared.tick;
                }
            });
        match spawned {
            Ok(handle) => *ticker = Some(handle),
            Err(err) => warn!(error = %err, "failed to start timer thread"),
        }
    }

    /// Stop the background thread, if any. Pending timers stay scheduled.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.thread().unpark();
            let _ = ticker.join();
            debug!("timer wheel stopped");
        }
    }

    /// Run `callback` once `delay` has elapsed, rounded up to whole ticks.
    /// Delays beyond the tick counter's range never fire.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let ticks = delay.as_nanos().div_ceil(self.shared.tick.as_nanos());
        let ticks = u64::try_from(ticks).unwrap_or(u64::MAX);
        let settled = Arc::new(AtomicBool::new(false));
        let handle = TimerHandle {
            settled: Arc::clone(&settled),
        };
        self.shared.wheel.lock().insert(ticks, |due| Timer {
            due,
            callback: Box::new(callback),
            settled,
        });
        handle
    }

    /// Run `callback` at `deadline`, or on the next tick if it has passed.
    pub fn schedule_at<F>(&self, deadline: Instant, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(deadline.saturating_duration_since(Instant::now()), callback)
    }

    /// Process `ticks` ticks on the calling thread and return how many
    /// timers fired. Used to drive a wheel that was never started.
    pub fn advance(&self, ticks: u64) -> usize {
        (0..ticks)
            .map(|_| {
                let fired = self.shared.wheel.lock().tick();
                self.shared.fire(fired)
            })
            .sum()
    }

    pub fn tick_interval(&self) -> Duration {
        self.shared.tick
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

static GLOBAL_WHEEL: OnceLock<TimerWheel> = OnceLock::new();

/// The process-wide wheel, started on first use with the configured
/// [`RuntimeConfig::timer_tick`](crate::RuntimeConfig::timer_tick).
pub fn global_timer() -> &'static TimerWheel {
    GLOBAL_WHEEL.get_or_init(|| {
        let wheel = TimerWheel::build(crate::fiber::config().timer_tick, DEFAULT_SLOTS, Dispatch::Pool);
        wheel.start();
        wheel
    })
}

/// Schedule on the global wheel.
pub fn schedule_timer<F>(delay: Duration, callback: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    global_timer().schedule(delay, callback)
}

/// Schedule at `deadline` on the global wheel.
pub fn schedule_at<F>(deadline: Instant, callback: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    global_timer().schedule_at(deadline, callback)
}
