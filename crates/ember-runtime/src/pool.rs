//! Worker pool for short runtime callbacks.
//!
//! Fired timers and idle-expiry evictions run here so they never execute on
//! the timer's tick thread. Anything that blocks belongs on a
//! [`fiber`](crate::fiber) instead.
//!
//! Submissions go to a shared injector; each worker drains a batch into its
//! own deque and steals from its peers when both are empty.

use std::iter;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use crossbeam_deque::{Injector, Stealer, Worker};
use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::exit::Defect;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    injector: Injector<Callback>,
    stealers: Vec<Stealer<Callback>>,
    /// Submitted callbacks that have not finished running.
    pending: AtomicUsize,
    closing: AtomicBool,
    /// Number of workers parked on `wake`.
    idle: Mutex<usize>,
    wake: Condvar,
}

impl Shared {
    fn next_callback(&self, local: &Worker<Callback>) -> Option<Callback> {
        local.pop().or_else(|| {
            iter::repeat_with(|| {
                self.injector
                    .steal_batch_and_pop(local)
                    .or_else(|| self.stealers.iter().map(Stealer::steal).collect())
            })
            .find(|steal| !steal.is_retry())
            .and_then(|steal| steal.success())
        })
    }

    fn run(&self, callback: Callback) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
            warn!(defect = %Defect::from_panic(payload), "pool callback panicked");
        }
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A fixed set of worker threads running fire-and-forget callbacks.
///
/// Dropping the pool runs every callback already submitted, then joins the
/// workers.
pub struct CallbackPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl CallbackPool {
    /// A pool with one worker per available core.
    pub fn new() -> Self {
        let workers = thread::available_parallelism().map_or(2, |n| n.get());
        Self::with_workers(workers)
    }

    /// A pool with `count` workers (at least one).
    pub fn with_workers(count: usize) -> Self {
        let locals: Vec<Worker<Callback>> = (0..count.max(1)).map(|_| Worker::new_fifo()).collect();
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers: locals.iter().map(Worker::stealer).collect(),
            pending: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            idle: Mutex::new(0),
            wake: Condvar::new(),
        });

        let workers = locals
            .into_iter()
            .enumerate()
            .filter_map(|(index, local)| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("ember-pool-{index}"))
                    .spawn(move || work(&shared, &local))
                    .map_err(|err| warn!(index, error = %err, "failed to start pool worker"))
                    .ok()
            })
            .collect();

        Self { shared, workers }
    }

    /// Queue `callback` to run on some worker.
    pub fn execute<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.shared.injector.push(Box::new(callback));
        if *self.shared.idle.lock() > 0 {
            self.shared.wake.notify_one();
        }
    }

    /// Number of running worker threads.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Callbacks queued or running.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }
}

impl Default for CallbackPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallbackPool {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::Release);
        {
            let _idle = self.shared.idle.lock();
            self.shared.wake.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn work(shared: &Shared, local: &Worker<Callback>) {
    loop {
        if let Some(callback) = shared.next_callback(local) {
            shared.run(callback);
            continue;
        }

        let mut idle = shared.idle.lock();
        // Re-check under the lock: `execute` pushes before reading `idle`.
        if !shared.injector.is_empty() {
            continue;
        }
        if shared.closing.load(Ordering::Acquire) {
            trace!("pool worker exiting");
            return;
        }
        *idle += 1;
        shared.wake.wait(&mut idle);
        *idle -= 1;
    }
}

static GLOBAL_POOL: OnceLock<CallbackPool> = OnceLock::new();

/// The process-wide pool, started on first use.
pub fn global_pool() -> &'static CallbackPool {
    GLOBAL_POOL.get_or_init(CallbackPool::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Deferred;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_drop_runs_queued_callbacks() {
        let pool = CallbackPool::with_workers(3);
        let ran = Arc::new(AtomicU32::new(0));
        for _ in 0..200 {
            let ran = Arc::clone(&ran);
            pool.execute(move || {
                ran.fetch_add(1, Ordering::Relaxed);
            });
        }

        drop(pool);
        assert_eq!(ran.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn test_panicking_callback_keeps_worker() {
        let pool = CallbackPool::with_workers(1);
        let done: Deferred<&'static str> = Deferred::new();
        pool.execute(|| panic!("expiry failed"));
        let signal = done.clone();
        pool.execute(move || {
            signal.complete("alive");
        });

        assert_eq!(done.wait_timeout(Duration::from_secs(2)), Ok(Some("alive")));
    }

    #[test]
    fn test_idle_worker_wakes_for_late_submission() {
        let pool = CallbackPool::with_workers(2);
        std::thread::sleep(Duration::from_millis(20));

        let done: Deferred<()> = Deferred::new();
        let signal = done.clone();
        pool.execute(move || {
            signal.complete(());
        });
        assert_eq!(done.wait_timeout(Duration::from_secs(2)), Ok(Some(())));
    }

    #[test]
    fn test_worker_count() {
        assert_eq!(CallbackPool::with_workers(4).workers(), 4);
        assert_eq!(CallbackPool::with_workers(0).workers(), 1);
    }
}
