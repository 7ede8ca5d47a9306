//! Single-assignment completion signals.
//!
//! A [`Deferred`] is completed at most once; any number of fibers may wait
//! for it, before or after completion. Waiting is interruptible.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Interrupted;
use crate::fiber;

struct DeferredInner<T> {
    value: Mutex<Option<T>>,
    completed: Condvar,
}

/// A one-shot completion signal.
pub struct Deferred<T> {
    inner: Arc<DeferredInner<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Deferred<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DeferredInner {
                value: Mutex::new(None),
                completed: Condvar::new(),
            }),
        }
    }

    /// Complete the signal. Returns `false` if it was already completed, in
    /// which case `value` is discarded.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.inner.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.inner.completed.notify_all();
        true
    }

    /// The value, if completed.
    pub fn poll(&self) -> Option<T> {
        self.inner.value.lock().clone()
    }

    pub fn is_done(&self) -> bool {
        self.inner.value.lock().is_some()
    }

    /// Wait for completion.
    ///
    /// Returns `Err(Interrupted)` if the calling fiber is interrupted first.
    pub fn wait(&self) -> Result<T, Interrupted> {
        loop {
            if let Some(value) = self.wait_until(None)? {
                return Ok(value);
            }
        }
    }

    /// Wait at most `timeout` for completion. `Ok(None)` means the timeout
    /// elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>, Interrupted> {
        self.wait_until(Some(Instant::now() + timeout))
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Result<Option<T>, Interrupted> {
        let current = fiber::current();
        let _guard = current.wake_on_interrupt(wake_waiters(Arc::downgrade(&self.inner)));

        let mut value = self.inner.value.lock();
        loop {
            if let Some(value) = value.as_ref() {
                return Ok(Some(value.clone()));
            }
            if current.should_stop() {
                return Err(Interrupted(current.id()));
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.completed.wait_until(&mut value, deadline).timed_out() {
                        return Ok(value.clone());
                    }
                }
                None => self.inner.completed.wait(&mut value),
            }
        }
    }
}

fn wake_waiters<T: Send + 'static>(inner: Weak<DeferredInner<T>>) -> impl FnOnce() + Send + 'static {
    move || {
        if let Some(inner) = inner.upgrade() {
            let _value = inner.value.lock();
            inner.completed.notify_all();
        }
    }
}

impl<T> Default for Deferred<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("done", &self.inner.value.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::fork;

    #[test]
    fn test_first_completion_wins() {
        let deferred = Deferred::new();
        assert!(deferred.complete(1));
        assert!(!deferred.complete(2));
        assert_eq!(deferred.poll(), Some(1));
    }

    #[test]
    fn test_many_waiters_observe_same_value() {
        let deferred: Deferred<&'static str> = Deferred::new();
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let deferred = deferred.clone();
                fork(move || deferred.wait().unwrap())
            })
            .collect();

        std::thread::sleep(Duration::from_millis(10));
        deferred.complete("done");

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), "done");
        }
    }

    #[test]
    fn test_wait_after_completion_returns_cached() {
        let deferred = Deferred::new();
        deferred.complete(7);
        assert_eq!(deferred.wait().unwrap(), 7);
        assert_eq!(deferred.wait().unwrap(), 7);
    }

    #[test]
    fn test_wait_timeout_elapses() {
        let deferred: Deferred<i32> = Deferred::new();
        let start = Instant::now();
        assert_eq!(deferred.wait_timeout(Duration::from_millis(20)).unwrap(), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_interrupted_waiter_leaves_no_listener() {
        let deferred: Deferred<i32> = Deferred::new();
        let waiting = deferred.clone();
        let fiber = fork(move || waiting.wait());

        std::thread::sleep(Duration::from_millis(10));
        let token = fiber.fiber_ref().token().clone();
        let result = fiber.interrupt_and_join().unwrap();

        assert_eq!(result, Err(Interrupted(fiber.id())));
        assert_eq!(token.listener_count(), 0);
    }
}
