//! Bounded mailboxes that terminate with an [`Exit`].
//!
//! A mailbox is a FIFO queue with a producer side (`offer`, `end`,
//! `fail_cause`) and a consumer side (`take`, `take_all`, `shutdown`). Unlike
//! a plain channel it ends with an outcome: consumers drain the buffered
//! values and then observe either a normal end or the failure cause.
//!
//! # Example
//!
//! ```rust
//! use ember_runtime::mailbox::Mailbox;
//!
//! let mailbox: Mailbox<i32, String> = Mailbox::bounded(4);
//! mailbox.offer_all([1, 2]).unwrap();
//! mailbox.end();
//!
//! assert_eq!(mailbox.take(), Ok(Some(1)));
//! assert_eq!(mailbox.take(), Ok(Some(2)));
//! assert_eq!(mailbox.take(), Ok(None));
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::error::Interrupted;
use crate::exit::{Cause, Exit};
use crate::fiber;

struct MailboxState<A, E> {
    buffer: VecDeque<A>,
    capacity: usize,
    /// Set once by the producer side.
    exit: Option<Exit<(), E>>,
    /// Set by the consumer side; buffered and future values are discarded.
    shutdown: bool,
}

impl<A, E> MailboxState<A, E> {
    fn is_full(&self) -> bool {
        self.buffer.len() >= self.capacity
    }

    fn accepts(&self) -> bool {
        self.exit.is_none() && !self.shutdown
    }
}

struct MailboxInner<A, E> {
    state: Mutex<MailboxState<A, E>>,
    /// Signalled when space becomes available or the mailbox closes
    not_full: Condvar,
    /// Signalled when a value arrives or the mailbox closes
    not_empty: Condvar,
}

/// A bounded queue of `A` values ending with `Exit<(), E>`.
///
/// `Mailbox` is a shared handle; clones refer to the same queue.
pub struct Mailbox<A, E> {
    inner: Arc<MailboxInner<A, E>>,
}

impl<A, E> Clone for Mailbox<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, E> Mailbox<A, E>
where
    A: Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create a mailbox holding at most `capacity` values (at least one).
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(MailboxInner {
                state: Mutex::new(MailboxState {
                    buffer: VecDeque::with_capacity(capacity),
                    capacity,
                    exit: None,
                    shutdown: false,
                }),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
            }),
        }
    }

    /// Offer a value, suspending while the mailbox is full.
    ///
    /// Returns `Ok(false)` if the mailbox has ended or was shut down, in which
    /// case the value is dropped.
    pub fn offer(&self, value: A) -> Result<bool, Interrupted> {
        self.offer_all(std::iter::once(value))
    }

    /// Offer every value in order, suspending whenever the mailbox is full.
    ///
    /// Returns `Ok(false)` if the mailbox stopped accepting values before all
    /// of them were enqueued.
    pub fn offer_all<I>(&self, values: I) -> Result<bool, Interrupted>
    where
        I: IntoIterator<Item = A>,
    {
        let current = fiber::current();
        let _guard = current.wake_on_interrupt(wake_all(Arc::downgrade(&self.inner)));

        let mut state = self.inner.state.lock();
        for value in values {
            loop {
                if !state.accepts() {
                    return Ok(false);
                }
                if !state.is_full() {
                    break;
                }
                if current.should_stop() {
                    return Err(Interrupted(current.id()));
                }
                self.inner.not_full.wait(&mut state);
            }
            state.buffer.push_back(value);
            self.inner.not_empty.notify_one();
        }
        Ok(true)
    }

    /// Take the next value.
    ///
    /// Returns `Ok(None)` once the mailbox has ended successfully (or was shut
    /// down) and is drained, and `Err(cause)` once it has failed and is
    /// drained. Interruption of the calling fiber yields
    /// `Err(Cause::Interrupt(..))`.
    pub fn take(&self) -> Result<Option<A>, Cause<E>> {
        let current = fiber::current();
        let _guard = current.wake_on_interrupt(wake_all(Arc::downgrade(&self.inner)));

        let mut state = self.inner.state.lock();
        loop {
            if let Some(value) = state.buffer.pop_front() {
                self.inner.not_full.notify_one();
                return Ok(Some(value));
            }
            if let Some(ended) = Self::ended(&state) {
                return ended.map(|()| None);
            }
            if current.should_stop() {
                return Err(Cause::Interrupt(current.id()));
            }
            self.inner.not_empty.wait(&mut state);
        }
    }

    /// Take every buffered value, suspending until at least one is available.
    ///
    /// Returns `Ok(None)` when ended and drained, as [`take`](Self::take).
    pub fn take_all(&self) -> Result<Option<Vec<A>>, Cause<E>> {
        let current = fiber::current();
        let _guard = current.wake_on_interrupt(wake_all(Arc::downgrade(&self.inner)));

        let mut state = self.inner.state.lock();
        loop {
            if !state.buffer.is_empty() {
                let values: Vec<A> = state.buffer.drain(..).collect();
                self.inner.not_full.notify_all();
                return Ok(Some(values));
            }
            if let Some(ended) = Self::ended(&state) {
                return ended.map(|()| None);
            }
            if current.should_stop() {
                return Err(Cause::Interrupt(current.id()));
            }
            self.inner.not_empty.wait(&mut state);
        }
    }

    fn ended(state: &MailboxState<A, E>) -> Option<Result<(), Cause<E>>> {
        if state.shutdown {
            return Some(Ok(()));
        }
        match &state.exit {
            None => None,
            Some(Exit::Success(())) => Some(Ok(())),
            Some(Exit::Failure(cause)) => Some(Err(cause.clone())),
        }
    }

    /// End the mailbox normally. Returns `false` if it had already ended.
    pub fn end(&self) -> bool {
        self.done(Exit::void())
    }

    /// End the mailbox with a failure. Returns `false` if it had already
    /// ended.
    pub fn fail_cause(&self, cause: Cause<E>) -> bool {
        self.done(Exit::Failure(cause))
    }

    /// End the mailbox with `exit`. Values already buffered remain takeable.
    pub fn done(&self, exit: Exit<(), E>) -> bool {
        let mut state = self.inner.state.lock();
        if state.exit.is_some() {
            return false;
        }
        state.exit = Some(exit);
        self.inner.not_empty.notify_all();
        self.inner.not_full.notify_all();
        true
    }

    /// Close the consumer side: discard buffered values and refuse new ones.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        state.buffer.clear();
        self.inner.not_empty.notify_all();
        self.inner.not_full.notify_all();
    }

    /// Whether the producer side has finished or the consumer shut down.
    pub fn is_done(&self) -> bool {
        !self.inner.state.lock().accepts()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.state.lock().capacity
    }
}

fn wake_all<A, E>(inner: Weak<MailboxInner<A, E>>) -> impl FnOnce() + Send + 'static
where
    A: Send + 'static,
    E: Send + 'static,
{
    move || {
        if let Some(inner) = inner.upgrade() {
            let _state = inner.state.lock();
            inner.not_empty.notify_all();
            inner.not_full.notify_all();
        }
    }
}

impl<A, E> std::fmt::Debug for Mailbox<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Mailbox")
            .field("len", &state.buffer.len())
            .field("capacity", &state.capacity)
            .field("ended", &state.exit.is_some())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}
