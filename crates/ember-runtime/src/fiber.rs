//! Fibers: interruptible logical threads of control.
//!
//! The current implementation backs every fiber with its own OS thread. A
//! fiber carries a [`FiberId`] and a [`CancelToken`]; interrupting a fiber
//! cancels the token and wakes it at its next suspension point
//! ([`Deferred::wait`](crate::deferred::Deferred::wait),
//! [`Mailbox::take`](crate::mailbox::Mailbox::take), [`Fiber::join`]).
//!
//! Threads that were not forked through this module (the main thread, test
//! threads) get a root fiber identity on first use of [`current`].
//!
//! # Example
//!
//! ```rust
//! use ember_runtime::fiber;
//!
//! let fiber = fiber::fork(|| 21 * 2);
//! assert_eq!(fiber.join().unwrap(), 42);
//! ```

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use tracing::trace;

use crate::cancel::{CancelToken, ListenerKey};
use crate::deferred::Deferred;
use crate::error::FiberError;
use crate::exit::{Defect, FiberId};
use crate::RuntimeConfig;

/// Global runtime configuration.
static CONFIG: std::sync::OnceLock<RuntimeConfig> = std::sync::OnceLock::new();

/// Initialize the runtime with the given configuration.
///
/// This should be called once at program startup. If not called,
/// default configuration is used. Returns `false` if the configuration was
/// already fixed.
pub fn init(config: RuntimeConfig) -> bool {
    CONFIG.set(config).is_ok()
}

/// Get the current runtime configuration.
pub fn config() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::default)
}

thread_local! {
    static CURRENT: RefCell<Option<FiberRef>> = const { RefCell::new(None) };
    static MASK: Cell<usize> = const { Cell::new(0) };
}

/// Identity and cancellation handle of a running fiber.
#[derive(Debug, Clone)]
pub struct FiberRef {
    id: FiberId,
    token: CancelToken,
}

impl FiberRef {
    fn new() -> Self {
        Self {
            id: FiberId::next(),
            token: CancelToken::new(),
        }
    }

    /// The fiber's identifier.
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// The fiber's cancellation token.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Request interruption of the fiber.
    pub fn interrupt(&self) {
        if self.token.cancel() {
            trace!(fiber = %self.id, "interrupt requested");
        }
    }

    /// Whether interruption has been requested, regardless of masking.
    pub fn is_interrupt_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether a waiter on the calling thread should give up now.
    ///
    /// Only meaningful for the fiber running on the calling thread, since the
    /// interruption mask is per thread.
    pub(crate) fn should_stop(&self) -> bool {
        self.token.is_cancelled() && !is_masked()
    }

    /// Run `wake` when the fiber is interrupted, for as long as the returned
    /// guard lives.
    pub(crate) fn wake_on_interrupt<F>(&self, wake: F) -> InterruptGuard
    where
        F: FnOnce() + Send + 'static,
    {
        InterruptGuard {
            token: self.token.clone(),
            key: self.token.on_cancel(wake),
        }
    }
}

/// Removes an interruption listener when dropped.
pub(crate) struct InterruptGuard {
    token: CancelToken,
    key: Option<ListenerKey>,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.token.remove_listener(key);
        }
    }
}

/// The fiber running on the calling thread.
pub fn current() -> FiberRef {
    CURRENT.with(|slot| slot.borrow_mut().get_or_insert_with(FiberRef::new).clone())
}

/// Identifier of the fiber running on the calling thread.
pub fn current_id() -> FiberId {
    current().id()
}

/// True if the calling fiber has a pending, unmasked interruption.
pub fn is_interrupted() -> bool {
    current().should_stop()
}

/// True while the calling thread runs inside [`uninterruptible`].
pub fn is_masked() -> bool {
    MASK.with(|mask| mask.get() > 0)
}

/// Run `f` with interruption masked.
///
/// Suspension points inside `f` ignore interruption requests; a request made
/// meanwhile stays pending and is observed after `f` returns.
pub fn uninterruptible<R>(f: impl FnOnce() -> R) -> R {
    struct Unmask;
    impl Drop for Unmask {
        fn drop(&mut self) {
            MASK.with(|mask| mask.set(mask.get() - 1));
        }
    }

    MASK.with(|mask| mask.set(mask.get() + 1));
    let _unmask = Unmask;
    f()
}

/// A handle to a forked fiber.
pub struct Fiber<T> {
    fiber: FiberRef,
    result: Deferred<Result<T, FiberError>>,
}

impl<T> Clone for Fiber<T> {
    fn clone(&self) -> Self {
        Self {
            fiber: self.fiber.clone(),
            result: self.result.clone(),
        }
    }
}

/// Fork `f` onto a new fiber.
///
/// If `f` panics, the panic is caught and reported as
/// `FiberError::Panicked` by [`Fiber::join`].
pub fn fork<F, T>(f: F) -> Fiber<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Clone + Send + 'static,
{
    let config = config();
    let fiber = FiberRef::new();
    let result = Deferred::new();

    let thread_name = format!("{}-{}", config.thread_name_prefix, fiber.id().as_u64());
    let mut builder = thread::Builder::new().name(thread_name);
    if let Some(stack_size) = config.stack_size {
        builder = builder.stack_size(stack_size);
    }

    let child = fiber.clone();
    let completion = result.clone();
    let spawned = builder.spawn(move || {
        CURRENT.with(|slot| *slot.borrow_mut() = Some(child));
        let outcome = panic::catch_unwind(AssertUnwindSafe(f))
            .map_err(|payload| FiberError::Panicked(Defect::from_panic(payload).message().to_string()));
        completion.complete(outcome);
    });

    if let Err(err) = spawned {
        result.complete(Err(FiberError::SpawnFailed(err.to_string())));
    }

    trace!(fiber = %fiber.id(), "forked");
    Fiber { fiber, result }
}

impl<T> Fiber<T>
where
    T: Clone + Send + 'static,
{
    /// Get the fiber's unique identifier.
    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    /// Identity and cancellation handle of the fiber.
    pub fn fiber_ref(&self) -> &FiberRef {
        &self.fiber
    }

    /// Request interruption without waiting for the fiber to finish.
    pub fn interrupt(&self) {
        self.fiber.interrupt();
    }

    /// Check if the fiber has finished.
    pub fn is_finished(&self) -> bool {
        self.result.is_done()
    }

    /// Try to get the result without blocking.
    pub fn poll(&self) -> Option<Result<T, FiberError>> {
        self.result.poll()
    }

    /// Wait for the fiber to complete and return its result.
    ///
    /// The wait is interruptible: if the joining fiber is interrupted, this
    /// returns `FiberError::Interrupted` with the joiner's id and the joined
    /// fiber keeps running.
    pub fn join(&self) -> Result<T, FiberError> {
        match self.result.wait() {
            Ok(result) => result,
            Err(interrupted) => Err(FiberError::Interrupted(interrupted.0)),
        }
    }

    /// Wait at most `timeout` for the fiber to complete.
    pub fn join_timeout(&self, timeout: Duration) -> Result<T, FiberError> {
        match self.result.wait_timeout(timeout) {
            Ok(Some(result)) => result,
            Ok(None) => Err(FiberError::Timeout(timeout)),
            Err(interrupted) => Err(FiberError::Interrupted(interrupted.0)),
        }
    }

    /// Interrupt the fiber and wait, uninterruptibly, for it to finish.
    pub fn interrupt_and_join(&self) -> Result<T, FiberError> {
        self.interrupt();
        uninterruptible(|| self.join())
    }
}
