//! Scopes: finalizer registries with release-on-exit semantics.
//!
//! A [`Scope`] collects finalizers from any number of owners and runs each of
//! them exactly once when the scope is closed. Every finalizer observes the
//! [`ScopeExit`] the scope was closed with.
//!
//! # Guarantees
//!
//! 1. **Exactly once**: `close` transitions Open -> Closed once; later or
//!    concurrent closes are no-ops.
//! 2. **No dropped finalizers**: a finalizer offered to a closed scope runs
//!    immediately against the recorded exit.
//! 3. **Cleanup always runs**: a failing or panicking finalizer never stops
//!    its siblings; all failures are aggregated into a [`FinalizerError`].
//! 4. **Ordering**: sequential scopes run finalizers in reverse registration
//!    order; parallel scopes run them concurrently on forked fibers.
//!
//! # Example
//!
//! ```rust
//! use ember_runtime::exit::Exit;
//! use ember_runtime::scope::{ExecutionStrategy, Scope};
//! use std::sync::{Arc, Mutex};
//!
//! let log = Arc::new(Mutex::new(Vec::new()));
//! let scope = Scope::make(ExecutionStrategy::Sequential);
//! for name in ["db", "cache"] {
//!     let log = Arc::clone(&log);
//!     scope.add_finalizer(move || log.lock().unwrap().push(name)).unwrap();
//! }
//! scope.close(Exit::void()).unwrap();
//! assert_eq!(*log.lock().unwrap(), vec!["cache", "db"]);
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{FinalizerError, ScopeClosed};
use crate::exit::{AnyError, Cause, Defect, Exit, ScopeExit};
use crate::fiber;

/// How a scope runs its finalizers when it closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionStrategy {
    /// One after another, in reverse registration order.
    #[default]
    Sequential,
    /// All at once, each on its own fiber.
    Parallel,
}

/// Key identifying a registered finalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FinalizerKey(u64);

pub(crate) type BoxedFinalizer =
    Box<dyn FnOnce(&ScopeExit) -> Result<(), FinalizerError> + Send + 'static>;

enum ScopeState {
    Open {
        next_key: u64,
        finalizers: BTreeMap<FinalizerKey, BoxedFinalizer>,
    },
    Closed {
        exit: ScopeExit,
    },
}

struct ScopeInner {
    id: u64,
    strategy: ExecutionStrategy,
    state: Mutex<ScopeState>,
    /// Registration of this scope's close in its parent, for forked scopes.
    parent: Mutex<Option<(Weak<ScopeInner>, FinalizerKey)>>,
}

/// A closeable finalizer registry.
///
/// `Scope` is a cheap, clonable handle; all clones refer to the same
/// registry.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Create an open scope with no finalizers.
    pub fn make(strategy: ExecutionStrategy) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            inner: Arc::new(ScopeInner {
                id: COUNTER.fetch_add(1, Ordering::Relaxed),
                strategy,
                state: Mutex::new(ScopeState::Open {
                    next_key: 0,
                    finalizers: BTreeMap::new(),
                }),
                parent: Mutex::new(None),
            }),
        }
    }

    /// Create an open sequential scope.
    pub fn new() -> Self {
        Self::make(ExecutionStrategy::Sequential)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.inner.strategy
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.state.lock(), ScopeState::Closed { .. })
    }

    /// The exit the scope was closed with, if it is closed.
    pub fn exit(&self) -> Option<ScopeExit> {
        match &*self.inner.state.lock() {
            ScopeState::Open { .. } => None,
            ScopeState::Closed { exit } => Some(exit.clone()),
        }
    }

    /// Number of finalizers waiting for the scope to close.
    pub fn len(&self) -> usize {
        match &*self.inner.state.lock() {
            ScopeState::Open { finalizers, .. } => finalizers.len(),
            ScopeState::Closed { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a finalizer that ignores the closing exit.
    ///
    /// If the scope is already closed the finalizer runs immediately and
    /// `Err(ScopeClosed)` is returned.
    pub fn add_finalizer<F>(&self, finalizer: F) -> Result<FinalizerKey, ScopeClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(Box::new(move |_| {
            finalizer();
            Ok(())
        }))
    }

    /// Register a finalizer that observes the closing exit.
    ///
    /// If the scope is already closed the finalizer runs immediately against
    /// the recorded exit and `Err(ScopeClosed)` is returned.
    pub fn add_finalizer_exit<F>(&self, finalizer: F) -> Result<FinalizerKey, ScopeClosed>
    where
        F: FnOnce(&ScopeExit) + Send + 'static,
    {
        self.register(Box::new(move |exit| {
            finalizer(exit);
            Ok(())
        }))
    }

    /// Register a finalizer that can report a failure without panicking.
    pub fn add_fallible_finalizer<F>(&self, finalizer: F) -> Result<FinalizerKey, ScopeClosed>
    where
        F: FnOnce(&ScopeExit) -> Result<(), Defect> + Send + 'static,
    {
        self.register(Box::new(move |exit| {
            finalizer(exit).map_err(|defect| FinalizerError::new(vec![defect]))
        }))
    }

    pub(crate) fn register(&self, finalizer: BoxedFinalizer) -> Result<FinalizerKey, ScopeClosed> {
        let mut state = self.inner.state.lock();
        match &mut *state {
            ScopeState::Open {
                next_key,
                finalizers,
            } => {
                let key = FinalizerKey(*next_key);
                *next_key += 1;
                finalizers.insert(key, finalizer);
                Ok(key)
            }
            ScopeState::Closed { exit } => {
                let exit = exit.clone();
                drop(state);
                let defects = fiber::uninterruptible(|| run_finalizer(finalizer, &exit));
                if !defects.is_empty() {
                    warn!(
                        scope = self.inner.id,
                        error = %FinalizerError::new(defects),
                        "late finalizer failed"
                    );
                }
                Err(ScopeClosed)
            }
        }
    }

    /// Deregister a finalizer without running it.
    ///
    /// Returns `false` if the key is unknown or the scope has closed.
    pub fn remove_finalizer(&self, key: FinalizerKey) -> bool {
        match &mut *self.inner.state.lock() {
            ScopeState::Open { finalizers, .. } => finalizers.remove(&key).is_some(),
            ScopeState::Closed { .. } => false,
        }
    }

    /// Create a child scope whose close is registered as a finalizer of this
    /// scope.
    ///
    /// The child inherits this scope's strategy unless `strategy` overrides
    /// it. Closing the child first deregisters it from the parent; closing
    /// the parent first closes the child with the parent's exit. Forking a
    /// closed scope yields a child that is already closed.
    pub fn fork(&self, strategy: Option<ExecutionStrategy>) -> Scope {
        let child = Scope::make(strategy.unwrap_or(self.inner.strategy));
        let closer = child.clone();
        let registered = self.register(Box::new(move |exit| closer.close(exit.clone())));
        if let Ok(key) = registered {
            *child.inner.parent.lock() = Some((Arc::downgrade(&self.inner), key));
        }
        child
    }

    /// Close the scope, running every finalizer with `exit`.
    ///
    /// Only the first call runs finalizers; later calls return `Ok(())`.
    pub fn close(&self, exit: ScopeExit) -> Result<(), FinalizerError> {
        let finalizers = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                ScopeState::Closed { .. } => return Ok(()),
                ScopeState::Open { finalizers, .. } => {
                    let finalizers = std::mem::take(finalizers);
                    *state = ScopeState::Closed { exit: exit.clone() };
                    finalizers
                }
            }
        };

        if let Some((parent, key)) = self.inner.parent.lock().take() {
            if let Some(parent) = parent.upgrade() {
                Scope { inner: parent }.remove_finalizer(key);
            }
        }

        debug!(
            scope = self.inner.id,
            strategy = ?self.inner.strategy,
            finalizers = finalizers.len(),
            interrupted = exit.is_interrupted(),
            "closing scope"
        );

        let finalizers: Vec<BoxedFinalizer> = finalizers.into_values().collect();
        let defects = fiber::uninterruptible(|| match self.inner.strategy {
            ExecutionStrategy::Sequential => run_sequential(finalizers, &exit),
            ExecutionStrategy::Parallel => run_parallel(finalizers, &exit),
        });

        if defects.is_empty() {
            Ok(())
        } else {
            Err(FinalizerError::new(defects))
        }
    }

    /// Run `f` with this scope, then close the scope with an exit derived
    /// from `f`'s result.
    ///
    /// Finalizer failures are added to the returned exit as defects. If `f`
    /// panics, the scope is closed with a defect and the panic is resumed.
    pub fn use_scoped<T, E, F>(&self, f: F) -> Exit<T, E>
    where
        F: FnOnce(&Scope) -> Result<T, E>,
        E: Error + Clone + Send + Sync + 'static,
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(self)));
        match outcome {
            Ok(Ok(value)) => match self.close(Exit::void()) {
                Ok(()) => Exit::Success(value),
                Err(err) => Exit::Failure(err.into_cause()),
            },
            Ok(Err(error)) => {
                let erased: AnyError = Arc::new(error.clone());
                let cause = Cause::Fail(error);
                match self.close(Exit::fail(erased)) {
                    Ok(()) => Exit::Failure(cause),
                    Err(err) => Exit::Failure(cause.combine(err.into_cause())),
                }
            }
            Err(payload) => {
                let defect = Defect::from_panic(clone_payload(payload.as_ref()));
                if let Err(err) = self.close(Exit::die(defect)) {
                    warn!(scope = self.inner.id, error = %err, "finalizers failed while unwinding");
                }
                panic::resume_unwind(payload)
            }
        }
    }
}

/// Run `f` in a fresh scope that is closed when `f` returns, fails or panics.
///
/// # Example
///
/// ```rust
/// use ember_runtime::exit::Exit;
/// use ember_runtime::scope::{with_scope, ExecutionStrategy};
///
/// let exit: Exit<i32, std::fmt::Error> = with_scope(ExecutionStrategy::Sequential, |scope| {
///     scope.add_finalizer(|| println!("released")).unwrap();
///     Ok(42)
/// });
/// assert_eq!(exit, Exit::succeed(42));
/// ```
pub fn with_scope<T, E, F>(strategy: ExecutionStrategy, f: F) -> Exit<T, E>
where
    F: FnOnce(&Scope) -> Result<T, E>,
    E: Error + Clone + Send + Sync + 'static,
{
    Scope::make(strategy).use_scoped(f)
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("strategy", &self.inner.strategy)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Scope {}

fn run_finalizer(finalizer: BoxedFinalizer, exit: &ScopeExit) -> Vec<Defect> {
    match panic::catch_unwind(AssertUnwindSafe(|| finalizer(exit))) {
        Ok(Ok(())) => Vec::new(),
        Ok(Err(err)) => err.defects().to_vec(),
        Err(payload) => vec![Defect::from_panic(payload)],
    }
}

fn run_sequential(finalizers: Vec<BoxedFinalizer>, exit: &ScopeExit) -> Vec<Defect> {
    finalizers
        .into_iter()
        .rev()
        .flat_map(|finalizer| run_finalizer(finalizer, exit))
        .collect()
}

fn run_parallel(mut finalizers: Vec<BoxedFinalizer>, exit: &ScopeExit) -> Vec<Defect> {
    if finalizers.len() <= 1 {
        return run_sequential(finalizers, exit);
    }

    let fibers: Vec<_> = finalizers
        .drain(..)
        .map(|finalizer| {
            let exit = exit.clone();
            fiber::fork(move || run_finalizer(finalizer, &exit))
        })
        .collect();

    fibers
        .into_iter()
        .flat_map(|fiber| match fiber.join() {
            Ok(defects) => defects,
            Err(err) => vec![Defect::new(err.to_string())],
        })
        .collect()
}

fn clone_payload(payload: &(dyn Any + Send)) -> Box<dyn Any + Send> {
    if let Some(message) = payload.downcast_ref::<String>() {
        Box::new(message.clone())
    } else if let Some(message) = payload.downcast_ref::<&'static str>() {
        Box::new(*message)
    } else {
        Box::new("unknown panic")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn recorder() -> (Arc<parking_lot::Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let make = move |name: &'static str| -> Box<dyn FnOnce() + Send> {
            let log = Arc::clone(&log_clone);
            Box::new(move || log.lock().push(name))
        };
        (log, make)
    }

    #[test]
    fn test_sequential_runs_in_reverse_order() {
        let (log, make) = recorder();
        let scope = Scope::make(ExecutionStrategy::Sequential);
        scope.add_finalizer(make("f1")).unwrap();
        scope.add_finalizer(make("f2")).unwrap();
        scope.add_finalizer(make("f3")).unwrap();

        scope.close(Exit::void()).unwrap();
        assert_eq!(*log.lock(), vec!["f3", "f2", "f1"]);
    }

    #[test]
    fn test_close_twice_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let scope = Scope::new();
        let count_clone = Arc::clone(&count);
        scope
            .add_finalizer(move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        scope.close(Exit::void()).unwrap();
        scope.close(Exit::void()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(scope.is_closed());
    }

    #[test]
    fn test_late_finalizer_runs_with_recorded_exit() {
        let scope = Scope::new();
        let id = fiber::current_id();
        scope.close(Exit::interrupt(id)).unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        let result = scope.add_finalizer_exit(move |exit| {
            *seen_clone.lock() = Some(exit.is_interrupted());
        });

        assert_eq!(result, Err(ScopeClosed));
        assert_eq!(*seen.lock(), Some(true));
    }

    #[test]
    fn test_failures_are_aggregated() {
        let (log, make) = recorder();
        let scope = Scope::new();
        scope.add_finalizer(make("first")).unwrap();
        scope.add_finalizer(|| panic!("second exploded")).unwrap();
        scope
            .add_fallible_finalizer(|_| Err(Defect::new("third failed")))
            .unwrap();

        let err = scope.close(Exit::void()).unwrap_err();
        let messages: Vec<_> = err.defects().iter().map(|d| d.message().to_string()).collect();
        assert_eq!(messages, vec!["third failed", "second exploded"]);
        assert_eq!(*log.lock(), vec!["first"]);
    }

    #[test]
    fn test_parallel_runs_concurrently() {
        let scope = Scope::make(ExecutionStrategy::Parallel);
        let barrier = Arc::new(std::sync::Barrier::new(3));
        for _ in 0..3 {
            let barrier = Arc::clone(&barrier);
            scope.add_finalizer(move || {
                barrier.wait();
            })
            .unwrap();
        }
        // Would deadlock if the finalizers ran one after another.
        scope.close(Exit::void()).unwrap();
    }

    #[test]
    fn test_remove_finalizer() {
        let count = Arc::new(AtomicUsize::new(0));
        let scope = Scope::new();
        let count_clone = Arc::clone(&count);
        let key = scope
            .add_finalizer(move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(scope.remove_finalizer(key));
        assert!(!scope.remove_finalizer(key));
        scope.close(Exit::void()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fork_closed_by_parent_first() {
        let (log, make) = recorder();
        let parent = Scope::new();
        parent.add_finalizer(make("parent-early")).unwrap();
        let child = parent.fork(None);
        child.add_finalizer(make("child")).unwrap();
        parent.add_finalizer(make("parent-late")).unwrap();

        assert_eq!(child.strategy(), ExecutionStrategy::Sequential);
        parent.close(Exit::void()).unwrap();

        assert!(child.is_closed());
        assert_eq!(*log.lock(), vec!["parent-late", "child", "parent-early"]);
    }

    #[test]
    fn test_fork_closed_first_deregisters() {
        let parent = Scope::new();
        let child = parent.fork(Some(ExecutionStrategy::Parallel));
        assert_eq!(child.strategy(), ExecutionStrategy::Parallel);
        assert_eq!(parent.len(), 1);

        child.close(Exit::void()).unwrap();
        assert_eq!(parent.len(), 0);
    }

    #[test]
    fn test_fork_of_closed_scope_is_closed() {
        let parent = Scope::new();
        parent.close(Exit::void()).unwrap();
        let child = parent.fork(None);
        assert!(child.is_closed());
    }

    #[test]
    fn test_child_failures_surface_in_parent() {
        let parent = Scope::new();
        let child = parent.fork(None);
        child.add_finalizer(|| panic!("child cleanup")).unwrap();

        let err = parent.close(Exit::void()).unwrap_err();
        assert_eq!(err.defects()[0].message(), "child cleanup");
    }

    #[test]
    fn test_finalizers_run_uninterruptibly() {
        let scope = Scope::new();
        let observed = Arc::new(parking_lot::Mutex::new(None));
        let observed_clone = Arc::clone(&observed);
        scope
            .add_finalizer(move || {
                let gate: crate::deferred::Deferred<()> = crate::deferred::Deferred::new();
                *observed_clone.lock() =
                    Some(gate.wait_timeout(Duration::from_millis(5)).is_ok());
            })
            .unwrap();

        let closer = fiber::fork(move || scope.close(Exit::void()).is_ok());
        closer.interrupt();
        assert!(closer.join().unwrap());
        assert_eq!(*observed.lock(), Some(true));
    }

    #[derive(Debug, Clone, PartialEq, thiserror::Error)]
    #[error("request failed")]
    struct RequestFailed;

    #[test]
    fn test_use_scoped_passes_failure_to_finalizers() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen_clone = Arc::clone(&seen);

        let exit: Exit<(), RequestFailed> = with_scope(ExecutionStrategy::Sequential, |scope| {
            scope
                .add_finalizer_exit(move |exit| {
                    *seen_clone.lock() = exit.cause().map(|c| c.failures()[0].to_string());
                })
                .unwrap();
            Err(RequestFailed)
        });

        assert_eq!(exit, Exit::fail(RequestFailed));
        assert_eq!(seen.lock().as_deref(), Some("request failed"));
    }

    #[test]
    fn test_use_scoped_closes_on_panic() {
        let scope = Scope::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        scope
            .add_finalizer_exit(move |exit| {
                assert!(exit.cause().map(|c| c.is_die()).unwrap_or(false));
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            scope.use_scoped(|_| -> Result<(), RequestFailed> { panic!("inside scope") })
        }));

        assert!(outcome.is_err());
        assert!(scope.is_closed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
