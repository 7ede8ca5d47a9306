//! Outcomes of fibers, scopes and remote calls.
//!
//! An [`Exit`] is either a success value or a [`Cause`] describing why the
//! computation failed. Causes keep three kinds of failure apart:
//!
//! - `Fail(E)` - a typed, expected error declared by the operation
//! - `Die(Defect)` - an unexpected failure (panic, transport breakdown)
//! - `Interrupt(FiberId)` - the computation was cancelled
//!
//! Independent failures (for example several finalizers failing while a scope
//! closes) are combined with [`Cause::Parallel`] so none of them is lost.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Unique identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Identifier used when no particular fiber is responsible.
    pub const NONE: FiberId = FiberId(0);

    /// Generate a new unique fiber ID.
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        FiberId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild an ID received from elsewhere (e.g. a wire frame).
    pub fn from_raw(raw: u64) -> Self {
        FiberId(raw)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An unexpected failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct Defect {
    message: String,
}

impl Defect {
    /// Create a defect with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Convert a panic payload into a defect, keeping the panic message when
    /// it is a string.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_else(|| "unknown panic".to_string());
        Self { message }
    }

    /// The defect message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for Defect {
    fn from(message: &str) -> Self {
        Defect::new(message)
    }
}

impl From<String> for Defect {
    fn from(message: String) -> Self {
        Defect::new(message)
    }
}

/// Why a computation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag", content = "value", rename_all = "PascalCase")]
pub enum Cause<E> {
    /// Expected, typed failure.
    Fail(E),
    /// Unexpected failure.
    Die(Defect),
    /// Cancellation, attributed to the interrupting fiber.
    Interrupt(FiberId),
    /// Several independent failures.
    Parallel(Vec<Cause<E>>),
}

impl<E> Cause<E> {
    /// Typed failure.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// Unexpected failure.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Cause::Die(defect.into())
    }

    /// Cancellation by `fiber`.
    pub fn interrupt(fiber: FiberId) -> Self {
        Cause::Interrupt(fiber)
    }

    /// Combine every cause into one, flattening nested parallel causes.
    ///
    /// A single cause is returned unchanged.
    pub fn all(causes: impl IntoIterator<Item = Cause<E>>) -> Self {
        let mut flat = Vec::new();
        for cause in causes {
            match cause {
                Cause::Parallel(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or(Cause::Parallel(Vec::new()))
        } else {
            Cause::Parallel(flat)
        }
    }

    /// Parallel composition of two causes.
    pub fn combine(self, other: Cause<E>) -> Self {
        Cause::all([self, other])
    }

    /// All typed failures, in order.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.walk(&mut |cause| {
            if let Cause::Fail(e) = cause {
                out.push(e);
            }
        });
        out
    }

    /// All defects, in order.
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.walk(&mut |cause| {
            if let Cause::Die(d) = cause {
                out.push(d);
            }
        });
        out
    }

    /// Fibers that interrupted the computation.
    pub fn interruptors(&self) -> Vec<FiberId> {
        let mut out = Vec::new();
        self.walk(&mut |cause| {
            if let Cause::Interrupt(id) = cause {
                out.push(*id);
            }
        });
        out
    }

    /// True if the cause contains at least one interruption and nothing else.
    pub fn is_interrupted_only(&self) -> bool {
        let mut interrupts = 0;
        let mut others = 0;
        self.walk(&mut |cause| match cause {
            Cause::Interrupt(_) => interrupts += 1,
            Cause::Parallel(_) => {}
            _ => others += 1,
        });
        interrupts > 0 && others == 0
    }

    /// True if the cause contains a defect.
    pub fn is_die(&self) -> bool {
        !self.defects().is_empty()
    }

    /// True if the cause contains a typed failure.
    pub fn is_failure(&self) -> bool {
        !self.failures().is_empty()
    }

    /// Map the typed failures.
    pub fn map<E2>(self, mut f: impl FnMut(E) -> E2) -> Cause<E2> {
        self.map_inner(&mut f)
    }

    fn map_inner<E2>(self, f: &mut impl FnMut(E) -> E2) -> Cause<E2> {
        match self {
            Cause::Fail(e) => Cause::Fail(f(e)),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Parallel(causes) => {
                Cause::Parallel(causes.into_iter().map(|c| c.map_inner(f)).collect())
            }
        }
    }

    fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Cause<E>)) {
        visit(self);
        if let Cause::Parallel(causes) = self {
            for cause in causes {
                cause.walk(visit);
            }
        }
    }
}

impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Fail(e) => write!(f, "{e}"),
            Cause::Die(d) => write!(f, "defect: {d}"),
            Cause::Interrupt(id) => write!(f, "interrupted by {id}"),
            Cause::Parallel(causes) => {
                write!(f, "[")?;
                for (i, cause) in causes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{cause}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Outcome of a computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag", content = "value", rename_all = "PascalCase")]
pub enum Exit<A, E> {
    /// The computation produced a value.
    Success(A),
    /// The computation failed.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::Fail(error))
    }

    pub fn die(defect: impl Into<Defect>) -> Self {
        Exit::Failure(Cause::die(defect))
    }

    pub fn interrupt(fiber: FiberId) -> Self {
        Exit::Failure(Cause::Interrupt(fiber))
    }

    pub fn failure(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    /// True if the exit is a failure made only of interruptions.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Exit::Failure(cause) if cause.is_interrupted_only())
    }

    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    pub fn map_error<E2>(self, f: impl FnMut(E) -> E2) -> Exit<A, E2> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(cause) => Exit::Failure(cause.map(f)),
        }
    }

    /// Drop the success value.
    pub fn as_void(&self) -> Exit<(), E>
    where
        E: Clone,
    {
        match self {
            Exit::Success(_) => Exit::Success(()),
            Exit::Failure(cause) => Exit::Failure(cause.clone()),
        }
    }

    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(cause) => Err(cause),
        }
    }
}

impl<E> Exit<(), E> {
    /// Successful exit without a value.
    pub fn void() -> Self {
        Exit::Success(())
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::fail(e),
        }
    }
}

/// Type-erased error carried by scope exits.
pub type AnyError = Arc<dyn Error + Send + Sync + 'static>;

/// The exit a scope is closed with and every finalizer observes.
pub type ScopeExit = Exit<(), AnyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_all_flattens() {
        let cause: Cause<&str> = Cause::all([
            Cause::fail("a"),
            Cause::Parallel(vec![Cause::die("b"), Cause::interrupt(FiberId::from_raw(3))]),
        ]);
        match &cause {
            Cause::Parallel(causes) => assert_eq!(causes.len(), 3),
            other => panic!("expected parallel cause, got {:?}", other),
        }
        assert_eq!(cause.failures(), vec![&"a"]);
        assert_eq!(cause.defects(), vec![&Defect::new("b")]);
        assert_eq!(cause.interruptors(), vec![FiberId::from_raw(3)]);
    }

    #[test]
    fn test_cause_all_single() {
        let cause: Cause<()> = Cause::all([Cause::die("only")]);
        assert_eq!(cause, Cause::Die(Defect::new("only")));
    }

    #[test]
    fn test_interrupted_only() {
        let id = FiberId::from_raw(9);
        assert!(Cause::<()>::interrupt(id).is_interrupted_only());
        assert!(Cause::<()>::interrupt(id).combine(Cause::interrupt(id)).is_interrupted_only());
        assert!(!Cause::<()>::interrupt(id).combine(Cause::die("x")).is_interrupted_only());
        assert!(!Cause::<()>::Parallel(vec![]).is_interrupted_only());
    }

    #[test]
    fn test_exit_map_error() {
        let exit: Exit<i32, i32> = Exit::fail(2);
        let mapped = exit.map_error(|e| e * 10);
        assert_eq!(mapped, Exit::fail(20));
        assert!(!mapped.is_interrupted());
    }

    #[test]
    fn test_exit_from_result() {
        let ok: Exit<i32, &str> = Ok(1).into();
        assert_eq!(ok.value(), Some(&1));
        let err: Exit<i32, &str> = Err("bad").into();
        assert_eq!(err.cause(), Some(&Cause::Fail("bad")));
    }

    #[test]
    fn test_defect_from_panic() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(Defect::from_panic(payload).message(), "boom");
    }

    #[test]
    fn test_cause_display() {
        let cause: Cause<String> =
            Cause::fail("bad".to_string()).combine(Cause::interrupt(FiberId::from_raw(1)));
        assert_eq!(cause.to_string(), "[bad, interrupted by #1]");
    }
}
