//! Error types for the Ember runtime.

use std::time::Duration;

use thiserror::Error;

use crate::exit::{Cause, Defect, FiberId};

/// Errors that can occur when joining a fiber or pooled task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FiberError {
    /// The joining fiber was interrupted while waiting.
    #[error("join interrupted by fiber {0}")]
    Interrupted(FiberId),

    /// The fiber panicked during execution.
    #[error("fiber panicked: {0}")]
    Panicked(String),

    /// The underlying thread could not be started.
    #[error("failed to spawn fiber: {0}")]
    SpawnFailed(String),

    /// The operation timed out.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

/// A suspended fiber observed an interruption request.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("interrupted by fiber {0}")]
pub struct Interrupted(pub FiberId);

/// A finalizer was offered to a scope that had already closed.
///
/// The finalizer has been run against the scope's recorded exit before this
/// error is returned.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("scope is already closed")]
pub struct ScopeClosed;

/// One or more finalizers failed while a scope closed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{} finalizer(s) failed: {}", .defects.len(), join_messages(.defects))]
pub struct FinalizerError {
    defects: Vec<Defect>,
}

impl FinalizerError {
    pub(crate) fn new(defects: Vec<Defect>) -> Self {
        Self { defects }
    }

    /// The defects raised by the failing finalizers, in execution order for
    /// sequential scopes.
    pub fn defects(&self) -> &[Defect] {
        &self.defects
    }

    /// Merge the defects of several close operations.
    pub fn merge(errors: impl IntoIterator<Item = FinalizerError>) -> Option<FinalizerError> {
        let defects: Vec<Defect> = errors.into_iter().flat_map(|e| e.defects).collect();
        if defects.is_empty() {
            None
        } else {
            Some(FinalizerError { defects })
        }
    }

    /// The failures as a parallel cause of defects.
    pub fn into_cause<E>(self) -> Cause<E> {
        Cause::all(self.defects.into_iter().map(Cause::Die))
    }
}

fn join_messages(defects: &[Defect]) -> String {
    defects
        .iter()
        .map(Defect::message)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors returned by [`RcMap::get`](crate::rc_map::RcMap::get).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RcMapError<E> {
    /// The map has shut down, or the caller's scope was already closed.
    #[error("resource map is closed")]
    Closed,

    /// A new key was requested while `capacity` keys were live.
    #[error("exceeded capacity of {capacity} entries")]
    ExceededCapacity { capacity: usize },

    /// The lookup for the key failed.
    #[error("lookup failed: {0}")]
    Lookup(E),

    /// The calling fiber was interrupted while waiting for the resource, or
    /// the acquiring fiber was interrupted during lookup.
    #[error("interrupted by fiber {0}")]
    Interrupted(FiberId),

    /// The lookup panicked.
    #[error("lookup died: {0}")]
    Defect(Defect),
}

impl<E> RcMapError<E> {
    /// True for the failures that mean "unavailable" rather than an
    /// application error.
    pub fn is_interruption(&self) -> bool {
        matches!(self, RcMapError::Closed | RcMapError::Interrupted(_))
    }
}
