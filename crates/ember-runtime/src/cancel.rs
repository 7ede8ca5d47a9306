//! Cooperative cancellation tokens.
//!
//! Every fiber owns a [`CancelToken`]. Interrupting a fiber cancels its token;
//! the fiber notices at its next suspension point. Blocked waiters register a
//! listener so that cancellation wakes them instead of leaving them parked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type Listener = Box<dyn FnOnce() + Send + 'static>;

struct Listeners {
    next_key: u64,
    entries: Vec<(u64, Listener)>,
}

struct TokenInner {
    cancelled: AtomicBool,
    listeners: Mutex<Listeners>,
}

/// A token for cooperative cancellation.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

/// Key returned by [`CancelToken::on_cancel`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerKey(u64);

impl CancelToken {
    /// Create a new cancel token (not cancelled).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                listeners: Mutex::new(Listeners {
                    next_key: 0,
                    entries: Vec::new(),
                }),
            }),
        }
    }

    /// Check if cancellation has been requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation and run every registered listener.
    ///
    /// Returns `true` if this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let listeners = std::mem::take(&mut self.inner.listeners.lock().entries);
        for (_, listener) in listeners {
            listener();
        }
        true
    }

    /// Register a listener to run on cancellation.
    ///
    /// If the token is already cancelled the listener runs immediately on the
    /// calling thread and `None` is returned.
    pub fn on_cancel<F>(&self, listener: F) -> Option<ListenerKey>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut listeners = self.inner.listeners.lock();
        if self.is_cancelled() {
            drop(listeners);
            listener();
            return None;
        }
        let key = listeners.next_key;
        listeners.next_key += 1;
        listeners.entries.push((key, Box::new(listener)));
        Some(ListenerKey(key))
    }

    /// Remove a listener that has not run yet.
    pub fn remove_listener(&self, key: ListenerKey) {
        self.inner
            .listeners
            .lock()
            .entries
            .retain(|(k, _)| *k != key.0);
    }

    /// Number of listeners waiting for cancellation.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().entries.len()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_only_first_cancel_wins_across_clones() {
        let fiber_token = CancelToken::new();
        let interruptor_view = fiber_token.clone();
        assert!(!interruptor_view.is_cancelled());

        assert!(interruptor_view.cancel());
        assert!(fiber_token.is_cancelled());
        assert!(!fiber_token.cancel());
    }

    #[test]
    fn test_listener_runs_once_on_cancel() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);

        token.on_cancel(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        token.cancel();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(token.listener_count(), 0);
    }

    #[test]
    fn test_listener_after_cancel_runs_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let key = token.on_cancel(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(key.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_listener_does_not_run() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);

        let key = token
            .on_cancel(move || {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        token.remove_listener(key);
        token.cancel();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
