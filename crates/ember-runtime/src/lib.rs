//! Ember Runtime - scoped resource lifecycle primitives
//!
//! This crate provides the concurrency and lifecycle building blocks the rest
//! of Ember is written against:
//! - `Fiber<T>` - An interruptible logical thread of control
//! - `Deferred<T>` - A single-assignment completion signal
//! - `Scope` - A finalizer registry with sequential or parallel teardown
//! - `RcMap<K, A, E>` - A reference-counted keyed resource cache
//! - `Mailbox<A, E>` - A bounded queue that ends with an `Exit`
//! - `TimerWheel` / `CallbackPool` - Idle expiry and callback dispatch
//!
//! # Design Goals
//!
//! - Cleanup always runs: finalizers are never dropped, even when offered to
//!   a scope that has already closed
//! - Interruption is an outcome of its own, distinct from typed failures and
//!   defects
//! - Thread-per-fiber as the initial simple implementation; suspension points
//!   are blocking waits that wake on interruption
//!
//! # Example
//!
//! ```rust
//! use ember_runtime::{Exit, RcMap, RcMapOptions, Scope};
//!
//! let app = Scope::new();
//! let map: RcMap<String, usize, String> =
//!     RcMap::make(&app, RcMapOptions::new(|key: &String, _scope: &Scope| Ok(key.len())))
//!         .unwrap();
//!
//! let request = Scope::new();
//! assert_eq!(map.get(&request, "hello".to_string()).unwrap(), 5);
//! request.close(Exit::void()).unwrap();
//! app.close(Exit::void()).unwrap();
//! ```

use std::time::Duration;

pub mod cancel;
pub mod deferred;
pub mod error;
pub mod exit;
pub mod fiber;
pub mod mailbox;
pub mod pool;
pub mod rc_map;
pub mod scope;
pub mod timer;

pub use cancel::CancelToken;
pub use deferred::Deferred;
pub use error::{FiberError, FinalizerError, Interrupted, RcMapError, ScopeClosed};
pub use exit::{AnyError, Cause, Defect, Exit, FiberId, ScopeExit};
pub use fiber::{fork, init, uninterruptible, Fiber, FiberRef};
pub use mailbox::Mailbox;
pub use pool::{global_pool, CallbackPool};
pub use rc_map::{IdleTimeToLive, RcMap, RcMapOptions};
pub use scope::{with_scope, ExecutionStrategy, FinalizerKey, Scope};
pub use timer::{global_timer, schedule_at, schedule_timer, TimerHandle, TimerWheel};

/// Configuration for the runtime.
///
/// Install with [`fiber::init`] before the first fiber is forked; otherwise
/// the defaults are used.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name prefix for fiber threads
    pub thread_name_prefix: String,
    /// Stack size for fiber threads (bytes)
    pub stack_size: Option<usize>,
    /// Tick interval of the global timer wheel
    pub timer_tick: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "ember-fiber".to_string(),
            stack_size: None,
            timer_tick: timer::DEFAULT_TICK_INTERVAL,
        }
    }
}

impl RuntimeConfig {
    /// Create a new runtime configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the stack size for fiber threads.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Set the tick interval of the global timer wheel.
    ///
    /// Idle expiry is accurate to one tick.
    pub fn with_timer_tick(mut self, tick: Duration) -> Self {
        self.timer_tick = tick;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.thread_name_prefix, "ember-fiber");
        assert!(config.stack_size.is_none());
        assert_eq!(config.timer_tick, Duration::from_millis(1));
    }

    #[test]
    fn test_runtime_config_builder() {
        let config = RuntimeConfig::new()
            .with_thread_name_prefix("custom")
            .with_stack_size(1024 * 1024)
            .with_timer_tick(Duration::from_millis(5));

        assert_eq!(config.thread_name_prefix, "custom");
        assert_eq!(config.stack_size, Some(1024 * 1024));
        assert_eq!(config.timer_tick, Duration::from_millis(5));
    }
}
