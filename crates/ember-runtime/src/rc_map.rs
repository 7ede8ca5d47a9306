//! Reference-counted keyed resource maps.
//!
//! An [`RcMap`] lazily acquires one resource per key and shares it between
//! every holder. Each [`get`](RcMap::get) registers a release finalizer in the
//! caller's scope; when the last holder releases, the entry is either closed
//! immediately, kept forever, or evicted after an idle period.
//!
//! # Guarantees
//!
//! - At most one lookup runs per absent key, however many callers race on it
//! - Capacity counts distinct live keys, never holders
//! - An entry's scope is closed exactly once: by eviction, invalidation of an
//!   idle entry, the last release of a detached entry, or map shutdown
//! - Bookkeeping (refcount, table, release registration) is done with
//!   interruption masked; only the wait for the lookup result is
//!   interruptible
//!
//! # Example
//!
//! ```rust
//! use ember_runtime::{Exit, RcMap, RcMapOptions, Scope};
//! use std::time::Duration;
//!
//! let app = Scope::new();
//! let options = RcMapOptions::new(|key: &u32, scope: &Scope| -> Result<String, String> {
//!     scope.add_finalizer(|| println!("connection closed")).unwrap();
//!     Ok(format!("connection-{key}"))
//! })
//! .with_capacity(8)
//! .with_idle_time_to_live(Duration::from_secs(30));
//! let connections = RcMap::make(&app, options).unwrap();
//!
//! let request = Scope::new();
//! assert_eq!(connections.get(&request, 1).unwrap(), "connection-1");
//! request.close(Exit::void()).unwrap();
//! assert!(connections.has(&1));
//!
//! app.close(Exit::void()).unwrap();
//! assert!(!connections.has(&1));
//! ```

use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::deferred::Deferred;
use crate::error::{FinalizerError, RcMapError, ScopeClosed};
use crate::exit::{Cause, Defect, Exit};
use crate::fiber;
use crate::scope::Scope;
use crate::timer::{schedule_timer, TimerHandle};

type Lookup<K, A, E> = Arc<dyn Fn(&K, &Scope) -> Result<A, E> + Send + Sync + 'static>;

/// How long an entry with no holders stays cached.
pub enum IdleTimeToLive<K> {
    /// The same duration for every key. Zero closes entries on last release.
    Fixed(Duration),
    /// Entries stay cached until invalidated or the map shuts down.
    Infinite,
    /// Computed per key when the entry is created; `None` means infinite.
    PerKey(Arc<dyn Fn(&K) -> Option<Duration> + Send + Sync + 'static>),
}

impl<K> IdleTimeToLive<K> {
    fn for_key(&self, key: &K) -> Option<Duration> {
        match self {
            IdleTimeToLive::Fixed(ttl) => Some(*ttl),
            IdleTimeToLive::Infinite => None,
            IdleTimeToLive::PerKey(f) => f(key),
        }
    }
}

impl<K> Clone for IdleTimeToLive<K> {
    fn clone(&self) -> Self {
        match self {
            IdleTimeToLive::Fixed(ttl) => IdleTimeToLive::Fixed(*ttl),
            IdleTimeToLive::Infinite => IdleTimeToLive::Infinite,
            IdleTimeToLive::PerKey(f) => IdleTimeToLive::PerKey(Arc::clone(f)),
        }
    }
}

impl<K> fmt::Debug for IdleTimeToLive<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdleTimeToLive::Fixed(ttl) => f.debug_tuple("Fixed").field(ttl).finish(),
            IdleTimeToLive::Infinite => f.write_str("Infinite"),
            IdleTimeToLive::PerKey(_) => f.write_str("PerKey(..)"),
        }
    }
}

/// Options for [`RcMap::make`].
///
/// Defaults: unbounded capacity, zero idle time to live.
pub struct RcMapOptions<K, A, E> {
    lookup: Lookup<K, A, E>,
    capacity: Option<usize>,
    idle_time_to_live: IdleTimeToLive<K>,
}

impl<K, A, E> RcMapOptions<K, A, E> {
    /// Acquire resources with `lookup`. Resources the lookup acquires should
    /// register their release in the scope it is given.
    pub fn new<F>(lookup: F) -> Self
    where
        F: Fn(&K, &Scope) -> Result<A, E> + Send + Sync + 'static,
    {
        Self {
            lookup: Arc::new(lookup),
            capacity: None,
            idle_time_to_live: IdleTimeToLive::Fixed(Duration::ZERO),
        }
    }

    /// Limit the number of distinct live keys.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_idle_time_to_live(mut self, ttl: Duration) -> Self {
        self.idle_time_to_live = IdleTimeToLive::Fixed(ttl);
        self
    }

    /// Keep idle entries until invalidated or shut down.
    pub fn with_infinite_idle_time(mut self) -> Self {
        self.idle_time_to_live = IdleTimeToLive::Infinite;
        self
    }

    pub fn with_idle_time_to_live_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&K) -> Option<Duration> + Send + Sync + 'static,
    {
        self.idle_time_to_live = IdleTimeToLive::PerKey(Arc::new(f));
        self
    }
}

struct EntryMeta {
    ref_count: usize,
    /// Meaningful only while `timer` is set.
    expires_at: Instant,
    timer: Option<TimerHandle>,
    /// Detached from the map; the last release closes the scope.
    removed: bool,
}

struct Entry<A, E> {
    id: u64,
    deferred: Deferred<Exit<A, E>>,
    scope: Scope,
    idle_time_to_live: Option<Duration>,
    /// Guarded by the map lock as well; always lock the map first.
    meta: Mutex<EntryMeta>,
}

impl<A, E> Entry<A, E>
where
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn new(idle_time_to_live: Option<Duration>) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            deferred: Deferred::new(),
            scope: Scope::new(),
            idle_time_to_live,
            meta: Mutex::new(EntryMeta {
                ref_count: 1,
                expires_at: Instant::now(),
                timer: None,
                removed: false,
            }),
        }
    }

    fn close(&self) -> Result<(), FinalizerError> {
        trace!(entry = self.id, "closing entry scope");
        self.scope.close(Exit::void())
    }
}

enum MapState<K, A, E> {
    Open(FxHashMap<K, Arc<Entry<A, E>>>),
    Closed,
}

struct RcMapInner<K, A, E> {
    lookup: Lookup<K, A, E>,
    capacity: Option<usize>,
    idle_time_to_live: IdleTimeToLive<K>,
    state: Mutex<MapState<K, A, E>>,
}

/// A reference-counted map of lazily acquired resources.
///
/// `RcMap` is a shared handle; clones refer to the same map.
pub struct RcMap<K, A, E> {
    inner: Arc<RcMapInner<K, A, E>>,
}

impl<K, A, E> Clone for RcMap<K, A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, A, E> RcMap<K, A, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create a map tied to `scope`: when the scope closes, the map shuts
    /// down and closes every entry.
    ///
    /// If `scope` is already closed the map is created shut down and
    /// `Err(ScopeClosed)` is returned.
    pub fn make(scope: &Scope, options: RcMapOptions<K, A, E>) -> Result<Self, ScopeClosed> {
        let map = Self {
            inner: Arc::new(RcMapInner {
                lookup: options.lookup,
                capacity: options.capacity,
                idle_time_to_live: options.idle_time_to_live,
                state: Mutex::new(MapState::Open(FxHashMap::default())),
            }),
        };
        let shutdown = map.clone();
        scope.register(Box::new(move |_| shutdown.shutdown()))?;
        Ok(map)
    }

    /// Get the resource for `key`, acquiring it if no entry exists.
    ///
    /// The resource is held until `scope` closes. Concurrent callers on the
    /// same absent key share a single lookup.
    pub fn get(&self, scope: &Scope, key: K) -> Result<A, RcMapError<E>> {
        let entry = fiber::uninterruptible(|| self.acquire(scope, key))?;
        match entry.deferred.wait() {
            Ok(exit) => into_result(exit),
            Err(interrupted) => Err(RcMapError::Interrupted(interrupted.0)),
        }
    }

    fn acquire(&self, scope: &Scope, key: K) -> Result<Arc<Entry<A, E>>, RcMapError<E>> {
        let (entry, created) = {
            let mut state = self.inner.state.lock();
            let map = match &mut *state {
                MapState::Open(map) => map,
                MapState::Closed => return Err(RcMapError::Closed),
            };
            match map.get(&key) {
                Some(entry) => {
                    entry.meta.lock().ref_count += 1;
                    (Arc::clone(entry), false)
                }
                None => {
                    if let Some(capacity) = self.inner.capacity {
                        if map.len() >= capacity {
                            return Err(RcMapError::ExceededCapacity { capacity });
                        }
                    }
                    let entry = Arc::new(Entry::new(self.inner.idle_time_to_live.for_key(&key)));
                    map.insert(key.clone(), Arc::clone(&entry));
                    (entry, true)
                }
            }
        };

        if created {
            debug!(key = ?key, entry = entry.id, "acquiring entry");
            self.start_lookup(key.clone(), &entry);
        }

        let map = self.clone();
        let held = Arc::clone(&entry);
        scope
            .register(Box::new(move |_| map.release(&key, &held)))
            .map_err(|ScopeClosed| RcMapError::Closed)?;
        Ok(entry)
    }

    fn start_lookup(&self, key: K, entry: &Arc<Entry<A, E>>) {
        let lookup = Arc::clone(&self.inner.lookup);
        let scope = entry.scope.clone();
        let deferred = entry.deferred.clone();
        let lookup_fiber = fiber::fork(move || {
            let exit = match panic::catch_unwind(AssertUnwindSafe(|| lookup(&key, &scope))) {
                Ok(result) => Exit::from(result),
                Err(payload) => Exit::die(Defect::from_panic(payload)),
            };
            deferred.complete(exit);
        });

        // Closing the entry before the lookup finishes interrupts it and
        // releases anyone still waiting.
        let lookup_ref = lookup_fiber.fiber_ref().clone();
        let deferred = entry.deferred.clone();
        let registered = entry.scope.add_finalizer(move || {
            if !lookup_fiber.is_finished() {
                lookup_fiber.interrupt();
                if let Err(err) = lookup_fiber.join() {
                    trace!(error = %err, "lookup fiber ended abnormally");
                }
            }
            deferred.complete(Exit::interrupt(lookup_fiber.id()));
        });
        if registered.is_err() {
            trace!(entry = entry.id, "entry closed before lookup was tracked");
            lookup_ref.interrupt();
            entry.deferred.complete(Exit::interrupt(lookup_ref.id()));
        }
    }

    fn release(&self, key: &K, entry: &Arc<Entry<A, E>>) -> Result<(), FinalizerError> {
        let mut state = self.inner.state.lock();
        let mut meta = entry.meta.lock();
        meta.ref_count = meta.ref_count.saturating_sub(1);
        if meta.ref_count > 0 {
            return Ok(());
        }

        if meta.removed || matches!(*state, MapState::Closed) {
            meta.removed = true;
            drop(meta);
            drop(state);
            return entry.close();
        }

        match entry.idle_time_to_live {
            None => Ok(()),
            Some(ttl) if ttl.is_zero() => {
                if let MapState::Open(map) = &mut *state {
                    map.remove(key);
                }
                meta.removed = true;
                drop(meta);
                drop(state);
                debug!(key = ?key, entry = entry.id, "released entry");
                entry.close()
            }
            Some(ttl) => {
                // A deadline past the clock's range never arrives.
                let Some(expires_at) = Instant::now().checked_add(ttl) else {
                    trace!(key = ?key, entry = entry.id, "idle time out of range, keeping entry");
                    return Ok(());
                };
                meta.expires_at = expires_at;
                if meta.timer.is_none() {
                    meta.timer = Some(self.schedule_expiry(key.clone(), entry, ttl));
                }
                Ok(())
            }
        }
    }

    fn schedule_expiry(&self, key: K, entry: &Arc<Entry<A, E>>, delay: Duration) -> TimerHandle {
        let map = Arc::downgrade(&self.inner);
        let entry = Arc::downgrade(entry);
        schedule_timer(delay, move || expire(map, key, entry))
    }

    /// Remove `key` from the map.
    ///
    /// An idle entry is closed now; an entry that is still held is detached
    /// and closed by its last release.
    pub fn invalidate(&self, key: &K) -> Result<(), FinalizerError> {
        let entry = {
            let mut state = self.inner.state.lock();
            let MapState::Open(map) = &mut *state else {
                return Ok(());
            };
            let Some(entry) = map.remove(key) else {
                return Ok(());
            };
            let mut meta = entry.meta.lock();
            meta.removed = true;
            if let Some(timer) = meta.timer.take() {
                timer.cancel();
            }
            if meta.ref_count > 0 {
                debug!(key = ?key, entry = entry.id, holders = meta.ref_count, "detached entry");
                return Ok(());
            }
            drop(meta);
            entry
        };
        debug!(key = ?key, entry = entry.id, "invalidated entry");
        entry.close()
    }

    /// Push back the idle expiry of `key`.
    ///
    /// No-op if the key is absent, the map is closed, or the key's idle time
    /// is zero, infinite or too long to represent as a deadline.
    pub fn touch(&self, key: &K) {
        let state = self.inner.state.lock();
        let MapState::Open(map) = &*state else {
            return;
        };
        if let Some(entry) = map.get(key) {
            let ttl = entry.idle_time_to_live.filter(|ttl| !ttl.is_zero());
            if let Some(expires_at) = ttl.and_then(|ttl| Instant::now().checked_add(ttl)) {
                entry.meta.lock().expires_at = expires_at;
            }
        }
    }

    /// Snapshot of the live keys.
    pub fn keys(&self) -> Result<Vec<K>, RcMapError<E>> {
        match &*self.inner.state.lock() {
            MapState::Open(map) => Ok(map.keys().cloned().collect()),
            MapState::Closed => Err(RcMapError::Closed),
        }
    }

    pub fn has(&self, key: &K) -> bool {
        match &*self.inner.state.lock() {
            MapState::Open(map) => map.contains_key(key),
            MapState::Closed => false,
        }
    }

    /// Number of holders of `key`, if it is live.
    pub fn ref_count(&self, key: &K) -> Option<usize> {
        match &*self.inner.state.lock() {
            MapState::Open(map) => map.get(key).map(|entry| entry.meta.lock().ref_count),
            MapState::Closed => None,
        }
    }

    /// Number of live keys; zero once the map is closed.
    pub fn len(&self) -> usize {
        match &*self.inner.state.lock() {
            MapState::Open(map) => map.len(),
            MapState::Closed => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.state.lock(), MapState::Closed)
    }

    fn shutdown(&self) -> Result<(), FinalizerError> {
        let entries = {
            let mut state = self.inner.state.lock();
            match std::mem::replace(&mut *state, MapState::Closed) {
                MapState::Open(map) => map,
                MapState::Closed => return Ok(()),
            }
        };
        debug!(entries = entries.len(), "shutting down resource map");

        let failures = entries.into_values().filter_map(|entry| {
            {
                let mut meta = entry.meta.lock();
                meta.removed = true;
                if let Some(timer) = meta.timer.take() {
                    timer.cancel();
                }
            }
            entry.close().err()
        });
        match FinalizerError::merge(failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Expiry timer callback: evict the entry, or re-arm if its deadline moved.
fn expire<K, A, E>(map: Weak<RcMapInner<K, A, E>>, key: K, entry: Weak<Entry<A, E>>)
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let (Some(inner), Some(entry)) = (map.upgrade(), entry.upgrade()) else {
        return;
    };
    let map = RcMap { inner };

    let evicted = {
        let mut state = map.inner.state.lock();
        let mut meta = entry.meta.lock();
        meta.timer = None;
        let MapState::Open(table) = &mut *state else {
            return;
        };
        if meta.removed || meta.ref_count > 0 {
            return;
        }
        let now = Instant::now();
        if meta.expires_at > now {
            let remaining = meta.expires_at - now;
            meta.timer = Some(map.schedule_expiry(key, &entry, remaining));
            return;
        }
        table.remove(&key);
        meta.removed = true;
        drop(meta);
        entry
    };

    debug!(key = ?key, entry = evicted.id, "evicted idle entry");
    if let Err(err) = evicted.close() {
        warn!(key = ?key, error = %err, "finalizers failed while evicting entry");
    }
}

fn into_result<A, E>(exit: Exit<A, E>) -> Result<A, RcMapError<E>> {
    match exit {
        Exit::Success(value) => Ok(value),
        Exit::Failure(cause) => Err(from_cause(cause)),
    }
}

fn from_cause<E>(cause: Cause<E>) -> RcMapError<E> {
    match cause {
        Cause::Fail(error) => RcMapError::Lookup(error),
        Cause::Die(defect) => RcMapError::Defect(defect),
        Cause::Interrupt(fiber) => RcMapError::Interrupted(fiber),
        Cause::Parallel(causes) => causes
            .into_iter()
            .next()
            .map(from_cause)
            .unwrap_or_else(|| RcMapError::Defect(Defect::new("empty cause"))),
    }
}

impl<K, A, E> fmt::Debug for RcMap<K, A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (closed, len) = match &*self.inner.state.lock() {
            MapState::Open(map) => (false, map.len()),
            MapState::Closed => (true, 0),
        };
        f.debug_struct("RcMap")
            .field("capacity", &self.inner.capacity)
            .field("idle_time_to_live", &self.inner.idle_time_to_live)
            .field("len", &len)
            .field("closed", &closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_map(
        app: &Scope,
        ttl: Duration,
    ) -> (RcMap<&'static str, String, String>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let lookups = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let (lookups_clone, releases_clone) = (Arc::clone(&lookups), Arc::clone(&releases));
        let options = RcMapOptions::new(move |key: &&'static str, scope: &Scope| {
            lookups_clone.fetch_add(1, Ordering::SeqCst);
            let releases = Arc::clone(&releases_clone);
            scope
                .add_finalizer(move || {
                    releases.fetch_add(1, Ordering::SeqCst);
                })
                .map_err(|err| err.to_string())?;
            Ok(key.to_uppercase())
        })
        .with_idle_time_to_live(ttl);
        (RcMap::make(app, options).unwrap(), lookups, releases)
    }

    #[test]
    fn test_get_shares_entry_between_holders() {
        let app = Scope::new();
        let (map, lookups, releases) = counting_map(&app, Duration::ZERO);
        let first = Scope::new();
        let second = Scope::new();

        assert_eq!(map.get(&first, "a").unwrap(), "A");
        assert_eq!(map.get(&second, "a").unwrap(), "A");
        assert_eq!(map.ref_count(&"a"), Some(2));
        assert_eq!(lookups.load(Ordering::SeqCst), 1);

        first.close(Exit::void()).unwrap();
        assert_eq!(map.ref_count(&"a"), Some(1));
        second.close(Exit::void()).unwrap();
        assert!(!map.has(&"a"));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_infinite_idle_time_keeps_entry() {
        let app = Scope::new();
        let options = RcMapOptions::new(|key: &u8, _: &Scope| -> Result<u8, String> { Ok(*key) })
            .with_infinite_idle_time();
        let map = RcMap::make(&app, options).unwrap();

        let holder = Scope::new();
        map.get(&holder, 1).unwrap();
        holder.close(Exit::void()).unwrap();

        assert_eq!(map.ref_count(&1), Some(0));
        assert_eq!(map.keys().unwrap(), vec![1]);
    }

    #[test]
    fn test_unrepresentable_idle_time_keeps_entry() {
        let app = Scope::new();
        let (map, _, releases) = counting_map(&app, Duration::MAX);
        let holder = Scope::new();
        map.get(&holder, "a").unwrap();

        map.touch(&"a");
        assert_eq!(holder.close(Exit::void()), Ok(()));
        map.touch(&"a");

        assert!(map.has(&"a"));
        assert_eq!(map.ref_count(&"a"), Some(0));
        assert_eq!(releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_closing_map_interrupts_running_lookup() {
        let app = Scope::new();
        let gate: Deferred<()> = Deferred::new();
        let lookup_gate = gate.clone();
        let started: Deferred<()> = Deferred::new();
        let lookup_started = started.clone();
        let options = RcMapOptions::new(move |key: &u8, _: &Scope| -> Result<u8, String> {
            lookup_started.complete(());
            lookup_gate.wait().map_err(|_| "interrupted".to_string())?;
            Ok(*key)
        });
        let map = RcMap::make(&app, options).unwrap();

        let holder = Scope::new();
        let waiter = {
            let map = map.clone();
            let holder = holder.clone();
            fiber::fork(move || map.get(&holder, 1))
        };
        assert_eq!(started.wait_timeout(Duration::from_secs(2)), Ok(Some(())));
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(app.close(Exit::void()), Ok(()));
        assert_eq!(
            waiter.join().unwrap(),
            Err(RcMapError::Lookup("interrupted".to_string()))
        );
        assert!(!gate.is_done());
    }

    #[test]
    fn test_idle_entry_expires() {
        let app = Scope::new();
        let (map, _, releases) = counting_map(&app, Duration::from_millis(30));
        let holder = Scope::new();
        map.get(&holder, "a").unwrap();
        holder.close(Exit::void()).unwrap();

        assert!(map.has(&"a"));
        std::thread::sleep(Duration::from_millis(200));
        assert!(!map.has(&"a"));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reacquire_cancels_pending_expiry() {
        let app = Scope::new();
        let (map, lookups, _) = counting_map(&app, Duration::from_millis(30));
        let holder = Scope::new();
        map.get(&holder, "a").unwrap();
        holder.close(Exit::void()).unwrap();

        let again = Scope::new();
        map.get(&again, "a").unwrap();
        std::thread::sleep(Duration::from_millis(150));

        assert!(map.has(&"a"));
        assert_eq!(lookups.load(Ordering::SeqCst), 1);
        again.close(Exit::void()).unwrap();
    }

    #[test]
    fn test_invalidate_held_entry_detaches() {
        let app = Scope::new();
        let (map, lookups, releases) = counting_map(&app, Duration::from_secs(60));
        let holder = Scope::new();
        map.get(&holder, "a").unwrap();

        map.invalidate(&"a").unwrap();
        assert!(!map.has(&"a"));
        assert_eq!(releases.load(Ordering::SeqCst), 0);

        holder.close(Exit::void()).unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);

        let next = Scope::new();
        map.get(&next, "a").unwrap();
        assert_eq!(lookups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalidate_idle_entry_closes_now() {
        let app = Scope::new();
        let (map, _, releases) = counting_map(&app, Duration::from_secs(60));
        let holder = Scope::new();
        map.get(&holder, "a").unwrap();
        holder.close(Exit::void()).unwrap();

        map.invalidate(&"a").unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lookup_failure_and_panic() {
        let app = Scope::new();
        let options = RcMapOptions::new(|key: &i32, _: &Scope| -> Result<i32, String> {
            match key {
                0 => Err("zero".to_string()),
                1 => panic!("lookup exploded"),
                n => Ok(*n),
            }
        });
        let map = RcMap::make(&app, options).unwrap();
        let holder = Scope::new();

        assert_eq!(map.get(&holder, 0), Err(RcMapError::Lookup("zero".to_string())));
        match map.get(&holder, 1) {
            Err(RcMapError::Defect(defect)) => assert_eq!(defect.message(), "lookup exploded"),
            other => panic!("expected Defect, got {:?}", other),
        }
        assert_eq!(map.get(&holder, 2), Ok(2));
    }

    #[test]
    fn test_get_with_closed_scope_releases() {
        let app = Scope::new();
        let (map, _, releases) = counting_map(&app, Duration::ZERO);
        let holder = Scope::new();
        holder.close(Exit::void()).unwrap();

        assert_eq!(map.get(&holder, "a"), Err(RcMapError::Closed));
        assert!(!map.has(&"a"));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_closes_entries() {
        let app = Scope::new();
        let (map, _, releases) = counting_map(&app, Duration::from_secs(60));
        let holder = Scope::new();
        map.get(&holder, "a").unwrap();
        map.get(&holder, "b").unwrap();

        app.close(Exit::void()).unwrap();
        assert!(map.is_closed());
        assert_eq!(releases.load(Ordering::SeqCst), 2);
        assert_eq!(map.get(&holder, "c"), Err(RcMapError::Closed));
        assert_eq!(map.keys(), Err(RcMapError::Closed));

        // Releasing after shutdown does not close anything twice.
        holder.close(Exit::void()).unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_make_on_closed_scope() {
        let app = Scope::new();
        app.close(Exit::void()).unwrap();
        let options = RcMapOptions::new(|_: &u8, _: &Scope| -> Result<u8, String> { Ok(0) });
        assert!(RcMap::make(&app, options).is_err());
    }

    #[test]
    fn test_per_key_idle_time() {
        let app = Scope::new();
        let options = RcMapOptions::new(|key: &u64, _: &Scope| -> Result<u64, String> { Ok(*key) })
            .with_idle_time_to_live_fn(|key| if *key == 0 { None } else { Some(Duration::ZERO) });
        let map = RcMap::make(&app, options).unwrap();

        let holder = Scope::new();
        map.get(&holder, 0).unwrap();
        map.get(&holder, 1).unwrap();
        holder.close(Exit::void()).unwrap();

        assert!(map.has(&0));
        assert!(!map.has(&1));
    }
}
