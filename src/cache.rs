//! Provides the cache itself, which is a registry of named values which are periodically
//! recomputed.
//!
//! Each value is maintained by a task which is registered via [IntervalCache::every] or
//! [IntervalCache::once]. Once the [scheduler](crate::scheduler) has been started, it checks
//! once per tick which tasks are due and refreshes them concurrently by invoking their
//! [Producer](crate::task::Producer).
//!
//! Reading a value via [IntervalCache::get] never blocks on a refresh, it simply returns the last
//! committed value. Values can also be written synchronously using [IntervalCache::set] or
//! [IntervalCache::update]. Such a write always wins over a refresh which was running at the same
//! time: the result of the refresh is discarded (see [refresh](crate::refresh) for details).
//!
//! # Examples
//!
//! ```
//! # use interval_cache::cache::IntervalCache;
//! # use interval_cache::clock::ManualClock;
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let clock = ManualClock::new();
//! let cache = IntervalCache::with_clock(clock.clone());
//!
//! cache.every(
//!     "visits",
//!     Duration::from_secs(1),
//!     |previous: i32| async move { Ok(previous + 1) },
//!     0,
//! )?;
//!
//! // The seed is available right away...
//! assert_eq!(cache.get("visits"), Some(0));
//!
//! // Each tick refreshes all due tasks (the scheduler would do this every second)...
//! clock.advance(Duration::from_secs(1));
//! let _ = cache.tick().await;
//! assert_eq!(cache.get("visits"), Some(1));
//!
//! // Synchronous writes are visible immediately...
//! cache.set("visits", 99)?;
//! assert_eq!(cache.get("visits"), Some(99));
//!
//! // Unknown keys are simply absent...
//! assert_eq!(cache.get("unknown"), None);
//! # Ok(())
//! # }
//! ```
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::error::CacheResult;
use crate::refresh::InFlight;
use crate::registry::{DueTasks, Registry};
use crate::stats::TaskInfo;
use crate::task::{Producer, Schedule};

/// Contains a set of named values which are refreshed on a schedule.
///
/// A cache is most probably created once during startup and then shared as **Arc**, as the
/// scheduler needs a reference to it. Note that values are cloned when being read, therefore
/// large values should be wrapped in an **Arc** themselves.
pub struct IntervalCache<V> {
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) registry: Registry<V>,
    pub(crate) in_flight: InFlight,
    pub(crate) scheduler: Mutex<Option<CancellationToken>>,
}

impl<V: Clone + Send + Sync + 'static> IntervalCache<V> {
    /// Creates a new and empty cache which uses the system clock.
    pub fn new() -> Arc<Self> {
        IntervalCache::with_clock(SystemClock::new())
    }

    /// Creates a new and empty cache which uses the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(IntervalCache {
            clock,
            registry: Registry::new(),
            in_flight: InFlight::default(),
            scheduler: Mutex::new(None),
        })
    }

    /// Returns the clock used by this cache.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Registers a task which is refreshed whenever the given interval has elapsed.
    ///
    /// The task holds the given seed until its first refresh, which happens on the next tick of
    /// the scheduler.
    ///
    /// # Errors
    /// Fails if a task with the same key is already present.
    pub fn every<F, Fut>(
        &self,
        key: &str,
        interval: Duration,
        producer: F,
        seed: V,
    ) -> CacheResult<&Self>
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.register(key, Schedule::Every(interval), Arc::new(producer), seed)
    }

    /// Registers a task which is computed once on the next tick of the scheduler.
    ///
    /// If this first computation fails, it is retried on the following ticks until a value has
    /// been produced. A synchronous write also counts as produced value.
    ///
    /// # Errors
    /// Fails if a task with the same key is already present.
    pub fn once<F, Fut>(&self, key: &str, producer: F, seed: V) -> CacheResult<&Self>
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.register(key, Schedule::Once, Arc::new(producer), seed)
    }

    /// Registers a task with the given schedule and producer.
    ///
    /// This is the general form of [every](IntervalCache::every) and
    /// [once](IntervalCache::once) which can be used if the producer is a struct implementing
    /// [Producer] rather than a closure.
    ///
    /// # Errors
    /// Fails if a task with the same key is already present.
    pub fn register(
        &self,
        key: &str,
        schedule: Schedule,
        producer: Arc<dyn Producer<V>>,
        seed: V,
    ) -> CacheResult<&Self> {
        self.registry.register(key, schedule, producer, seed)?;
        log::debug!("Registered cache task {} ({}).", key, schedule);
        Ok(self)
    }

    /// Removes the task with the given key and returns its last value.
    ///
    /// A refresh of this task which is still running will discard its result.
    ///
    /// # Errors
    /// Fails if no task with the given key is present.
    pub fn remove(&self, key: &str) -> CacheResult<V> {
        let value = self.registry.remove(key)?;
        log::debug!("Removed cache task {}.", key);
        Ok(value)
    }

    /// Returns the current value of the given task or **None** if the key is unknown.
    pub fn get(&self, key: &str) -> Option<V> {
        self.registry.get(key)
    }

    /// Determines if a task with the given key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.registry.contains(key)
    }

    /// Returns the keys of all tasks in alphabetical order.
    pub fn keys(&self) -> Vec<String> {
        self.registry.keys()
    }

    /// Returns the number of tasks.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Determines if no tasks are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Immediately replaces the value of the given task.
    ///
    /// This also resets the interval of the task, therefore its next refresh happens once the
    /// interval has elapsed from now on. A refresh which is running while this is called will
    /// discard its result.
    ///
    /// # Errors
    /// Fails if no task with the given key is present.
    pub fn set(&self, key: &str, value: V) -> CacheResult<&Self> {
        self.registry.set(key, value, self.clock.now())?;
        log::debug!("Updated cache key {}.", key);
        Ok(self)
    }

    /// Replaces the value of the given task by applying the given transformation on its current
    /// value. Returns the new value.
    ///
    /// Reading and writing the value is performed atomically, therefore a refresh can not sneak
    /// in between. However, the transformation runs while the cache is locked, so it must not
    /// access this cache itself.
    ///
    /// # Errors
    /// Fails if no task with the given key is present.
    pub fn update<F>(&self, key: &str, transform: F) -> CacheResult<V>
    where
        F: FnOnce(&V) -> V,
    {
        let value = self.registry.update(key, transform, self.clock.now())?;
        log::debug!("Updated cache key {} via a transformation.", key);
        Ok(value)
    }

    /// Lazily enumerates the keys of all tasks which are due at the given timestamp.
    pub fn list_due(&self, now: crate::clock::Timestamp) -> DueTasks {
        self.registry.list_due(now)
    }

    /// Determines if a refresh of the given task is currently running.
    pub fn is_refreshing(&self, key: &str) -> bool {
        self.in_flight.contains(key)
    }

    /// Returns the state and metrics of all tasks, sorted by key.
    pub fn stats(&self) -> Vec<TaskInfo> {
        let mut infos = self.registry.infos();
        for info in infos.iter_mut() {
            info.refreshing = self.in_flight.contains(&info.key);
        }

        infos
    }
}
