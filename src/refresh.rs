//! Recomputes the value of a task while guarding against concurrent writes.
//!
//! A refresh invokes the [Producer](crate::task::Producer) of a task with its current value and
//! stores the result. As producers are async (and most probably slow, as they fetch data from
//! somewhere else), two things need to be taken care of:
//!
//! * **Single flight**: At most one refresh per key runs at any given time. A key which is being
//!   refreshed is kept in the in-flight set. A second refresh of the same key doesn't wait for the
//!   first one, it simply bails out and reports [RefreshOutcome::InFlight]. Keys are removed from
//!   the set by a guard, therefore this also happens if the producer panics or if the refresh
//!   future is dropped.
//! * **Synchronous writes win**: The producer runs without holding any lock. If the value of the
//!   task is written via [set](crate::cache::IntervalCache::set) or
//!   [update](crate::cache::IntervalCache::update) in the meantime, the result of the producer
//!   has been computed based on stale data. It is therefore discarded and the refresh reports
//!   [RefreshOutcome::Superseded].
//!
//! A failing producer never affects the caller. The error is logged and recorded in the metrics
//! of the task and the previous value is kept.
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::FutureExt;

#[cfg(test)]
use mock_instant::global::Instant;
#[cfg(not(test))]
use std::time::Instant;

use crate::cache::IntervalCache;
use crate::error::{CacheError, CacheResult};
use crate::registry::Reconciliation;

/// Describes the result of a refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome<V> {
    /// The producer computed a new value which has been stored.
    Refreshed(V),

    /// The producer failed. The previous value, which has been kept, is returned.
    Failed(V),

    /// The value was written (or the task was removed) while the producer was running. The
    /// computed value has been discarded and the current value (or the discarded one if the task
    /// is gone) is returned.
    Superseded(V),

    /// Another refresh of the same key is currently running, so nothing happened.
    InFlight,
}

impl<V> RefreshOutcome<V> {
    /// Returns the value reported by this outcome (if any).
    pub fn value(&self) -> Option<&V> {
        match self {
            RefreshOutcome::Refreshed(value)
            | RefreshOutcome::Failed(value)
            | RefreshOutcome::Superseded(value) => Some(value),
            RefreshOutcome::InFlight => None,
        }
    }

    /// Consumes the outcome and returns its value (if any).
    pub fn into_value(self) -> Option<V> {
        match self {
            RefreshOutcome::Refreshed(value)
            | RefreshOutcome::Failed(value)
            | RefreshOutcome::Superseded(value) => Some(value),
            RefreshOutcome::InFlight => None,
        }
    }

    /// Determines if a new value has been stored.
    pub fn is_refreshed(&self) -> bool {
        matches!(self, RefreshOutcome::Refreshed(_))
    }
}

/// Keeps the keys which are currently being refreshed.
#[derive(Default)]
pub(crate) struct InFlight {
    keys: Mutex<HashSet<String>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the given key as being refreshed.
    ///
    /// Returns **None** if the key is already marked. Otherwise, the key remains marked until the
    /// returned guard is dropped.
    pub(crate) fn acquire<'a>(&'a self, key: &str) -> Option<RefreshGuard<'a>> {
        if self.lock().insert(key.to_owned()) {
            Some(RefreshGuard {
                in_flight: self,
                key: key.to_owned(),
            })
        } else {
            None
        }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }
}

/// Removes its key from the in-flight set once dropped.
pub(crate) struct RefreshGuard<'a> {
    in_flight: &'a InFlight,
    key: String,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        let _ = self.in_flight.lock().remove(&self.key);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

impl<V: Clone + Send + Sync + 'static> IntervalCache<V> {
    /// Recomputes the value of the given task by invoking its producer.
    ///
    /// This is what the scheduler does for each due task, but it can also be invoked manually to
    /// force a refresh. Note that the schedule of the task is not consulted.
    ///
    /// # Errors
    /// Fails if no task with the given key is present. A failing producer is not reported as
    /// error but as [RefreshOutcome::Failed].
    ///
    /// # Examples
    ///
    /// ```
    /// # use interval_cache::cache::IntervalCache;
    /// # use interval_cache::refresh::RefreshOutcome;
    /// # #[tokio::main]
    /// # async fn main() -> anyhow::Result<()> {
    /// let cache = IntervalCache::new();
    /// cache.once("answer", |_| async move { Ok(42) }, 0)?;
    ///
    /// assert_eq!(cache.refresh("answer").await?, RefreshOutcome::Refreshed(42));
    /// assert_eq!(cache.get("answer"), Some(42));
    /// # Ok(())
    /// # }
    /// ```
    pub async fn refresh(&self, key: &str) -> CacheResult<RefreshOutcome<V>> {
        let snapshot = self
            .registry
            .snapshot(key)
            .ok_or_else(|| CacheError::UnknownKey(key.to_owned()))?;

        let guard = match self.in_flight.acquire(key) {
            Some(guard) => guard,
            None => {
                log::debug!("Skipping refresh of {} as it is already in flight.", key);
                snapshot.metrics.record_skipped();
                return Ok(RefreshOutcome::InFlight);
            }
        };

        let watch = Instant::now();
        let result = AssertUnwindSafe(snapshot.producer.produce(snapshot.value.clone()))
            .catch_unwind()
            .await;
        snapshot.metrics.record_duration(watch.elapsed());

        let (next, produced) = match result {
            Ok(Ok(value)) => (value, true),
            Ok(Err(error)) => {
                log::error!(
                    "[IntervalCache] Error updating cache key \"{}\": {:#}",
                    key,
                    error
                );
                snapshot.metrics.record_failure(format!("{:#}", error));
                (snapshot.value, false)
            }
            Err(payload) => {
                let message = format!("Producer panicked: {}", panic_message(payload.as_ref()));
                log::error!(
                    "[IntervalCache] Error updating cache key \"{}\": {}",
                    key,
                    message
                );
                snapshot.metrics.record_failure(message);
                (snapshot.value, false)
            }
        };

        std::mem::drop(guard);

        match self
            .registry
            .reconcile(key, snapshot.token, next, self.clock.now(), produced)
        {
            Reconciliation::Committed(value) if produced => {
                log::debug!("Refreshed cache key {}.", key);
                snapshot.metrics.record_refresh();
                Ok(RefreshOutcome::Refreshed(value))
            }
            Reconciliation::Committed(value) => Ok(RefreshOutcome::Failed(value)),
            Reconciliation::Superseded(value) => {
                log::debug!(
                    "Discarding refreshed value of {} as it has been written in the meantime.",
                    key
                );
                snapshot.metrics.record_superseded();
                Ok(RefreshOutcome::Superseded(value))
            }
            Reconciliation::Removed(value) => {
                log::debug!(
                    "Discarding refreshed value of {} as it has been removed in the meantime.",
                    key
                );
                Ok(RefreshOutcome::Superseded(value))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::IntervalCache;
    use crate::clock::ManualClock;
    use crate::error::CacheError;
    use crate::refresh::RefreshOutcome;
    use mock_instant::global::MockClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Creates a producer which blocks until the returned sender is fired. The producer then
    /// returns the value sent.
    fn blocking_producer(
        calls: Arc<AtomicUsize>,
    ) -> (
        impl Fn(i32) -> futures::future::BoxFuture<'static, anyhow::Result<i32>> + Send + Sync,
        oneshot::Sender<i32>,
    ) {
        let (tx, rx) = oneshot::channel::<i32>();
        let rx = Arc::new(Mutex::new(Some(rx)));
        let producer = move |_: i32| -> futures::future::BoxFuture<'static, anyhow::Result<i32>> {
            let _ = calls.fetch_add(1, Ordering::SeqCst);
            let rx = rx.lock().unwrap().take();
            Box::pin(async move {
                match rx {
                    Some(rx) => Ok::<i32, anyhow::Error>(rx.await?),
                    None => Err(anyhow::anyhow!("Producer invoked twice")),
                }
            })
        };

        (producer, tx)
    }

    #[test]
    fn unknown_keys_cannot_be_refreshed() {
        crate::testing::test_async(async {
            let cache = IntervalCache::<i32>::with_clock(ManualClock::new());
            assert_eq!(
                cache.refresh("unknown").await,
                Err(CacheError::UnknownKey("unknown".to_owned()))
            );
        });
    }

    #[test]
    fn concurrent_refreshes_invoke_the_producer_once() {
        crate::testing::test_async(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let (producer, tx) = blocking_producer(calls.clone());
            let cache = IntervalCache::with_clock(ManualClock::new());
            let _ = cache.once("slow", producer, 0).unwrap();

            let first_cache = cache.clone();
            let first = tokio::spawn(async move { first_cache.refresh("slow").await });

            // Let the first refresh start and block in its producer...
            tokio::task::yield_now().await;
            assert_eq!(cache.is_refreshing("slow"), true);

            assert_eq!(cache.refresh("slow").await, Ok(RefreshOutcome::InFlight));

            tx.send(42).unwrap();
            assert_eq!(first.await.unwrap(), Ok(RefreshOutcome::Refreshed(42)));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(cache.is_refreshing("slow"), false);
            assert_eq!(cache.get("slow"), Some(42));

            let stats = cache.stats();
            assert_eq!(stats[0].refreshes, 1);
            assert_eq!(stats[0].skipped, 1);
        });
    }

    #[test]
    fn synchronous_writes_win_over_pending_refreshes() {
        crate::testing::test_async(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let (producer, tx) = blocking_producer(calls.clone());
            let cache = IntervalCache::with_clock(ManualClock::new());
            let _ = cache
                .every("forum-mods", Duration::from_secs(600), producer, 0)
                .unwrap();

            let refresh_cache = cache.clone();
            let refresh = tokio::spawn(async move { refresh_cache.refresh("forum-mods").await });
            tokio::task::yield_now().await;

            let _ = cache.set("forum-mods", 99).unwrap();
            tx.send(1).unwrap();

            assert_eq!(
                refresh.await.unwrap(),
                Ok(RefreshOutcome::Superseded(99))
            );
            assert_eq!(cache.get("forum-mods"), Some(99));
            assert_eq!(cache.stats()[0].superseded, 1);
        });
    }

    #[test]
    fn updates_also_win_over_pending_refreshes() {
        crate::testing::test_async(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let (producer, tx) = blocking_producer(calls.clone());
            let cache = IntervalCache::with_clock(ManualClock::new());
            let _ = cache.once("counter", producer, 10).unwrap();

            let refresh_cache = cache.clone();
            let refresh = tokio::spawn(async move { refresh_cache.refresh("counter").await });
            tokio::task::yield_now().await;

            assert_eq!(cache.update("counter", |value| value + 1), Ok(11));
            tx.send(1).unwrap();

            assert_eq!(
                refresh.await.unwrap(),
                Ok(RefreshOutcome::Superseded(11))
            );
            assert_eq!(cache.get("counter"), Some(11));
        });
    }

    #[test]
    fn failures_keep_the_previous_value_and_heal_later() {
        crate::testing::test_async(async {
            let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let producer_health = healthy.clone();
            let cache = IntervalCache::with_clock(ManualClock::starting_at(1_000));
            let _ = cache
                .every(
                    "users",
                    Duration::from_secs(1),
                    move |previous: i32| {
                        let healthy = producer_health.load(Ordering::SeqCst);
                        async move {
                            if healthy {
                                Ok(previous + 1)
                            } else {
                                Err(anyhow::anyhow!("Database is down"))
                            }
                        }
                    },
                    5,
                )
                .unwrap();

            assert_eq!(cache.refresh("users").await, Ok(RefreshOutcome::Failed(5)));
            assert_eq!(cache.get("users"), Some(5));

            let stats = cache.stats();
            assert_eq!(stats[0].failures, 1);
            assert_eq!(stats[0].last_error.as_deref(), Some("Database is down"));
            assert_eq!(stats[0].last_run, 1_000);

            healthy.store(true, Ordering::SeqCst);
            assert_eq!(
                cache.refresh("users").await,
                Ok(RefreshOutcome::Refreshed(6))
            );
            assert_eq!(cache.get("users"), Some(6));
        });
    }

    #[test]
    fn panicking_producers_release_the_lock() {
        crate::testing::test_async(async {
            let cache = IntervalCache::with_clock(ManualClock::new());
            let _ = cache
                .once(
                    "broken",
                    |previous: i32| async move {
                        if previous == 0 {
                            panic!("Invalid state");
                        }
                        Ok(previous)
                    },
                    0,
                )
                .unwrap();

            assert_eq!(cache.refresh("broken").await, Ok(RefreshOutcome::Failed(0)));
            assert_eq!(cache.is_refreshing("broken"), false);
            assert_eq!(
                cache.stats()[0].last_error.as_deref(),
                Some("Producer panicked: Invalid state")
            );

            // The lock has been released, therefore the next refresh runs again...
            assert_eq!(cache.refresh("broken").await, Ok(RefreshOutcome::Failed(0)));
            assert_eq!(cache.stats()[0].failures, 2);
        });
    }

    #[test]
    fn dropped_refreshes_release_the_lock() {
        crate::testing::test_async(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let (producer, _tx) = blocking_producer(calls.clone());
            let cache = IntervalCache::with_clock(ManualClock::new());
            let _ = cache.once("slow", producer, 0).unwrap();

            let refresh = cache.refresh("slow");
            let timeout = tokio::time::timeout(Duration::from_millis(10), refresh).await;
            assert_eq!(timeout.is_err(), true);
            assert_eq!(cache.is_refreshing("slow"), false);
        });
    }

    #[test]
    fn removed_tasks_discard_their_refresh() {
        crate::testing::test_async(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let (producer, tx) = blocking_producer(calls.clone());
            let cache = IntervalCache::with_clock(ManualClock::new());
            let _ = cache.once("slow", producer, 0).unwrap();

            let refresh_cache = cache.clone();
            let refresh = tokio::spawn(async move { refresh_cache.refresh("slow").await });
            tokio::task::yield_now().await;

            assert_eq!(cache.remove("slow"), Ok(0));
            tx.send(7).unwrap();

            assert_eq!(refresh.await.unwrap(), Ok(RefreshOutcome::Superseded(7)));
            assert_eq!(cache.get("slow"), None);
        });
    }

    #[test]
    fn reregistered_tasks_discard_refreshes_of_their_predecessor() {
        crate::testing::test_async(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let (producer, tx) = blocking_producer(calls.clone());
            let cache = IntervalCache::with_clock(ManualClock::new());
            let _ = cache.once("slow", producer, 0).unwrap();

            let refresh_cache = cache.clone();
            let refresh = tokio::spawn(async move { refresh_cache.refresh("slow").await });
            tokio::task::yield_now().await;

            assert_eq!(cache.remove("slow"), Ok(0));
            let _ = cache
                .once("slow", |previous: i32| async move { Ok(previous + 1) }, 500)
                .unwrap();
            tx.send(7).unwrap();

            assert_eq!(
                refresh.await.unwrap(),
                Ok(RefreshOutcome::Superseded(500))
            );
            assert_eq!(cache.get("slow"), Some(500));

            // The new task has not produced anything yet and therefore still runs...
            assert_eq!(cache.list_due(0).collect::<Vec<_>>(), vec!["slow"]);
            assert_eq!(
                cache.refresh("slow").await,
                Ok(RefreshOutcome::Refreshed(501))
            );
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn producer_durations_are_recorded() {
        crate::testing::test_async(async {
            let cache = IntervalCache::with_clock(ManualClock::new());
            let _ = cache
                .once(
                    "slow",
                    |_: i32| async move {
                        MockClock::advance(Duration::from_millis(250));
                        Ok(1)
                    },
                    0,
                )
                .unwrap();

            let _ = cache.refresh("slow").await.unwrap();
            let duration = &cache.stats()[0].average_duration;
            assert_eq!(duration.count(), 1);
            assert!(duration.avg() >= 250_000);
        });
    }

    #[test]
    fn outcomes_expose_their_value() {
        assert_eq!(RefreshOutcome::Refreshed(1).value(), Some(&1));
        assert_eq!(RefreshOutcome::Failed(2).into_value(), Some(2));
        assert_eq!(RefreshOutcome::Superseded(3).is_refreshed(), false);
        assert_eq!(RefreshOutcome::<i32>::InFlight.value(), None);
    }
}
