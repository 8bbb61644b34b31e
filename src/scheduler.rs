//! Periodically refreshes all due tasks of a cache.
//!
//! Once [started](crate::cache::IntervalCache::start), the scheduler wakes up once per tick (by
//! default once per second). For each tick it determines which tasks are due and refreshes all of
//! them concurrently. Each tick runs in its own tokio task, therefore a slow producer never delays
//! the timer. If a tick starts while a refresh of the previous one is still running, the
//! single-flight guard of the [refresh engine](crate::refresh) simply skips the key.
//!
//! The timer loop only holds a weak reference to the cache, so dropping the cache also terminates
//! the loop. Alternatively, the loop can be terminated via [IntervalCache::stop].
//!
//! # Examples
//!
//! ```
//! # use interval_cache::cache::IntervalCache;
//! # use interval_cache::scheduler::DEFAULT_TICK;
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let cache = IntervalCache::new();
//! cache.every(
//!     "forum-mods",
//!     Duration::from_secs(600),
//!     |_previous: Vec<String>| async move { Ok(vec!["admin".to_owned()]) },
//!     Vec::new(),
//! )?;
//!
//! let _ = cache.start(DEFAULT_TICK);
//! assert_eq!(cache.is_started(), true);
//!
//! cache.stop();
//! assert_eq!(cache.is_started(), false);
//! # Ok(())
//! # }
//! ```
use std::sync::{Arc, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::cache::IntervalCache;
use crate::clock::{millis, Timestamp};
use crate::error::CacheError;
use crate::fmt::format_duration;
use crate::refresh::RefreshOutcome;

/// Determines the default period of the scheduler.
pub const DEFAULT_TICK: Duration = Duration::from_millis(1000);

/// Describes what happened during a single tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport<V> {
    /// The timestamp at which the tick determined the due tasks.
    pub at: Timestamp,

    /// The outcome of each refreshed task in the order in which they were detected as due.
    pub outcomes: Vec<(String, RefreshOutcome<V>)>,
}

impl<V> TickReport<V> {
    /// Returns the number of tasks which were due.
    pub fn due(&self) -> usize {
        self.outcomes.len()
    }

    /// Returns the outcome for the given key if the task was due.
    pub fn outcome(&self, key: &str) -> Option<&RefreshOutcome<V>> {
        self.outcomes
            .iter()
            .find(|(due_key, _)| due_key == key)
            .map(|(_, outcome)| outcome)
    }
}

impl<V: Clone + Send + Sync + 'static> IntervalCache<V> {
    pub(crate) fn scheduler(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the scheduler which checks for due tasks once every **period**.
    ///
    /// Calling this on a cache with a running scheduler has no effect. A stopped scheduler can be
    /// started again. Note that this must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>, period: Duration) -> Arc<Self> {
        let mut scheduler = self.scheduler();
        if scheduler.is_some() {
            return self.clone();
        }

        let token = CancellationToken::new();
        *scheduler = Some(token.clone());
        std::mem::drop(scheduler);

        log::info!(
            "Starting cache scheduler with a tick of {}...",
            format_duration(period)
        );

        let first_tick = self.clock.now().saturating_add(millis(period));
        tick_loop(Arc::downgrade(self), token, period, first_tick);

        self.clone()
    }

    /// Stops the scheduler.
    ///
    /// Refreshes which are currently running will still complete. Calling this on a cache
    /// without a running scheduler has no effect.
    pub fn stop(&self) {
        if let Some(token) = self.scheduler().take() {
            log::info!("Stopping cache scheduler...");
            token.cancel();
        }
    }

    /// Determines if the scheduler is running.
    pub fn is_started(&self) -> bool {
        self.scheduler().is_some()
    }

    /// Refreshes all tasks which are due right now and waits until all of them have completed.
    ///
    /// This is what the scheduler does once per period, but it can also be invoked manually.
    pub async fn tick(&self) -> TickReport<V> {
        let now = self.clock.now();
        let due: Vec<String> = self.list_due(now).collect();

        let results = join_all(due.iter().map(|key| self.refresh(key))).await;

        let mut outcomes = Vec::with_capacity(due.len());
        for (key, result) in due.into_iter().zip(results) {
            match result {
                Ok(outcome) => outcomes.push((key, outcome)),
                Err(CacheError::UnknownKey(_)) => {
                    log::debug!("Skipping {} as it has been removed in the meantime.", key)
                }
                Err(error) => log::error!("Failed to refresh {}: {}", key, error),
            }
        }

        TickReport { at: now, outcomes }
    }
}

fn tick_loop<V: Clone + Send + Sync + 'static>(
    cache: Weak<IntervalCache<V>>,
    token: CancellationToken,
    period: Duration,
    mut next_tick: Timestamp,
) {
    let period = millis(period).max(1);
    let clock = match cache.upgrade() {
        Some(cache) => cache.clock.clone(),
        None => return,
    };

    crate::spawn!(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = clock.sleep_until(next_tick) => (),
            }

            match cache.upgrade() {
                Some(cache) => crate::spawn!(async move {
                    let _ = cache.tick().await;
                }),
                None => break,
            }

            next_tick = next_tick.saturating_add(period);
            let now = clock.now();
            if next_tick <= now {
                // We fell behind (or the clock jumped). Skip the missed ticks instead of firing
                // them all at once...
                next_tick = now.saturating_add(period);
            }
        }

        log::info!("Cache scheduler has terminated.");
    });
}

#[cfg(test)]
mod tests {
    use crate::cache::IntervalCache;
    use crate::clock::{Clock, ManualClock};
    use crate::refresh::RefreshOutcome;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counting_cache(clock: Arc<ManualClock>, calls: Arc<AtomicUsize>) -> Arc<IntervalCache<i32>> {
        let cache = IntervalCache::with_clock(clock);
        let _ = cache
            .every(
                "counter",
                Duration::from_secs(1),
                move |previous: i32| {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(previous + 1) }
                },
                0,
            )
            .unwrap();
        cache
    }

    /// Lets all spawned tasks run until they block.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn ticks_refresh_each_task_once_per_interval() {
        crate::testing::test_async(async {
            let clock = ManualClock::starting_at(1_000);
            let calls = Arc::new(AtomicUsize::new(0));
            let cache = counting_cache(clock.clone(), calls.clone());

            // A fresh task is due immediately...
            let report = cache.tick().await;
            assert_eq!(report.at, 1_000);
            assert_eq!(report.due(), 1);
            assert_eq!(report.outcome("counter"), Some(&RefreshOutcome::Refreshed(1)));

            // ...but not again within its interval...
            clock.advance(Duration::from_millis(999));
            assert_eq!(cache.tick().await.due(), 0);

            clock.advance(Duration::from_millis(1));
            assert_eq!(cache.tick().await.due(), 1);
            assert_eq!(cache.tick().await.due(), 0);

            assert_eq!(calls.load(Ordering::SeqCst), 2);
            assert_eq!(cache.get("counter"), Some(2));
        });
    }

    #[test]
    fn synchronous_writes_reset_the_interval() {
        crate::testing::test_async(async {
            let clock = ManualClock::new();
            let cache = counting_cache(clock.clone(), Arc::new(AtomicUsize::new(0)));

            clock.set(1_000);
            let _ = cache.tick().await;
            assert_eq!(cache.get("counter"), Some(1));

            clock.set(1_001);
            let _ = cache.set("counter", 99).unwrap();
            assert_eq!(cache.get("counter"), Some(99));

            clock.set(2_000);
            assert_eq!(cache.tick().await.due(), 0);
            assert_eq!(cache.get("counter"), Some(99));

            clock.set(2_001);
            let _ = cache.tick().await;
            assert_eq!(cache.get("counter"), Some(100));
        });
    }

    #[test]
    fn one_shot_tasks_run_until_they_succeed() {
        crate::testing::test_async(async {
            let clock = ManualClock::new();
            let calls = Arc::new(AtomicUsize::new(0));
            let producer_calls = calls.clone();
            let cache = IntervalCache::with_clock(clock.clone());
            let _ = cache
                .once(
                    "welcome-post",
                    move |_: String| {
                        let attempt = producer_calls.fetch_add(1, Ordering::SeqCst);
                        async move {
                            if attempt == 0 {
                                Err(anyhow::anyhow!("Post not found"))
                            } else {
                                Ok("Welcome!".to_owned())
                            }
                        }
                    },
                    String::new(),
                )
                .unwrap();

            let report = cache.tick().await;
            assert_eq!(
                report.outcome("welcome-post"),
                Some(&RefreshOutcome::Failed(String::new()))
            );

            clock.advance(Duration::from_secs(1));
            let _ = cache.tick().await;
            assert_eq!(cache.get("welcome-post"), Some("Welcome!".to_owned()));

            clock.advance(Duration::from_secs(3600));
            assert_eq!(cache.tick().await.due(), 0);
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn due_tasks_are_refreshed_concurrently() {
        crate::testing::test_async(async {
            let release = Arc::new(tokio::sync::Semaphore::new(0));
            let cache = IntervalCache::with_clock(ManualClock::new());
            for key in ["a", "b"] {
                let release = release.clone();
                let _ = cache
                    .once(
                        key,
                        move |_: i32| {
                            let release = release.clone();
                            async move {
                                let _permit = release.acquire().await?;
                                Ok::<_, anyhow::Error>(1)
                            }
                        },
                        0,
                    )
                    .unwrap();
            }

            let tick_cache = cache.clone();
            let tick = tokio::spawn(async move { tick_cache.tick().await });
            settle().await;

            // Both producers are running at the same time...
            assert_eq!(cache.is_refreshing("a"), true);
            assert_eq!(cache.is_refreshing("b"), true);

            release.add_permits(2);
            let report = tick.await.unwrap();
            assert_eq!(report.due(), 2);
            assert_eq!(cache.get("a"), Some(1));
            assert_eq!(cache.get("b"), Some(1));
        });
    }

    #[test]
    fn removed_tasks_are_skipped() {
        crate::testing::test_async(async {
            let cache = counting_cache(ManualClock::new(), Arc::new(AtomicUsize::new(0)));
            let _ = cache.remove("counter").unwrap();
            assert_eq!(cache.tick().await.due(), 0);
        });
    }

    #[test]
    fn the_scheduler_fires_on_the_clock() {
        crate::testing::test_async(async {
            let clock = ManualClock::starting_at(10_000);
            let calls = Arc::new(AtomicUsize::new(0));
            let cache = counting_cache(clock.clone(), calls.clone());

            let _ = cache.start(Duration::from_secs(1));
            settle().await;
            assert_eq!(calls.load(Ordering::SeqCst), 0);

            clock.advance(Duration::from_secs(1));
            settle().await;
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(cache.get("counter"), Some(1));

            // Starting again has no effect (we'd otherwise see two refreshes per tick)...
            let _ = cache.start(Duration::from_secs(1));
            clock.advance(Duration::from_secs(1));
            settle().await;
            assert_eq!(calls.load(Ordering::SeqCst), 2);

            cache.stop();
            assert_eq!(cache.is_started(), false);
            settle().await;
            clock.advance(Duration::from_secs(5));
            settle().await;
            assert_eq!(calls.load(Ordering::SeqCst), 2);
            assert_eq!(clock.now(), 17_000);
        });
    }

    #[test]
    fn the_scheduler_can_be_restarted() {
        crate::testing::test_async(async {
            let clock = ManualClock::new();
            let calls = Arc::new(AtomicUsize::new(0));
            let cache = counting_cache(clock.clone(), calls.clone());

            let _ = cache.start(Duration::from_secs(1));
            cache.stop();
            let _ = cache.start(Duration::from_secs(1));
            assert_eq!(cache.is_started(), true);

            settle().await;
            clock.advance(Duration::from_secs(1));
            settle().await;
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn missed_ticks_are_skipped() {
        crate::testing::test_async(async {
            let clock = ManualClock::starting_at(10_000);
            let attempts = Arc::new(AtomicUsize::new(0));
            let producer_attempts = attempts.clone();
            let cache = IntervalCache::with_clock(clock.clone());

            // A one-shot task which never succeeds is refreshed on every single tick...
            let _ = cache
                .once(
                    "broken",
                    move |_: i32| {
                        let _ = producer_attempts.fetch_add(1, Ordering::SeqCst);
                        async move { Err::<i32, _>(anyhow::anyhow!("Database is down")) }
                    },
                    0,
                )
                .unwrap();

            let _ = cache.start(Duration::from_secs(1));
            settle().await;

            // Jumping five periods ahead results in one tick, not in a burst of five...
            clock.advance(Duration::from_secs(5));
            settle().await;
            assert_eq!(attempts.load(Ordering::SeqCst), 1);

            // ...and the next tick is one period after the clock jumped.
            clock.advance(Duration::from_millis(999));
            settle().await;
            assert_eq!(attempts.load(Ordering::SeqCst), 1);

            clock.advance(Duration::from_millis(1));
            settle().await;
            assert_eq!(attempts.load(Ordering::SeqCst), 2);
            assert_eq!(cache.get("broken"), Some(0));

            cache.stop();
        });
    }

    #[test]
    fn new_tasks_are_due_at_the_epoch() {
        crate::testing::test_async(async {
            let clock = ManualClock::new();
            let calls = Arc::new(AtomicUsize::new(0));
            let cache = counting_cache(clock.clone(), calls.clone());

            let report = cache.tick().await;
            assert_eq!(report.at, 0);
            assert_eq!(report.outcome("counter"), Some(&RefreshOutcome::Refreshed(1)));

            // Once written, the interval applies even though the write happened at zero...
            assert_eq!(cache.tick().await.due(), 0);
            clock.advance(Duration::from_secs(1));
            assert_eq!(cache.tick().await.due(), 1);
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn dropping_the_cache_terminates_the_loop() {
        crate::testing::test_async(async {
            let clock = ManualClock::new();
            let calls = Arc::new(AtomicUsize::new(0));
            let cache = counting_cache(clock.clone(), calls.clone());
            let weak = Arc::downgrade(&cache);

            let _ = cache.start(Duration::from_secs(1));
            std::mem::drop(cache);
            assert_eq!(weak.upgrade().is_none(), true);

            clock.advance(Duration::from_secs(1));
            settle().await;
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        });
    }
}
