//! Describes a task, which is a named value that is periodically recomputed.
//!
//! Each task has a [Schedule] which determines when it is due and a [Producer] which computes
//! the next value based on the previous one. The bookkeeping (when was the value written the
//! last time and how often) is kept alongside and only modified by the registry.
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{millis, Timestamp};
use crate::fmt::format_duration;
use crate::stats::TaskMetrics;

/// Computes the next value of a task based on its previous one.
///
/// A producer might be invoked repeatedly on a schedule and its result might be discarded (if
/// a value is written synchronously while the producer is running). Therefore a producer must
/// be safe to call over and over again.
///
/// There is a blanket implementation for closures which return a future, therefore in most
/// cases a producer is simply an async closure:
///
/// ```
/// # use interval_cache::task::Producer;
/// # #[tokio::main]
/// # async fn main() {
/// let producer = |previous: i32| async move { Ok::<_, anyhow::Error>(previous + 1) };
/// assert_eq!(producer.produce(41).await.unwrap(), 42);
/// # }
/// ```
#[async_trait]
pub trait Producer<V>: Send + Sync {
    /// Computes the next value based on the given previous value.
    ///
    /// A failure is logged and the previous value is kept, it is never reported to the callers
    /// of the cache.
    async fn produce(&self, previous: V) -> anyhow::Result<V>;
}

#[async_trait]
impl<V, F, Fut> Producer<V> for F
where
    V: Send + 'static,
    F: Fn(V) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<V>> + Send,
{
    async fn produce(&self, previous: V) -> anyhow::Result<V> {
        (self)(previous).await
    }
}

/// Determines when a task is due to be refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// The task is refreshed whenever the given interval has elapsed since its value was last
    /// written (either by a refresh or synchronously).
    Every(Duration),

    /// The task is refreshed on the next tick and then never again once it has produced a value.
    /// A failed attempt is retried on the following tick.
    Once,
}

impl Schedule {
    /// Determines if a task with the given state is due at **now**.
    ///
    /// * **last_run** is the timestamp of the last write or **None** if the task has never been
    ///   written
    /// * **produced** signals if a value has ever been produced or written synchronously
    ///
    /// # Examples
    ///
    /// ```
    /// # use interval_cache::task::Schedule;
    /// # use std::time::Duration;
    /// let every_second = Schedule::Every(Duration::from_secs(1));
    /// assert_eq!(every_second.is_due(0, None, false), true);
    /// assert_eq!(every_second.is_due(1_999, Some(1_000), true), false);
    /// assert_eq!(every_second.is_due(2_000, Some(1_000), true), true);
    ///
    /// assert_eq!(Schedule::Once.is_due(1_000, None, false), true);
    /// assert_eq!(Schedule::Once.is_due(1_000_000, Some(1_000), true), false);
    /// ```
    pub fn is_due(&self, now: Timestamp, last_run: Option<Timestamp>, produced: bool) -> bool {
        match self {
            Schedule::Every(interval) => match last_run {
                Some(last_run) => now.saturating_sub(last_run) >= millis(*interval),
                None => true,
            },
            Schedule::Once => !produced,
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Every(interval) => write!(f, "every {}", format_duration(*interval)),
            Schedule::Once => write!(f, "once"),
        }
    }
}

/// Contains the state of a registered task.
pub(crate) struct Task<V> {
    pub(crate) schedule: Schedule,
    pub(crate) producer: Arc<dyn Producer<V>>,
    /// Timestamp of the last write. Never moves backwards.
    pub(crate) last_run: Timestamp,
    /// The number of writes.
    pub(crate) revision: u64,
    /// Drawn from a registry wide sequence on registration and on each write. As tokens are
    /// never reused, a refresh which started before a concurrent write (or before the key was
    /// removed and registered again) is detected, even within the same millisecond.
    pub(crate) token: u64,
    pub(crate) produced: bool,
    pub(crate) value: V,
    pub(crate) metrics: Arc<TaskMetrics>,
}

impl<V> Task<V> {
    /// Creates a new task which holds the given seed and is due immediately.
    pub(crate) fn new(
        schedule: Schedule,
        producer: Arc<dyn Producer<V>>,
        seed: V,
        token: u64,
    ) -> Self {
        Task {
            schedule,
            producer,
            last_run: 0,
            revision: 0,
            token,
            produced: false,
            value: seed,
            metrics: Arc::new(TaskMetrics::default()),
        }
    }

    /// Stores the given value and marks the task as recently run.
    ///
    /// **produced** is false for failed refreshes, which only "confirm" the previous value.
    pub(crate) fn commit(&mut self, value: V, now: Timestamp, produced: bool, token: u64) {
        self.value = value;
        self.last_run = self.last_run.max(now);
        self.revision += 1;
        self.token = token;
        self.produced |= produced;
    }

    /// Returns the timestamp of the last write or **None** if the task still holds its seed.
    pub(crate) fn written_at(&self) -> Option<Timestamp> {
        if self.revision > 0 {
            Some(self.last_run)
        } else {
            None
        }
    }

    pub(crate) fn is_due(&self, now: Timestamp) -> bool {
        self.schedule.is_due(now, self.written_at(), self.produced)
    }
}
