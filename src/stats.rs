//! Keeps track of how the refreshes of each task perform.
//!
//! The counters are updated by the refresh engine without holding the registry lock. A snapshot
//! of all counters along with the scheduling state of a task is provided as [TaskInfo] by
//! [IntervalCache::stats](crate::cache::IntervalCache::stats).
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::average::Average;
use crate::clock::Timestamp;
use crate::fmt::{format_duration, format_timestamp};
use crate::task::Schedule;

/// Counters maintained for each task.
#[derive(Default)]
pub(crate) struct TaskMetrics {
    refreshes: AtomicU64,
    failures: AtomicU64,
    superseded: AtomicU64,
    skipped: AtomicU64,
    durations: Average,
    last_error: Mutex<Option<String>>,
}

impl TaskMetrics {
    /// Records how long the producer took, no matter if it succeeded or not.
    pub(crate) fn record_duration(&self, duration: Duration) {
        self.durations
            .add(i32::try_from(duration.as_micros()).unwrap_or(i32::MAX));
    }

    pub(crate) fn record_refresh(&self) {
        let _ = self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, error: String) {
        let _ = self.failures.fetch_add(1, Ordering::Relaxed);
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    pub(crate) fn record_superseded(&self) {
        let _ = self.superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        let _ = self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Creates a snapshot of the counters for the given task.
    pub(crate) fn info(
        &self,
        key: &str,
        schedule: Schedule,
        last_run: Timestamp,
        revision: u64,
    ) -> TaskInfo {
        TaskInfo {
            key: key.to_owned(),
            schedule,
            last_run,
            revision,
            refreshing: false,
            refreshes: self.refreshes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            average_duration: self.durations.clone(),
        }
    }
}

/// Provides a snapshot of the state and the metrics of a task.
#[derive(Clone)]
pub struct TaskInfo {
    /// The key of the task.
    pub key: String,

    /// Determines when the task is refreshed.
    pub schedule: Schedule,

    /// The timestamp of the last write (**0** if the task has never been written).
    pub last_run: Timestamp,

    /// The number of writes (refreshes and synchronous ones) the task has seen.
    pub revision: u64,

    /// Determines if a refresh is currently in flight.
    pub refreshing: bool,

    /// The number of refreshes which successfully stored a new value.
    pub refreshes: u64,

    /// The number of refreshes in which the producer failed.
    pub failures: u64,

    /// The number of refreshes whose result was discarded due to a synchronous write.
    pub superseded: u64,

    /// The number of refreshes which were skipped as another one was already running.
    pub skipped: u64,

    /// The error message of the most recent producer failure.
    pub last_error: Option<String>,

    /// The sliding average of the producer durations in microseconds.
    pub average_duration: Average,
}

impl TaskInfo {
    /// Returns how long ago the task has been written, relative to the given timestamp.
    ///
    /// Returns **None** if the task has never been written.
    pub fn age(&self, now: Timestamp) -> Option<Duration> {
        if self.last_run == 0 {
            None
        } else {
            Some(Duration::from_millis(now.saturating_sub(self.last_run)))
        }
    }
}

impl fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): last run: {}, revision: {}, refreshes: {}, failures: {}, superseded: {}, \
             skipped: {}, duration: {}",
            self.key,
            self.schedule,
            format_timestamp(self.last_run),
            self.revision,
            self.refreshes,
            self.failures,
            self.superseded,
            self.skipped,
            self.average_duration
        )?;

        if self.refreshing {
            write!(f, ", refreshing")?;
        }
        if let Some(error) = &self.last_error {
            write!(f, ", last error: {}", error)?;
        }

        Ok(())
    }
}

impl fmt::Debug for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInfo")
            .field("key", &self.key)
            .field("schedule", &self.schedule)
            .field("last_run", &self.last_run)
            .field("revision", &self.revision)
            .field("refreshing", &self.refreshing)
            .field("refreshes", &self.refreshes)
            .field("failures", &self.failures)
            .field("superseded", &self.superseded)
            .field("skipped", &self.skipped)
            .field("last_error", &self.last_error)
            .field("average_duration", &format_duration_micros(&self.average_duration))
            .finish()
    }
}

fn format_duration_micros(average: &Average) -> String {
    format_duration(Duration::from_micros(u64::try_from(average.avg()).unwrap_or(0)))
}
