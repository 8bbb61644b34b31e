//! Provides the time source and the timer used by the cache.
//!
//! All scheduling decisions are made on [Timestamp]s as reported by a [Clock]. The clock is
//! injected into the [IntervalCache](crate::cache::IntervalCache) so that scheduling can be
//! tested deterministically: [SystemClock] uses the wall clock and tokio timers, whereas the
//! [ManualClock] only moves when being told to.
//!
//! # Examples
//!
//! ```
//! # use interval_cache::clock::{Clock, ManualClock};
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() {
//! let clock = ManualClock::new();
//! assert_eq!(clock.now(), 0);
//!
//! clock.advance(Duration::from_secs(1));
//! assert_eq!(clock.now(), 1_000);
//!
//! // Timers of a manual clock fire as soon as the clock has been advanced far enough...
//! clock.sleep_until(500).await;
//! # }
//! ```
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::watch;

/// Represents a point in time as milliseconds since the Unix epoch.
///
/// Note that **0** is used as "has never been run" marker for tasks.
pub type Timestamp = u64;

/// Converts the given duration into milliseconds as used by [Timestamp].
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Supplies the current time and a timer primitive.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Timestamp;

    /// Completes once the clock reached the given deadline.
    ///
    /// This completes immediately if the deadline has already passed.
    async fn sleep_until(&self, deadline: Timestamp);
}

/// Uses the system wall clock along with tokio timers.
#[derive(Default, Debug, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Creates a new system clock which can be passed to a cache.
    pub fn new() -> Arc<Self> {
        Arc::new(SystemClock)
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(millis)
            .unwrap_or(0)
    }

    async fn sleep_until(&self, deadline: Timestamp) {
        let now = self.now();
        if deadline > now {
            tokio::time::sleep(Duration::from_millis(deadline - now)).await;
        }
    }
}

/// Provides a clock which is only advanced manually.
///
/// This is intended to be used in tests, where we want to control when a task becomes due and
/// when the scheduler fires without relying on real delays.
#[derive(Debug)]
pub struct ManualClock {
    now: watch::Sender<Timestamp>,
}

impl ManualClock {
    /// Creates a new clock which starts at the epoch (**0**).
    pub fn new() -> Arc<Self> {
        ManualClock::starting_at(0)
    }

    /// Creates a new clock which starts at the given timestamp.
    pub fn starting_at(now: Timestamp) -> Arc<Self> {
        let (now, _) = watch::channel(now);
        Arc::new(ManualClock { now })
    }

    /// Moves the clock forward by the given duration.
    ///
    /// All pending timers whose deadline has been reached will fire.
    pub fn advance(&self, duration: Duration) {
        self.now
            .send_modify(|now| *now = now.saturating_add(millis(duration)));
    }

    /// Sets the clock to the given timestamp.
    ///
    /// Note that this may also move the clock backwards, which is handy to simulate a wall clock
    /// being adjusted.
    pub fn set(&self, timestamp: Timestamp) {
        self.now.send_modify(|now| *now = timestamp);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.borrow()
    }

    async fn sleep_until(&self, deadline: Timestamp) {
        let mut receiver = self.now.subscribe();
        // The sender lives as long as this clock, therefore this can't fail while we're waiting...
        let _ = receiver.wait_for(|now| *now >= deadline).await;
    }
}
