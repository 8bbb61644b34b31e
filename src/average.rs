//! Provides a lock free sliding average.
//!
//! Each task records how long its producer took to compute a value. As refreshes of different
//! tasks run concurrently and the statistics are read from other threads, an [Average] can be
//! updated via a shared reference.
//!
//! # Example
//!
//! ```
//! # use interval_cache::average::Average;
//! let avg = Average::new();
//! avg.add(10);
//! avg.add(20);
//! avg.add(30);
//!
//! assert_eq!(avg.avg(), 20);
//! assert_eq!(avg.count(), 3);
//! ```
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::fmt::format_micros;

/// Once this many values have been recorded, older values start to fade out.
const WINDOW: u32 = 100;

/// Computes a sliding average of a series of values (most probably durations in microseconds).
///
/// The sum and the number of values of the current window are packed into a single atomic u64
/// (32 bits each) so that both are always updated together.
#[derive(Default)]
pub struct Average {
    window: AtomicU64,
    count: AtomicU64,
}

impl Clone for Average {
    fn clone(&self) -> Self {
        Average {
            window: AtomicU64::new(self.window.load(Ordering::Relaxed)),
            count: AtomicU64::new(self.count.load(Ordering::Relaxed)),
        }
    }
}

fn unpack(window: u64) -> (u32, u32) {
    ((window >> 32) as u32, window as u32)
}

fn pack(sum: u32, count: u32) -> u64 {
    (u64::from(sum) << 32) | u64::from(count)
}

impl Average {
    /// Creates a new and empty average.
    pub fn new() -> Average {
        Average::default()
    }

    /// Records another value.
    ///
    /// Negative values are treated as zero. If the window is full or the sum would overflow, sum
    /// and count are halved before the new value is added.
    pub fn add(&self, value: i32) {
        let _ = self.count.fetch_add(1, Ordering::Relaxed);

        let value = value.max(0) as u32;
        let _ = self
            .window
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |window| {
                let (mut sum, mut count) = unpack(window);
                while count >= WINDOW || sum.checked_add(value).is_none() {
                    sum /= 2;
                    count /= 2;
                }

                Some(pack(sum + value, count + 1))
            });
    }

    /// Returns the total number of recorded values.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns the average of the current window or **0** if no values have been recorded.
    pub fn avg(&self) -> i32 {
        let (sum, count) = unpack(self.window.load(Ordering::Relaxed));
        if count == 0 {
            0
        } else {
            i32::try_from(sum / count).unwrap_or(i32::MAX)
        }
    }
}

impl Display for Average {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_micros(self.avg(), f)?;
        write!(f, " ({})", self.count())
    }
}
