//! An in-process cache of named values which are periodically recomputed by async producers.
//!
//! # Introduction
//! Many applications rely on data which is expensive to compute but changes rarely, like "the
//! list of all moderators of a forum" or "the current welcome post". Computing these on every
//! request is a waste, whereas a classic TTL cache makes some unlucky requests pay for the
//! recomputation.
//!
//! **interval-cache** therefore keeps such values in a registry of named tasks. Each task is
//! recomputed in the background by an async [Producer](task::Producer), either in a fixed
//! interval or just once. Readers are always served synchronously with the last committed value
//! and never wait for a computation.
//!
//! # Features
//! * **Single flight refreshes**: At most one computation per key runs at any given time. A slow
//!   producer only ever delays its own key.
//! * **Synchronous writes win**: Values can be overwritten via [set](cache::IntervalCache::set) or
//!   [update](cache::IntervalCache::update). A refresh which was computed based on the previous
//!   value is then discarded. See [refresh] for the details.
//! * **Failures are contained**: A failing (or even panicking) producer is logged and keeps the
//!   previous value. The next refresh heals the value.
//! * **Reload-aware config**: The intervals of tasks can be changed in a YAML file while the
//!   application is running. See [config].
//! * **Deterministic tests**: All scheduling decisions are made using an injected
//!   [Clock](clock::Clock), therefore tests can use the [ManualClock](clock::ManualClock)
//!   instead of waiting for real timers.
//!
//! # Modules
//! * [cache]: The cache itself along with its synchronous accessors.
//! * [scheduler]: Periodically refreshes all due tasks.
//! * [refresh]: Recomputes a single task and reconciles the result with concurrent writes.
//! * [task]: Describes schedules and producers.
//! * [builder]: Sets up a cache along with logging, signal handling and a config.
//! * [stats]: Provides metrics for each task.
//!
//! # Examples
//! A short example on how to set up a cache can be found here: [Builder](builder::Builder).
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod average;
pub mod builder;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod fmt;
pub mod refresh;
mod registry;
pub mod scheduler;
pub mod signals;
pub mod stats;
pub mod task;

pub use registry::DueTasks;

/// Contains the version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// cache, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            eprintln!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned handle to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate interval_cache;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
