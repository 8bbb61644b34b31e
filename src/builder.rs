//! Provides a builder which can be used to setup and initialize a cache.
//!
//! Next to registering the tasks, the builder permits to selectively enable the ambient parts
//! like logging, signal handling or a reloadable config.
//!
//! # Example
//! Setting up a cache with all features enabled:
//! ```no_run
//! # use interval_cache::builder::Builder;
//! # use interval_cache::config;
//! # use std::time::Duration;
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = config::install("config/settings.yml").await;
//!
//!     let cache = Builder::new()
//!         .enable_logging()
//!         .enable_signals()
//!         .with_config(config)
//!         .every(
//!             "forum-mods",
//!             Duration::from_secs(600),
//!             |_previous: Vec<String>| async move { Ok(vec!["admin".to_owned()]) },
//!             Vec::new(),
//!         )
//!         .start()?;
//!
//!     // Serve requests using cache.get("forum-mods") here...
//!     # let _ = cache;
//!     Ok(())
//! }
//! ```
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::IntervalCache;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, Settings};
use crate::error::CacheResult;
use crate::scheduler::DEFAULT_TICK;
use crate::task::{Producer, Schedule};
use crate::{init_logging, VERSION};

struct Registration<V> {
    key: String,
    schedule: Schedule,
    producer: Arc<dyn Producer<V>>,
    seed: V,
}

/// Creates and initializes a cache along with its tasks.
///
/// # Example
/// ```
/// # use interval_cache::builder::Builder;
/// # use interval_cache::clock::ManualClock;
/// let cache = Builder::new()
///     .with_clock(ManualClock::new())
///     .once("answer", |_| async move { Ok(42) }, 0)
///     .build()
///     .unwrap();
///
/// assert_eq!(cache.get("answer"), Some(0));
/// ```
pub struct Builder<V> {
    setup_logging: bool,
    enable_signals: bool,
    clock: Option<Arc<dyn Clock>>,
    config: Option<Arc<Config>>,
    tick: Option<Duration>,
    registrations: Vec<Registration<V>>,
}

impl<V: Clone + Send + Sync + 'static> Default for Builder<V> {
    fn default() -> Self {
        Builder::new()
    }
}

impl<V: Clone + Send + Sync + 'static> Builder<V> {
    /// Creates a new builder.
    pub fn new() -> Self {
        Builder {
            setup_logging: false,
            enable_signals: false,
            clock: None,
            config: None,
            tick: None,
            registrations: Vec::new(),
        }
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// Using this, we properly initialize **simplelog** to log to stdout. See
    /// [init_logging](crate::init_logging) for details.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Installs a signal listener which stops the scheduler once **CTRL-C** or **SIGHUP**
    /// is received.
    ///
    /// For more details see: [signals](crate::signals)
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Specifies the clock to use. By default, the [SystemClock] is used.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Uses the given config to determine the tick of the scheduler and the intervals of the
    /// tasks. Changes of the config are applied while the scheduler is running.
    ///
    /// For more details see: [config](crate::config)
    pub fn with_config(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    /// Specifies the period of the scheduler. This takes precedence over the config.
    pub fn tick(mut self, period: Duration) -> Self {
        self.tick = Some(period);
        self
    }

    /// Registers a task which is refreshed whenever the given interval has elapsed.
    ///
    /// See [IntervalCache::every].
    pub fn every<F, Fut>(mut self, key: &str, interval: Duration, producer: F, seed: V) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.registrations.push(Registration {
            key: key.to_owned(),
            schedule: Schedule::Every(interval),
            producer: Arc::new(producer),
            seed,
        });
        self
    }

    /// Registers a task which is computed once.
    ///
    /// See [IntervalCache::once].
    pub fn once<F, Fut>(mut self, key: &str, producer: F, seed: V) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.registrations.push(Registration {
            key: key.to_owned(),
            schedule: Schedule::Once,
            producer: Arc::new(producer),
            seed,
        });
        self
    }

    /// Registers a task with the given schedule and producer.
    ///
    /// See [IntervalCache::register].
    pub fn register(
        mut self,
        key: &str,
        schedule: Schedule,
        producer: Arc<dyn Producer<V>>,
        seed: V,
    ) -> Self {
        self.registrations.push(Registration {
            key: key.to_owned(),
            schedule,
            producer,
            seed,
        });
        self
    }

    /// Creates the cache and registers all tasks. If a config is present, its intervals are
    /// applied.
    ///
    /// Note that this doesn't start the scheduler, use [start](Builder::start) for this.
    ///
    /// # Errors
    /// Fails if two tasks share the same key.
    pub fn build(self) -> CacheResult<Arc<IntervalCache<V>>> {
        let (cache, _) = self.setup()?;
        Ok(cache)
    }

    /// Creates the cache (see [build](Builder::build)) and starts its scheduler.
    ///
    /// The period of the scheduler is either the one given via [tick](Builder::tick), the one
    /// specified in the config or [DEFAULT_TICK]. Note that this must be called from within a
    /// tokio runtime.
    ///
    /// # Errors
    /// Fails if two tasks share the same key.
    pub fn start(self) -> CacheResult<Arc<IntervalCache<V>>> {
        let tick = self.tick;
        let enable_signals = self.enable_signals;
        let (cache, config) = self.setup()?;

        let tick = tick
            .or_else(|| config.as_ref().and_then(|config| configured_tick(config)))
            .unwrap_or(DEFAULT_TICK);
        let _ = cache.start(tick);

        if enable_signals {
            crate::signals::install(&cache);
        }

        if let Some(config) = config {
            cache.watch_config(config);
        }

        Ok(cache)
    }

    fn setup(self) -> CacheResult<(Arc<IntervalCache<V>>, Option<Arc<Config>>)> {
        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "||. INTERVAL-CACHE (v {}) running on {} core(s) in {} CPU(s)",
            VERSION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => SystemClock::new(),
        };
        let cache = IntervalCache::with_clock(clock);
        for registration in self.registrations {
            let _ = cache.register(
                &registration.key,
                registration.schedule,
                registration.producer,
                registration.seed,
            )?;
        }

        if let Some(config) = &self.config {
            if let Err(error) = cache.apply_config(config) {
                log::error!("Failed to apply the cache config: {:#}", error);
            }
        }

        Ok((cache, self.config))
    }
}

fn configured_tick(config: &Config) -> Option<Duration> {
    match Settings::from_handle(&config.current()) {
        Ok(settings) => settings.tick,
        Err(error) => {
            log::error!("Failed to read the tick from the config: {:#}", error);
            None
        }
    }
}
