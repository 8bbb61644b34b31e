//! Contains the reloadable configuration of a cache.
//!
//! The configuration is read from a YAML file (most probably **config/settings.yml**). The file
//! is observed for changes and reloaded once a change is detected. Therefore the intervals of
//! the tasks of a cache can be tuned without restarting the application. The relevant part of the
//! file looks like:
//!
//! ```yaml
//! cache:
//!     # Period of the scheduler tick loop.
//!     tick: 1s
//!     tasks:
//!         forum-mods:
//!             interval: 10m
//! ```
//!
//! Durations can either be given as number of milliseconds or as string using one of the suffixes
//! supported by [parse_duration](crate::fmt::parse_duration).
//!
//! Note that the **Config** struct can be created once and then kept around. However, the handle
//! obtained via **Config::current()** should not be stored, as it will not be updated once a new
//! config has been loaded.
//!
//! # Examples
//!
//! ```
//! # use interval_cache::cache::IntervalCache;
//! # use interval_cache::config::Config;
//! # use std::time::Duration;
//! # fn main() -> anyhow::Result<()> {
//! let cache = IntervalCache::new();
//! cache.every("forum-mods", Duration::from_secs(60), |mods: Vec<String>| async move { Ok(mods) }, Vec::new())?;
//!
//! let config = Config::new("settings.yml");
//! config.load_from_string("
//! cache:
//!     tasks:
//!         forum-mods:
//!             interval: 10m
//! ", None)?;
//!
//! assert_eq!(config.current().query("cache.tasks.forum-mods.interval").as_str(), Some("10m"));
//! cache.apply_config(&config)?;
//! # Ok(())
//! # }
//! ```
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use arc_swap::ArcSwap;
use tokio::sync::broadcast::error::RecvError;
use yaml_rust::{Yaml, YamlLoader};

use crate::cache::IntervalCache;
use crate::error::CacheError;
use crate::fmt::{format_duration, parse_duration};

/// Provides access to the configuration file.
///
/// Note that it is highly recommended to register a change listener by calling
/// `Config::notifier()` (or to use [IntervalCache::watch_config]) so that config changes are
/// picked up without restarting the application.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The actual message being broadcast
/// can and should be ignored. All that matters is, once a message has been received, the config
/// was changed and needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
///
/// Note that this handle should not be stored or kept around for long, as it will not be updated
/// if the underlying config changed.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Note that this will not install a change listener. This is only done by the
    /// [install] function.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((Yaml::Null, None))),
            tx,
        }
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines the last modified date of the config file on disk.
    ///
    /// As within docker, the file is presented as volume, we check that it is a file, as an
    /// unmounted docker volume is always presented as directory.
    #[cfg(not(test))]
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Reads the underlying file.
    ///
    /// If the file is missing (or a directory), this is a no-op. If the file cannot be parsed, the
    /// previously loaded config remains active.
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        if let Ok(metadata) = tokio::fs::metadata(&self.filename).await {
            if !metadata.is_file() {
                log::info!(
                    "Config file doesn't exist or is an unmounted docker volume - skipping config load."
                );
                return Ok(());
            }
        }

        let config_data = tokio::fs::read_to_string(&self.filename)
            .await
            .with_context(|| format!("Cannot load config file {}", &self.filename))?;

        let last_modified = tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok());

        self.load_from_string(config_data.as_str(), last_modified)
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// This is intended to be used in test environments where we cannot / do not want to load
    /// a config file from disk.
    ///
    /// # Example
    ///
    /// ```
    /// # use interval_cache::config::Config;
    /// let config = Config::new("somefile.yml");
    /// config.load_from_string("
    /// cache:
    ///     tick: 500ms
    /// ", None).unwrap();
    ///
    /// assert_eq!(config.current().query("cache.tick").as_str(), Some("500ms"));
    ///
    /// // An invalid config is rejected and the previous one remains active...
    /// assert_eq!(config.load_from_string("cache: 'invalid", None).is_err(), true);
    /// assert_eq!(config.current().query("cache.tick").as_str(), Some("500ms"));
    /// ```
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let mut docs = YamlLoader::load_from_str(data)
            .with_context(|| format!("Cannot parse config file {}", &self.filename))?;

        let doc = if docs.is_empty() {
            Yaml::Null
        } else {
            docs.swap_remove(0)
        };

        self.config.store(Arc::new((doc, last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.send(());

        Ok(())
    }
}

impl Handle {
    /// Resolves a dot separated path like **cache.tasks.forum-mods.interval**.
    ///
    /// Returns **Yaml::BadValue** if the path doesn't exist.
    pub fn query(&self, query: impl AsRef<str>) -> &Yaml {
        query
            .as_ref()
            .split('.')
            .fold(&self.config.0, |node, key| &node[key])
    }
}

/// Contains the cache related settings of a config.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Settings {
    /// The period of the scheduler, if configured.
    pub tick: Option<Duration>,

    /// The intervals configured for individual tasks.
    pub intervals: Vec<(String, Duration)>,
}

fn read_duration(value: &Yaml, path: &str) -> anyhow::Result<Option<Duration>> {
    match value {
        Yaml::BadValue | Yaml::Null => Ok(None),
        Yaml::Integer(millis) => u64::try_from(*millis)
            .map(|millis| Some(Duration::from_millis(millis)))
            .with_context(|| format!("{} must not be negative", path)),
        Yaml::String(value) => parse_duration(value)
            .map(Some)
            .with_context(|| format!("Invalid duration in {}", path)),
        other => Err(anyhow::anyhow!(
            "{} must be a duration but is {:?}",
            path,
            other
        )),
    }
}

impl Settings {
    /// Extracts the settings from the **cache** section of the given config.
    pub fn from_handle(handle: &Handle) -> anyhow::Result<Settings> {
        let tick = read_duration(handle.query("cache.tick"), "cache.tick")?;

        let mut intervals = Vec::new();
        if let Yaml::Hash(tasks) = handle.query("cache.tasks") {
            for (key, task) in tasks {
                let key = match key.as_str() {
                    Some(key) => key,
                    None => {
                        log::warn!("Ignoring non-string task key {:?} in the config.", key);
                        continue;
                    }
                };

                let path = format!("cache.tasks.{}.interval", key);
                if let Some(interval) = read_duration(&task["interval"], &path)? {
                    intervals.push((key.to_owned(), interval));
                }
            }
        }

        Ok(Settings { tick, intervals })
    }
}

impl<V: Clone + Send + Sync + 'static> IntervalCache<V> {
    /// Applies the task intervals of the given config.
    ///
    /// Unknown keys and one-shot tasks are logged and skipped.
    ///
    /// # Errors
    /// Fails if the config contains invalid durations. In this case nothing is changed.
    pub fn apply_config(&self, config: &Config) -> anyhow::Result<()> {
        let settings = Settings::from_handle(&config.current())?;

        for (key, interval) in settings.intervals {
            match self.registry.set_interval(&key, interval) {
                Ok(Some(previous)) if previous != interval => log::info!(
                    "Updating interval of {} from {} to {}.",
                    key,
                    format_duration(previous),
                    format_duration(interval)
                ),
                Ok(Some(_)) => (),
                Ok(None) => log::warn!(
                    "Cannot apply an interval to {} as it is a one-shot task.",
                    key
                ),
                Err(CacheError::UnknownKey(_)) => {
                    log::warn!("The config contains an interval for the unknown task {}.", key)
                }
                Err(error) => log::warn!("Cannot apply the interval of {}: {}", key, error),
            }
        }

        Ok(())
    }

    /// Re-applies the given config whenever it changes.
    ///
    /// The listener terminates once the scheduler which was running when this was called is
    /// stopped, or once either the cache or the config is dropped.
    pub fn watch_config(self: &Arc<Self>, config: Arc<Config>) {
        let cache = Arc::downgrade(self);
        let mut notifier = config.notifier();
        let config = Arc::downgrade(&config);
        let stopped = self.scheduler().clone();

        crate::spawn!(async move {
            loop {
                let change = match &stopped {
                    Some(token) => tokio::select! {
                        _ = token.cancelled() => break,
                        change = notifier.recv() => change,
                    },
                    None => notifier.recv().await,
                };

                match change {
                    Ok(()) => (),
                    Err(RecvError::Lagged(_)) => (),
                    Err(RecvError::Closed) => break,
                }

                match (cache.upgrade(), config.upgrade()) {
                    (Some(cache), Some(config)) => {
                        if let Err(error) = cache.apply_config(&config) {
                            log::error!("Failed to apply the updated config: {:#}", error);
                        }
                    }
                    _ => break,
                }
            }
        });
    }
}

/// Creates a **Config** for the given file and loads it.
///
/// This also installs a change listener for this file, which checks every two seconds if the file
/// has been modified. Note that this listener will only watch the "last modified" date of the file
/// and will not perform a structural comparison.
pub async fn install(file: &str) -> Arc<Config> {
    if let Some(parent) = Path::new(file).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(error) = tokio::fs::create_dir_all(parent).await {
                log::warn!(
                    "Failed to create config base directory {}: {}",
                    parent.to_string_lossy(),
                    error
                )
            }
        }
    }

    let config = Arc::new(Config::new(file));
    if let Err(error) = config.load().await {
        log::error!("{:#}", error);
    }

    run_config_change_monitor(Arc::downgrade(&config));

    config
}

#[cfg(test)]
fn run_config_change_monitor(_config: std::sync::Weak<Config>) {
    // No automatic updates during testing...
}

#[cfg(not(test))]
fn run_config_change_monitor(config: std::sync::Weak<Config>) {
    crate::spawn!(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let config = match config.upgrade() {
                Some(config) => config,
                None => return,
            };

            // This will contain the last modified date of the file on disk or be None if the
            // file is absent...
            let last_modified = config.last_modified().await;

            // Contains the timestamp when the file was loaded the last time or be None if no
            // data has been loaded yet...
            let last_loaded = config.config.load().1;

            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => log::info!("Cache configuration was re-loaded."),
                    Err(error) => log::error!("Failed to re-load cache config: {:#}", error),
                }
            }
        }
    });
}
