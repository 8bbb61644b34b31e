//! Contains the errors reported by keyed cache operations.
//!
//! Note that failing producers are not reported here. These are handled within the refresh
//! engine (see [refresh](crate::refresh)) and only show up in the logs and in the
//! [statistics](crate::stats::TaskInfo) of the affected task.
use thiserror::Error;

/// Enumerates the failures of operations which address a task by its key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The given key was never registered (or has been removed since).
    #[error("Unknown cache key: {0}")]
    UnknownKey(String),

    /// A task with the given key is already present.
    #[error("A task for the cache key {0} has already been registered")]
    DuplicateKey(String),
}

/// Shorthand for results of keyed cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
