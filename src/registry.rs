//! Stores all tasks of a cache by their key.
//!
//! The registry is the only place where the state of a task is modified. Each operation takes
//! the lock once, performs its reads and writes and releases the lock again. Therefore a lock is
//! never held across an await point and each operation is atomic with respect to all others.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use itertools::Itertools;

use crate::clock::Timestamp;
use crate::error::{CacheError, CacheResult};
use crate::stats::{TaskInfo, TaskMetrics};
use crate::task::{Producer, Schedule, Task};

/// Keeps the tasks of a cache.
pub(crate) struct Registry<V> {
    tasks: RwLock<HashMap<String, Task<V>>>,
    tokens: AtomicU64,
}

/// Contains everything a refresh needs to know about a task before invoking its producer.
pub(crate) struct Snapshot<V> {
    pub(crate) token: u64,
    pub(crate) value: V,
    pub(crate) producer: Arc<dyn Producer<V>>,
    pub(crate) metrics: Arc<TaskMetrics>,
}

/// Describes what happened when a refresh tried to store its result.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Reconciliation<V> {
    /// The result has been stored.
    Committed(V),
    /// A synchronous write happened in the meantime. Contains the current value.
    Superseded(V),
    /// The task has been removed in the meantime. Contains the discarded result.
    Removed(V),
}

/// Lazily enumerates the keys of all due tasks.
///
/// The state of all tasks is copied when the iterator is created, so that the registry isn't
/// locked while the iterator is being consumed. Therefore the result reflects the state at the
/// time the iterator was created.
pub struct DueTasks {
    now: Timestamp,
    candidates: std::vec::IntoIter<(String, Schedule, Option<Timestamp>, bool)>,
}

impl Iterator for DueTasks {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        let now = self.now;
        self.candidates
            .by_ref()
            .find(|(_, schedule, last_run, produced)| schedule.is_due(now, *last_run, *produced))
            .map(|(key, _, _, _)| key)
    }
}

impl<V: Clone> Registry<V> {
    pub(crate) fn new() -> Self {
        Registry {
            tasks: RwLock::new(HashMap::new()),
            tokens: AtomicU64::new(1),
        }
    }

    /// Draws the next write token. Tokens are unique for the lifetime of the registry.
    fn next_token(&self) -> u64 {
        self.tokens.fetch_add(1, Ordering::Relaxed)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Task<V>>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Task<V>>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a new task with the given seed as its value.
    pub(crate) fn register(
        &self,
        key: &str,
        schedule: Schedule,
        producer: Arc<dyn Producer<V>>,
        seed: V,
    ) -> CacheResult<()> {
        let mut tasks = self.write();
        if tasks.contains_key(key) {
            return Err(CacheError::DuplicateKey(key.to_owned()));
        }

        let task = Task::new(schedule, producer, seed, self.next_token());
        let _ = tasks.insert(key.to_owned(), task);
        Ok(())
    }

    pub(crate) fn remove(&self, key: &str) -> CacheResult<V> {
        self.write()
            .remove(key)
            .map(|task| task.value)
            .ok_or_else(|| CacheError::UnknownKey(key.to_owned()))
    }

    pub(crate) fn get(&self, key: &str) -> Option<V> {
        self.read().get(key).map(|task| task.value.clone())
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.read().len()
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().sorted().collect()
    }

    /// Returns the keys of all tasks which are due at **now**.
    pub(crate) fn list_due(&self, now: Timestamp) -> DueTasks {
        let candidates: Vec<_> = self
            .read()
            .iter()
            .map(|(key, task)| (key.clone(), task.schedule, task.written_at(), task.produced))
            .collect();

        DueTasks {
            now,
            candidates: candidates.into_iter(),
        }
    }

    pub(crate) fn snapshot(&self, key: &str) -> Option<Snapshot<V>> {
        self.read().get(key).map(|task| Snapshot {
            token: task.token,
            value: task.value.clone(),
            producer: task.producer.clone(),
            metrics: task.metrics.clone(),
        })
    }

    /// Overwrites the value of the given task.
    pub(crate) fn set(&self, key: &str, value: V, now: Timestamp) -> CacheResult<()> {
        match self.write().get_mut(key) {
            Some(task) => {
                task.commit(value, now, true, self.next_token());
                Ok(())
            }
            None => Err(CacheError::UnknownKey(key.to_owned())),
        }
    }

    /// Replaces the value of the given task by the result of the transformation.
    ///
    /// As the write lock is held while the transformation runs, no refresh can commit in between
    /// reading and writing the value.
    pub(crate) fn update<F>(&self, key: &str, transform: F, now: Timestamp) -> CacheResult<V>
    where
        F: FnOnce(&V) -> V,
    {
        match self.write().get_mut(key) {
            Some(task) => {
                let value = transform(&task.value);
                task.commit(value.clone(), now, true, self.next_token());
                Ok(value)
            }
            None => Err(CacheError::UnknownKey(key.to_owned())),
        }
    }

    /// Stores the result of a refresh unless the task has been written (or removed and registered
    /// again) since the snapshot with the given token was taken.
    ///
    /// **produced** is false if the producer failed and **value** is the previous value.
    pub(crate) fn reconcile(
        &self,
        key: &str,
        token: u64,
        value: V,
        now: Timestamp,
        produced: bool,
    ) -> Reconciliation<V> {
        match self.write().get_mut(key) {
            Some(task) if task.token == token => {
                task.commit(value.clone(), now, produced, self.next_token());
                Reconciliation::Committed(value)
            }
            Some(task) => Reconciliation::Superseded(task.value.clone()),
            None => Reconciliation::Removed(value),
        }
    }

    /// Changes the interval of a recurring task.
    ///
    /// Returns the previous interval or **None** if the task is a one-shot task (which is left
    /// unchanged).
    pub(crate) fn set_interval(
        &self,
        key: &str,
        interval: Duration,
    ) -> CacheResult<Option<Duration>> {
        match self.write().get_mut(key) {
            Some(task) => match task.schedule {
                Schedule::Every(previous) => {
                    task.schedule = Schedule::Every(interval);
                    Ok(Some(previous))
                }
                Schedule::Once => Ok(None),
            },
            None => Err(CacheError::UnknownKey(key.to_owned())),
        }
    }

    /// Creates a snapshot of the statistics of all tasks sorted by key.
    pub(crate) fn infos(&self) -> Vec<TaskInfo> {
        self.read()
            .iter()
            .sorted_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(key, task)| {
                task.metrics
                    .info(key, task.schedule, task.last_run, task.revision)
            })
            .collect()
    }
}
