//! Embedded storage for proxy mode.
//!
//! All state lives behind one mutex; every logical operation (including the read-modify-write of
//! a version-gated update) holds the lock for its whole duration. When opened with a file path,
//! the state is loaded from that file at startup and written back after every change, so a
//! restarted proxy resumes incremental synchronization.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

use serde::{Deserialize, Serialize};

use super::{ApplyOutcome, Storage};
use crate::{
    dtos::{ChangeNumber, Split, StoredImpression, StoredMetric, INITIAL_CHANGE_NUMBER},
    Error, Result,
};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LocalState {
    splits_till: ChangeNumber,
    splits: HashMap<String, Split>,
    segments: HashMap<String, SegmentState>,
    impressions: VecDeque<StoredImpression>,
    metrics: VecDeque<StoredMetric>,
}

impl Default for LocalState {
    fn default() -> LocalState {
        LocalState {
            splits_till: INITIAL_CHANGE_NUMBER,
            splits: HashMap::new(),
            segments: HashMap::new(),
            impressions: VecDeque::new(),
            metrics: VecDeque::new(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SegmentState {
    till: ChangeNumber,
    keys: HashSet<String>,
}

/// Single-process [`Storage`] backend, in memory or persisted to a single file.
#[derive(Debug)]
pub struct LocalStorage {
    state: Mutex<LocalState>,
    path: Option<PathBuf>,
    /// Set when the last write to `path` failed.
    write_pending: AtomicBool,
}

impl LocalStorage {
    /// Create an empty store that is never persisted.
    pub fn in_memory() -> LocalStorage {
        LocalStorage {
            state: Mutex::new(LocalState::default()),
            path: None,
            write_pending: AtomicBool::new(false),
        }
    }

    /// Open a store persisted at `path`. If the file exists, previous state is loaded from it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUnavailable`] if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<LocalStorage> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => LocalState::default(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
                Error::StorageUnavailable(format!("cannot parse {}: {err}", path.display()))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => LocalState::default(),
            Err(err) => {
                return Err(Error::StorageUnavailable(format!(
                    "cannot read {}: {err}",
                    path.display()
                )))
            }
        };

        log::info!(target: "split_sync",
                   path:? = path,
                   splits_till = state.splits_till,
                   segments = state.segments.len();
                   "opened local storage");

        Ok(LocalStorage {
            state: Mutex::new(state),
            path: Some(path),
            write_pending: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, LocalState>> {
        self.state
            .lock()
            .map_err(|_| Error::StorageUnavailable("local storage lock poisoned".to_owned()))
    }

    /// Run `f` on the locked state. `f` also reports whether it changed the state; a change is
    /// persisted before the lock is released.
    fn mutate<T>(&self, f: impl FnOnce(&mut LocalState) -> (T, bool)) -> Result<T> {
        let mut state = self.lock()?;
        let (result, changed) = f(&mut state);
        if let Some(path) = &self.path {
            if changed || self.write_pending.load(Ordering::Relaxed) {
                // The in-memory state stays authoritative. A failed write is retried by the next
                // call.
                let failed = match persist(path, &state) {
                    Ok(()) => false,
                    Err(err) => {
                        log::warn!(target: "split_sync", path:? = path; "failed to persist local storage: {err}");
                        true
                    }
                };
                self.write_pending.store(failed, Ordering::Relaxed);
            }
        }
        Ok(result)
    }
}

fn persist(path: &Path, state: &LocalState) -> Result<()> {
    let bytes = serde_json::to_vec(state)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl Storage for LocalStorage {
    fn split_change_number(&self) -> Result<ChangeNumber> {
        Ok(self.lock()?.splits_till)
    }

    fn put_splits(
        &self,
        added: &[Split],
        removed: &[String],
        since: ChangeNumber,
        till: ChangeNumber,
    ) -> Result<ApplyOutcome> {
        self.mutate(|state| {
            let previous = state.splits_till;
            if let Some(outcome) = ApplyOutcome::gate(previous, since, till) {
                return (outcome, false);
            }
            for split in added {
                state.splits.insert(split.name.clone(), split.clone());
            }
            for name in removed {
                state.splits.remove(name);
            }
            state.splits_till = till;
            (ApplyOutcome::Applied { previous, till }, true)
        })
    }

    fn splits(&self) -> Result<Vec<Split>> {
        Ok(self.lock()?.splits.values().cloned().collect())
    }

    fn split(&self, name: &str) -> Result<Option<Split>> {
        Ok(self.lock()?.splits.get(name).cloned())
    }

    fn segment_change_number(&self, name: &str) -> Result<ChangeNumber> {
        Ok(self
            .lock()?
            .segments
            .get(name)
            .map_or(INITIAL_CHANGE_NUMBER, |segment| segment.till))
    }

    fn put_segment_delta(
        &self,
        name: &str,
        added: &[String],
        removed: &[String],
        since: ChangeNumber,
        till: ChangeNumber,
    ) -> Result<ApplyOutcome> {
        self.mutate(|state| {
            let previous = state
                .segments
                .get(name)
                .map_or(INITIAL_CHANGE_NUMBER, |segment| segment.till);
            if let Some(outcome) = ApplyOutcome::gate(previous, since, till) {
                return (outcome, false);
            }
            let segment = state
                .segments
                .entry(name.to_owned())
                .or_insert_with(|| SegmentState {
                    till: INITIAL_CHANGE_NUMBER,
                    keys: HashSet::new(),
                });
            segment.keys.extend(added.iter().cloned());
            for key in removed {
                segment.keys.remove(key);
            }
            segment.till = till;
            (ApplyOutcome::Applied { previous, till }, true)
        })
    }

    fn segment_keys(&self, name: &str) -> Result<HashSet<String>> {
        Ok(self
            .lock()?
            .segments
            .get(name)
            .map(|segment| segment.keys.clone())
            .unwrap_or_default())
    }

    fn segment_contains(&self, name: &str, key: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .segments
            .get(name)
            .is_some_and(|segment| segment.keys.contains(key)))
    }

    fn push_impressions(&self, impressions: Vec<StoredImpression>) -> Result<()> {
        if impressions.is_empty() {
            return Ok(());
        }
        self.mutate(|state| {
            state.impressions.extend(impressions);
            ((), true)
        })
    }

    fn pop_impressions(&self, max_count: usize) -> Result<Vec<StoredImpression>> {
        self.mutate(|state| {
            let count = max_count.min(state.impressions.len());
            (state.impressions.drain(..count).collect(), count > 0)
        })
    }

    fn impressions_count(&self) -> Result<usize> {
        Ok(self.lock()?.impressions.len())
    }

    fn push_metrics(&self, metrics: Vec<StoredMetric>) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        self.mutate(|state| {
            state.metrics.extend(metrics);
            ((), true)
        })
    }

    fn pop_metrics(&self, max_count: usize) -> Result<Vec<StoredMetric>> {
        self.mutate(|state| {
            let count = max_count.min(state.metrics.len());
            (state.metrics.drain(..count).collect(), count > 0)
        })
    }

    fn metrics_count(&self) -> Result<usize> {
        Ok(self.lock()?.metrics.len())
    }
}
