//! Tasks that pull split and segment changes and apply them to storage.
//!
//! Each tick reads the stored version, fetches changes since that version and applies them with
//! the storage's version-gated update. A failed fetch changes nothing; the next tick retries from
//! the same version.
use std::{
    collections::{BTreeSet, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::{
    dtos::{ChangeNumber, Split},
    fetcher::{SegmentFetcher, SplitFetcher},
    scheduler::Scheduler,
    storage::{ApplyOutcome, Storage},
    Result,
};

/// What a synchronization tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The server had nothing newer than `version`.
    Unchanged {
        #[allow(missing_docs)]
        version: ChangeNumber,
    },
    /// Changes were applied.
    Applied {
        #[allow(missing_docs)]
        since: ChangeNumber,
        #[allow(missing_docs)]
        till: ChangeNumber,
    },
    /// Another writer advanced the stored version while we were fetching; our changes were
    /// discarded.
    Stale {
        #[allow(missing_docs)]
        stored: ChangeNumber,
        #[allow(missing_docs)]
        since: ChangeNumber,
    },
}

impl SyncOutcome {
    fn from_apply(outcome: ApplyOutcome, since: ChangeNumber) -> SyncOutcome {
        match outcome {
            ApplyOutcome::Applied { previous, till } => SyncOutcome::Applied {
                since: previous,
                till,
            },
            ApplyOutcome::Unchanged => SyncOutcome::Unchanged { version: since },
            ApplyOutcome::Stale { stored, since } => SyncOutcome::Stale { stored, since },
        }
    }
}

/// Keeps the split set in storage in sync with the central service.
pub struct SplitSynchronizer {
    fetcher: Arc<dyn SplitFetcher>,
    storage: Arc<dyn Storage>,
}

impl SplitSynchronizer {
    #[allow(missing_docs)]
    pub fn new(fetcher: Arc<dyn SplitFetcher>, storage: Arc<dyn Storage>) -> SplitSynchronizer {
        SplitSynchronizer { fetcher, storage }
    }

    /// Run one synchronization tick.
    pub fn synchronize(&self) -> Result<SyncOutcome> {
        let since = self.storage.split_change_number()?;
        log::debug!(target: "split_sync", since; "fetching split changes");
        let changes = self.fetcher.fetch_splits(since)?;

        if changes.till == since {
            log::debug!(target: "split_sync", since; "splits are up to date");
            return Ok(SyncOutcome::Unchanged { version: since });
        }

        let (archived, active): (Vec<Split>, Vec<Split>) =
            changes.splits.into_iter().partition(Split::is_archived);
        let removed: Vec<String> = archived.into_iter().map(|split| split.name).collect();

        let outcome = self
            .storage
            .put_splits(&active, &removed, since, changes.till)?;
        match outcome {
            ApplyOutcome::Applied { previous, till } => {
                log::info!(target: "split_sync",
                           since = previous,
                           till,
                           updated = active.len(),
                           removed = removed.len();
                           "applied split changes");
            }
            ApplyOutcome::Stale { stored, since } => {
                log::debug!(target: "split_sync", stored, since; "discarding stale split changes");
            }
            ApplyOutcome::Unchanged => {}
        }
        Ok(SyncOutcome::from_apply(outcome, since))
    }
}

/// Keeps one segment in storage in sync with the central service.
pub struct SegmentSynchronizer {
    name: String,
    fetcher: Arc<dyn SegmentFetcher>,
    storage: Arc<dyn Storage>,
}

impl SegmentSynchronizer {
    #[allow(missing_docs)]
    pub fn new(
        name: impl Into<String>,
        fetcher: Arc<dyn SegmentFetcher>,
        storage: Arc<dyn Storage>,
    ) -> SegmentSynchronizer {
        SegmentSynchronizer {
            name: name.into(),
            fetcher,
            storage,
        }
    }

    /// Run one synchronization tick.
    pub fn synchronize(&self) -> Result<SyncOutcome> {
        let name = self.name.as_str();
        let since = self.storage.segment_change_number(name)?;
        log::debug!(target: "split_sync", segment = name, since; "fetching segment changes");
        let changes = self.fetcher.fetch_segment(name, since)?;

        if changes.till == since {
            return Ok(SyncOutcome::Unchanged { version: since });
        }

        let outcome = self.storage.put_segment_delta(
            name,
            &changes.added,
            &changes.removed,
            since,
            changes.till,
        )?;
        if let ApplyOutcome::Applied { previous, till } = outcome {
            log::info!(target: "split_sync",
                       segment = name,
                       since = previous,
                       till,
                       added = changes.added.len(),
                       removed = changes.removed.len();
                       "applied segment changes");
        }
        Ok(SyncOutcome::from_apply(outcome, since))
    }
}

/// One scheduled synchronization task per referenced segment.
///
/// Segments are discovered from split definitions at runtime: [`SegmentTaskArena::reconcile`]
/// starts a task the first time a segment is referenced and stops it once no split references
/// it anymore. Stopping a task leaves the segment's data in storage.
pub struct SegmentTaskArena {
    scheduler: Arc<Scheduler>,
    fetcher: Arc<dyn SegmentFetcher>,
    storage: Arc<dyn Storage>,
    interval: Duration,
    tracked: Mutex<BTreeSet<String>>,
}

impl SegmentTaskArena {
    #[allow(missing_docs)]
    pub fn new(
        scheduler: Arc<Scheduler>,
        fetcher: Arc<dyn SegmentFetcher>,
        storage: Arc<dyn Storage>,
        interval: Duration,
    ) -> SegmentTaskArena {
        SegmentTaskArena {
            scheduler,
            fetcher,
            storage,
            interval,
            tracked: Mutex::default(),
        }
    }

    /// Scheduler task name of segment `name`.
    pub fn task_name(name: &str) -> String {
        format!("segment:{name}")
    }

    /// Make the set of running segment tasks match `referenced`.
    ///
    /// # Errors
    ///
    /// Returns the first error met while starting a task. Segments that failed to start are
    /// retried by the next call.
    pub fn reconcile(&self, referenced: &HashSet<String>) -> Result<()> {
        let mut tracked = self.tracked_segments();

        let unreferenced: Vec<String> = tracked
            .iter()
            .filter(|name| !referenced.contains(*name))
            .cloned()
            .collect();
        for name in unreferenced {
            self.scheduler.stop(&Self::task_name(&name));
            tracked.remove(&name);
            log::info!(target: "split_sync", segment = name.as_str(); "segment is no longer referenced, stopped its task");
        }

        let mut result = Ok(());
        for name in referenced {
            if tracked.contains(name) {
                continue;
            }
            let synchronizer =
                SegmentSynchronizer::new(name.clone(), self.fetcher.clone(), self.storage.clone());
            match self
                .scheduler
                .schedule(Self::task_name(name), self.interval, move || {
                    synchronizer.synchronize().map(|_| ())
                }) {
                Ok(()) => {
                    tracked.insert(name.clone());
                }
                Err(err) => {
                    log::warn!(target: "split_sync", segment = name.as_str(); "failed to start segment task: {err}");
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        result
    }

    /// Names of segments with a running task, sorted.
    pub fn tracked(&self) -> Vec<String> {
        self.tracked_segments().iter().cloned().collect()
    }

    fn tracked_segments(&self) -> MutexGuard<'_, BTreeSet<String>> {
        // Only held while starting or stopping tasks, which never panics mid-update.
        self.tracked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::Arc,
        time::Duration,
    };

    use super::{SegmentSynchronizer, SegmentTaskArena, SplitSynchronizer, SyncOutcome};
    use crate::{
        dtos::{ChangeNumber, SegmentChanges, SplitChanges},
        fetcher::{SegmentFetcher, SplitFetcher},
        scheduler::{tests::wait_until, Scheduler},
        storage::{local::LocalStorage, Storage},
        testing::{archived, split, ScriptedSplitFetcher, StaticSegmentFetcher},
        Error, Result,
    };

    fn changes(splits: Vec<crate::dtos::Split>, since: i64, till: i64) -> Result<SplitChanges> {
        Ok(SplitChanges {
            splits,
            since,
            till,
        })
    }

    #[test]
    fn applies_added_and_archived_splits() {
        let storage = Arc::new(LocalStorage::in_memory());
        let fetcher = Arc::new(ScriptedSplitFetcher::new([
            changes(vec![split("a", 1, &[]), split("b", 1, &["beta"])], -1, 1),
            changes(vec![archived("a", 2), split("c", 2, &[])], 1, 2),
        ]));
        let synchronizer = SplitSynchronizer::new(fetcher.clone(), storage.clone());

        assert_eq!(
            synchronizer.synchronize().unwrap(),
            SyncOutcome::Applied { since: -1, till: 1 }
        );
        assert_eq!(
            synchronizer.synchronize().unwrap(),
            SyncOutcome::Applied { since: 1, till: 2 }
        );

        assert!(storage.split("a").unwrap().is_none());
        assert!(storage.split("b").unwrap().is_some());
        assert!(storage.split("c").unwrap().is_some());
        assert_eq!(storage.split_change_number().unwrap(), 2);
        assert_eq!(
            storage.segment_names().unwrap(),
            HashSet::from(["beta".to_owned()])
        );
        assert_eq!(*fetcher.calls.lock().unwrap(), vec![-1, 1]);
    }

    #[test]
    fn no_changes_is_a_noop() {
        let storage = Arc::new(LocalStorage::in_memory());
        storage.put_splits(&[split("a", 4, &[])], &[], -1, 4).unwrap();
        let fetcher = Arc::new(ScriptedSplitFetcher::default());

        let outcome = SplitSynchronizer::new(fetcher, storage.clone())
            .synchronize()
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Unchanged { version: 4 });
        assert_eq!(storage.split_change_number().unwrap(), 4);
    }

    #[test]
    fn failed_fetch_keeps_previous_state() {
        let storage = Arc::new(LocalStorage::in_memory());
        storage.put_splits(&[split("a", 4, &[])], &[], -1, 4).unwrap();
        let fetcher = Arc::new(ScriptedSplitFetcher::new([
            Err(Error::UnexpectedStatus(reqwest::StatusCode::BAD_GATEWAY)),
            changes(vec![split("b", 5, &[])], 4, 5),
        ]));
        let synchronizer = SplitSynchronizer::new(fetcher.clone(), storage.clone());

        assert!(synchronizer.synchronize().is_err());
        assert_eq!(storage.split_change_number().unwrap(), 4);
        assert_eq!(storage.splits().unwrap().len(), 1);

        // The next tick retries from the same version.
        synchronizer.synchronize().unwrap();
        assert_eq!(*fetcher.calls.lock().unwrap(), vec![4, 4]);
        assert_eq!(storage.split_change_number().unwrap(), 5);
    }

    /// Simulates another producer writing a newer version while our fetch is in flight.
    struct RacingFetcher {
        storage: Arc<LocalStorage>,
    }

    impl SplitFetcher for RacingFetcher {
        fn fetch_splits(&self, since: ChangeNumber) -> Result<SplitChanges> {
            self.storage
                .put_splits(&[split("other", 5, &[])], &[], since, 5)
                .unwrap();
            changes(vec![split("ours", 4, &[])], since, 4)
        }
    }

    #[test]
    fn concurrent_newer_write_wins() {
        let storage = Arc::new(LocalStorage::in_memory());
        storage.put_splits(&[], &[], -1, 3).unwrap();
        let fetcher = Arc::new(RacingFetcher {
            storage: storage.clone(),
        });

        let outcome = SplitSynchronizer::new(fetcher, storage.clone())
            .synchronize()
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Stale { stored: 5, since: 3 });
        assert_eq!(storage.split_change_number().unwrap(), 5);
        assert!(storage.split("ours").unwrap().is_none());
    }

    struct DeltaFetcher;

    impl SegmentFetcher for DeltaFetcher {
        fn fetch_segment(&self, name: &str, since: ChangeNumber) -> Result<SegmentChanges> {
            let (added, removed, till) = match since {
                -1 => (vec!["a", "b", "c"], vec![], 1),
                1 => (vec!["d"], vec!["b"], 2),
                _ => (vec![], vec![], since),
            };
            Ok(SegmentChanges {
                name: name.to_owned(),
                added: added.into_iter().map(str::to_owned).collect(),
                removed: removed.into_iter().map(str::to_owned).collect(),
                since,
                till,
            })
        }
    }

    #[test]
    fn segment_synchronizer_applies_deltas_in_order() {
        let storage = Arc::new(LocalStorage::in_memory());
        let synchronizer =
            SegmentSynchronizer::new("beta", Arc::new(DeltaFetcher), storage.clone());

        assert_eq!(
            synchronizer.synchronize().unwrap(),
            SyncOutcome::Applied { since: -1, till: 1 }
        );
        assert_eq!(
            synchronizer.synchronize().unwrap(),
            SyncOutcome::Applied { since: 1, till: 2 }
        );
        assert_eq!(
            synchronizer.synchronize().unwrap(),
            SyncOutcome::Unchanged { version: 2 }
        );

        let expected: HashSet<String> = ["a", "c", "d"].into_iter().map(str::to_owned).collect();
        assert_eq!(storage.segment_keys("beta").unwrap(), expected);
    }

    #[test]
    fn arena_starts_and_stops_segment_tasks() {
        let scheduler = Arc::new(Scheduler::new());
        let storage = Arc::new(LocalStorage::in_memory());
        let fetcher = Arc::new(StaticSegmentFetcher {
            segments: HashMap::from([
                ("beta".to_owned(), (vec!["u1".to_owned()], 7)),
                ("employees".to_owned(), (vec!["u2".to_owned()], 3)),
            ]),
            failing: Vec::new(),
        });
        let arena = SegmentTaskArena::new(
            scheduler.clone(),
            fetcher,
            storage.clone(),
            Duration::from_millis(10),
        );

        arena
            .reconcile(&HashSet::from(["beta".to_owned(), "employees".to_owned()]))
            .unwrap();
        assert_eq!(arena.tracked(), vec!["beta".to_owned(), "employees".to_owned()]);
        assert!(scheduler.is_scheduled("segment:beta"));
        assert!(wait_until(Duration::from_secs(5), || {
            storage.segment_change_number("beta").unwrap() == 7
                && storage.segment_change_number("employees").unwrap() == 3
        }));
        assert!(storage.segment_contains("beta", "u1").unwrap());

        arena
            .reconcile(&HashSet::from(["beta".to_owned()]))
            .unwrap();
        assert_eq!(arena.tracked(), vec!["beta".to_owned()]);
        assert!(!scheduler.is_scheduled("segment:employees"));
        // Data of unreferenced segments stays in storage.
        assert!(storage.segment_contains("employees", "u2").unwrap());

        // Reconciling again with the same set keeps the running task.
        arena
            .reconcile(&HashSet::from(["beta".to_owned()]))
            .unwrap();
        assert_eq!(scheduler.task_names(), vec!["segment:beta".to_owned()]);

        scheduler.shutdown().unwrap();
    }
}
