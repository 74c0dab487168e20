//! Storage capability shared by the synchronization tasks, the telemetry recorders and the
//! external proxy HTTP layer.
//!
//! Two interchangeable backends implement [`Storage`]: [`RedisStorage`](redis::RedisStorage) is
//! shared between agent processes (producer mode), and [`LocalStorage`](local::LocalStorage) is
//! embedded in a single process (proxy mode). Both apply the same version gate to cache updates,
//! see [`ApplyOutcome`].
use std::collections::HashSet;

use crate::{
    dtos::{ChangeNumber, Split, StoredImpression, StoredMetric},
    Result,
};

pub mod local;
pub mod redis;

/// Result of a version-gated cache update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The diff was applied and the stored version moved from `previous` to `till`.
    Applied {
        #[allow(missing_docs)]
        previous: ChangeNumber,
        #[allow(missing_docs)]
        till: ChangeNumber,
    },
    /// The diff carries nothing newer than the stored version.
    Unchanged,
    /// The stored version has already advanced past the `since` the diff was fetched against
    /// (another producer got there first). The diff was discarded.
    Stale {
        #[allow(missing_docs)]
        stored: ChangeNumber,
        #[allow(missing_docs)]
        since: ChangeNumber,
    },
}

impl ApplyOutcome {
    /// Decide whether a diff fetched against `since` and leading to `till` may be applied on top
    /// of `stored`. Returns `None` if it should be applied.
    pub(crate) fn gate(
        stored: ChangeNumber,
        since: ChangeNumber,
        till: ChangeNumber,
    ) -> Option<ApplyOutcome> {
        if stored > since {
            Some(ApplyOutcome::Stale { stored, since })
        } else if till <= stored {
            Some(ApplyOutcome::Unchanged)
        } else {
            None
        }
    }

    #[allow(missing_docs)]
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

/// Uniform key-value/set operations over splits, segments and telemetry buffers.
///
/// Every method may fail with [`Error::StorageUnavailable`](crate::Error::StorageUnavailable);
/// callers treat it as transient and retry on their next tick.
///
/// Readers never observe a partially applied diff: [`Storage::put_splits`] and
/// [`Storage::put_segment_delta`] apply the whole diff together with the new version, or nothing.
pub trait Storage: Send + Sync {
    /// Last applied split-set version, or
    /// [`INITIAL_CHANGE_NUMBER`](crate::dtos::INITIAL_CHANGE_NUMBER).
    fn split_change_number(&self) -> Result<ChangeNumber>;

    /// Add or replace `added`, delete `removed` and store `till` as one atomic unit, provided the
    /// stored version still equals `since` (see [`ApplyOutcome`]).
    fn put_splits(
        &self,
        added: &[Split],
        removed: &[String],
        since: ChangeNumber,
        till: ChangeNumber,
    ) -> Result<ApplyOutcome>;

    /// All active splits.
    fn splits(&self) -> Result<Vec<Split>>;

    #[allow(missing_docs)]
    fn split(&self, name: &str) -> Result<Option<Split>>;

    /// Names of all segments referenced by active splits.
    fn segment_names(&self) -> Result<HashSet<String>> {
        Ok(self
            .splits()?
            .iter()
            .flat_map(|split| split.segment_names())
            .map(str::to_owned)
            .collect())
    }

    /// Last applied version of the segment, or
    /// [`INITIAL_CHANGE_NUMBER`](crate::dtos::INITIAL_CHANGE_NUMBER) if it was never synchronized.
    fn segment_change_number(&self, name: &str) -> Result<ChangeNumber>;

    /// Apply a membership delta: the segment becomes `(current ∪ added) \ removed` and its
    /// version becomes `till`, as one atomic unit gated like [`Storage::put_splits`].
    fn put_segment_delta(
        &self,
        name: &str,
        added: &[String],
        removed: &[String],
        since: ChangeNumber,
        till: ChangeNumber,
    ) -> Result<ApplyOutcome>;

    #[allow(missing_docs)]
    fn segment_keys(&self, name: &str) -> Result<HashSet<String>>;

    #[allow(missing_docs)]
    fn segment_contains(&self, name: &str, key: &str) -> Result<bool>;

    /// Append impressions to the buffer.
    fn push_impressions(&self, impressions: Vec<StoredImpression>) -> Result<()>;

    /// Remove and return up to `max_count` of the oldest buffered impressions. Concurrent callers
    /// never receive the same item.
    fn pop_impressions(&self, max_count: usize) -> Result<Vec<StoredImpression>>;

    #[allow(missing_docs)]
    fn impressions_count(&self) -> Result<usize>;

    /// Append metrics to the buffer.
    fn push_metrics(&self, metrics: Vec<StoredMetric>) -> Result<()>;

    /// Remove and return up to `max_count` of the oldest buffered metrics. Concurrent callers
    /// never receive the same item.
    fn pop_metrics(&self, max_count: usize) -> Result<Vec<StoredMetric>>;

    #[allow(missing_docs)]
    fn metrics_count(&self) -> Result<usize>;
}
