//! Shared storage for producer mode, backed by Redis.
//!
//! Several agent processes (and the SDKs reading the cache) may share the same Redis instance, so
//! version-gated updates run as optimistic transactions: the version key is `WATCH`ed, checked
//! with [`ApplyOutcome::gate`], and the whole diff is written with `MULTI`/`EXEC`. If another
//! producer touches the version key in between, the transaction is retried against the new
//! version. Buffer pops read and trim the list inside one `MULTI`/`EXEC`, so concurrent recorders
//! never receive the same item.
//!
//! Key layout, relative to the configured prefix:
//!
//! ```text
//! SPLITIO.splits.till            split-set version
//! SPLITIO.split.{name}           split definition (JSON)
//! SPLITIO.segments.registered    set of segment names referenced by splits
//! SPLITIO.segment.{name}         segment members (set)
//! SPLITIO.segment.{name}.till    segment version
//! SPLITIO.impressions            impressions buffer (list of JSON)
//! SPLITIO.metrics                metrics buffer (list of JSON)
//! ```
use std::{
    collections::{BTreeSet, HashSet},
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use redis::{Commands, Connection, RedisResult};
use serde::{de::DeserializeOwned, Serialize};

use super::{ApplyOutcome, Storage};
use crate::{
    config::RedisConfig,
    dtos::{ChangeNumber, Split, StoredImpression, StoredMetric, INITIAL_CHANGE_NUMBER},
    Error, Result,
};

/// Builds prefixed key names.
#[derive(Debug, Clone, Default)]
pub(crate) struct Keys {
    prefix: String,
}

impl Keys {
    pub(crate) fn new(prefix: impl Into<String>) -> Keys {
        Keys {
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{}.{}", self.prefix, key)
        }
    }

    pub(crate) fn splits_till(&self) -> String {
        self.key("SPLITIO.splits.till")
    }

    pub(crate) fn split(&self, name: &str) -> String {
        self.key(&format!("SPLITIO.split.{name}"))
    }

    /// `SCAN` pattern matching every split key. Glob characters of the prefix match literally.
    pub(crate) fn split_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.prefix.len() + 16);
        for c in self.prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        if !pattern.is_empty() {
            pattern.push('.');
        }
        pattern.push_str("SPLITIO.split.*");
        pattern
    }

    pub(crate) fn registered_segments(&self) -> String {
        self.key("SPLITIO.segments.registered")
    }

    pub(crate) fn segment(&self, name: &str) -> String {
        self.key(&format!("SPLITIO.segment.{name}"))
    }

    pub(crate) fn segment_till(&self, name: &str) -> String {
        self.key(&format!("SPLITIO.segment.{name}.till"))
    }

    pub(crate) fn impressions(&self) -> String {
        self.key("SPLITIO.impressions")
    }

    pub(crate) fn metrics(&self) -> String {
        self.key("SPLITIO.metrics")
    }
}

/// [`Storage`] backend shared between processes through Redis.
pub struct RedisStorage {
    client: redis::Client,
    keys: Keys,
    /// Idle connections. Connections are taken out for the duration of one operation and put back
    /// only if the operation succeeded.
    pool: Mutex<Vec<Connection>>,
    pool_size: usize,
    max_retries: usize,
    dial_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl RedisStorage {
    /// Create a storage from configuration. No connection is made until the first operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the connection parameters do not form a valid
    /// Redis URL.
    pub fn new(config: &RedisConfig) -> Result<RedisStorage> {
        let client = redis::Client::open(config.connection_url()?.as_str())
            .map_err(|err| Error::InvalidConfiguration(format!("redis: {err}")))?;

        Ok(RedisStorage {
            client,
            keys: Keys::new(config.prefix.clone()),
            pool: Mutex::new(Vec::new()),
            pool_size: config.pool_size.max(1),
            max_retries: config.max_retries,
            dial_timeout: config.dial_timeout,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        })
    }

    fn idle(&self) -> Result<MutexGuard<'_, Vec<Connection>>> {
        self.pool
            .lock()
            .map_err(|_| Error::StorageUnavailable("redis pool lock poisoned".to_owned()))
    }

    fn connect(&self) -> RedisResult<Connection> {
        let connection = self.client.get_connection_with_timeout(self.dial_timeout)?;
        connection.set_read_timeout(Some(self.read_timeout))?;
        connection.set_write_timeout(Some(self.write_timeout))?;
        Ok(connection)
    }

    /// Run `f` on a pooled connection. Connection-level failures are retried up to
    /// `max_retries` times on a fresh connection.
    fn with_connection<T>(
        &self,
        mut f: impl FnMut(&mut Connection) -> RedisResult<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            let pooled = self.idle()?.pop();
            let result = match pooled {
                Some(connection) => Ok(connection),
                None => self.connect(),
            }
            .and_then(|mut connection| f(&mut connection).map(|value| (value, connection)));

            match result {
                Ok((value, connection)) => {
                    let mut idle = self.idle()?;
                    if idle.len() < self.pool_size {
                        idle.push(connection);
                    }
                    return Ok(value);
                }
                Err(err) if attempt < self.max_retries && is_connection_error(&err) => {
                    attempt += 1;
                    log::debug!(target: "split_sync", attempt; "retrying redis command: {err}");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn push_json<T: Serialize>(&self, key: &str, items: &[T]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let encoded = items
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.with_connection(|con| con.rpush(key, &encoded))
    }

    fn pop_json<T: DeserializeOwned>(&self, key: &str, max_count: usize) -> Result<Vec<T>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(max_count).unwrap_or(isize::MAX);
        let (raw,): (Vec<String>,) = self.with_connection(|con| {
            redis::pipe()
                .atomic()
                .lrange(key, 0, stop - 1)
                .ltrim(key, stop, -1)
                .ignore()
                .query(con)
        })?;

        // Items are already removed from the buffer; an undecodable item cannot be retried.
        Ok(raw
            .iter()
            .filter_map(|item| {
                serde_json::from_str(item)
                    .inspect_err(|err| {
                        log::warn!(target: "split_sync", key; "dropping undecodable buffered item: {err}");
                    })
                    .ok()
            })
            .collect())
    }
}

/// Segment names referenced by the split set that results from applying `added` and `removed`
/// to `current`.
fn referenced_segments(
    current: &[Split],
    added: &[Split],
    removed: &[String],
) -> BTreeSet<String> {
    let replaced: HashSet<&str> = added
        .iter()
        .map(|split| split.name.as_str())
        .chain(removed.iter().map(String::as_str))
        .collect();
    current
        .iter()
        .filter(|split| !replaced.contains(split.name.as_str()))
        .chain(added)
        .flat_map(|split| split.segment_names())
        .map(str::to_owned)
        .collect()
}

/// Read every stored split. Undecodable payloads are skipped.
fn stored_splits(con: &mut Connection, pattern: &str) -> RedisResult<Vec<Split>> {
    let keys: Vec<String> = con.scan_match(pattern)?.collect();
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let payloads: Vec<Option<String>> = con.mget(&keys)?;
    Ok(payloads
        .into_iter()
        .flatten()
        .filter_map(|payload| {
            serde_json::from_str(&payload)
                .inspect_err(|err| {
                    log::warn!(target: "split_sync", "skipping undecodable stored split: {err}");
                })
                .ok()
        })
        .collect())
}

fn is_connection_error(err: &redis::RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_timeout()
}

impl Storage for RedisStorage {
    fn split_change_number(&self) -> Result<ChangeNumber> {
        let till_key = self.keys.splits_till();
        let till: Option<ChangeNumber> = self.with_connection(|con| con.get(&till_key))?;
        Ok(till.unwrap_or(INITIAL_CHANGE_NUMBER))
    }

    fn put_splits(
        &self,
        added: &[Split],
        removed: &[String],
        since: ChangeNumber,
        till: ChangeNumber,
    ) -> Result<ApplyOutcome> {
        let till_key = self.keys.splits_till();
        let payloads = added
            .iter()
            .map(|split| {
                serde_json::to_string(split).map(|payload| (self.keys.split(&split.name), payload))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let removed_keys: Vec<String> = removed.iter().map(|name| self.keys.split(name)).collect();
        let registered_key = self.keys.registered_segments();
        let split_pattern = self.keys.split_pattern();

        self.with_connection(|con| {
            redis::transaction(con, &[&till_key], |con, pipe| {
                let stored: Option<ChangeNumber> = con.get(&till_key)?;
                let previous = stored.unwrap_or(INITIAL_CHANGE_NUMBER);
                if let Some(outcome) = ApplyOutcome::gate(previous, since, till) {
                    return Ok(Some(outcome));
                }
                let current = stored_splits(con, &split_pattern)?;
                let segment_names = referenced_segments(&current, added, removed);

                for (key, payload) in &payloads {
                    pipe.set(key, payload).ignore();
                }
                if !removed_keys.is_empty() {
                    pipe.del(&removed_keys).ignore();
                }
                // Rewritten as a whole so segments no split references anymore drop out.
                pipe.del(&registered_key).ignore();
                if !segment_names.is_empty() {
                    pipe.sadd(&registered_key, &segment_names).ignore();
                }
                pipe.set(&till_key, till).ignore();

                // `None` means another writer touched the version key; the transaction is retried.
                let executed: Option<()> = pipe.query(con)?;
                Ok(executed.map(|()| ApplyOutcome::Applied { previous, till }))
            })
        })
    }

    fn splits(&self) -> Result<Vec<Split>> {
        let pattern = self.keys.split_pattern();
        let payloads: Vec<Option<String>> = self.with_connection(|con| {
            let keys: Vec<String> = con.scan_match(&pattern)?.collect();
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            con.mget(&keys)
        })?;

        payloads
            .into_iter()
            .flatten()
            .map(|payload| serde_json::from_str(&payload).map_err(Error::from))
            .collect()
    }

    fn split(&self, name: &str) -> Result<Option<Split>> {
        let key = self.keys.split(name);
        let payload: Option<String> = self.with_connection(|con| con.get(&key))?;
        payload
            .map(|payload| serde_json::from_str(&payload).map_err(Error::from))
            .transpose()
    }

    fn segment_change_number(&self, name: &str) -> Result<ChangeNumber> {
        let till_key = self.keys.segment_till(name);
        let till: Option<ChangeNumber> = self.with_connection(|con| con.get(&till_key))?;
        Ok(till.unwrap_or(INITIAL_CHANGE_NUMBER))
    }

    fn put_segment_delta(
        &self,
        name: &str,
        added: &[String],
        removed: &[String],
        since: ChangeNumber,
        till: ChangeNumber,
    ) -> Result<ApplyOutcome> {
        let till_key = self.keys.segment_till(name);
        let members_key = self.keys.segment(name);

        self.with_connection(|con| {
            redis::transaction(con, &[&till_key], |con, pipe| {
                let stored: Option<ChangeNumber> = con.get(&till_key)?;
                let previous = stored.unwrap_or(INITIAL_CHANGE_NUMBER);
                if let Some(outcome) = ApplyOutcome::gate(previous, since, till) {
                    return Ok(Some(outcome));
                }

                // MULTI preserves order: removes run after adds.
                if !added.is_empty() {
                    pipe.sadd(&members_key, added).ignore();
                }
                if !removed.is_empty() {
                    pipe.srem(&members_key, removed).ignore();
                }
                pipe.set(&till_key, till).ignore();

                let executed: Option<()> = pipe.query(con)?;
                Ok(executed.map(|()| ApplyOutcome::Applied { previous, till }))
            })
        })
    }

    fn segment_keys(&self, name: &str) -> Result<HashSet<String>> {
        let key = self.keys.segment(name);
        self.with_connection(|con| con.smembers(&key))
    }

    fn segment_contains(&self, name: &str, key: &str) -> Result<bool> {
        let members_key = self.keys.segment(name);
        self.with_connection(|con| con.sismember(&members_key, key))
    }

    fn push_impressions(&self, impressions: Vec<StoredImpression>) -> Result<()> {
        self.push_json(&self.keys.impressions(), &impressions)
    }

    fn pop_impressions(&self, max_count: usize) -> Result<Vec<StoredImpression>> {
        self.pop_json(&self.keys.impressions(), max_count)
    }

    fn impressions_count(&self) -> Result<usize> {
        let key = self.keys.impressions();
        self.with_connection(|con| con.llen(&key))
    }

    fn push_metrics(&self, metrics: Vec<StoredMetric>) -> Result<()> {
        self.push_json(&self.keys.metrics(), &metrics)
    }

    fn pop_metrics(&self, max_count: usize) -> Result<Vec<StoredMetric>> {
        self.pop_json(&self.keys.metrics(), max_count)
    }

    fn metrics_count(&self) -> Result<usize> {
        let key = self.keys.metrics();
        self.with_connection(|con| con.llen(&key))
    }
}
