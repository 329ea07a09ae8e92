//! Offset-versioned storage.
//!
//! All mutable controller state lives in `VersionedMap`s. Every write is tagged with the log
//! offset of the record which produced it, and each key keeps an ordered list of
//! `(offset, value)` versions. A snapshot at offset `O` resolves each key to the most recent
//! version with an offset `<= O`, so a reader holding a snapshot offset sees a stable view of the
//! map even while the writer keeps appending versions at higher offsets.
//!
//! The map supports a single writer and any number of concurrent readers. Writes and reads only
//! ever take a shard lock of the underlying `DashMap` for the duration of a single key operation,
//! so readers never wait on the writer for longer than one version push.
//!
//! Snapshot lifetimes are managed explicitly by the owner: `snapshot` creates a read horizon,
//! `delete_snapshots_up_to` retires old horizons and compacts history which is no longer
//! reachable by any retained snapshot.

use std::collections::BTreeSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use thiserror::Error;

/// The offset value of a map which has never been written to.
pub const NO_OFFSET: i64 = -1;

/// Errors arising from misuse of a versioned map.
///
/// These always indicate a bug in the caller's offset discipline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A write was attempted at an offset which is not greater than the last written offset.
    #[error("{store}: write at offset {offset} is not greater than last written offset {last}")]
    NonMonotonicOffset { store: &'static str, offset: i64, last: i64 },
    /// A read or revert referenced a snapshot which does not exist.
    #[error("{store}: no snapshot exists at offset {offset}")]
    UnknownSnapshot { store: &'static str, offset: i64 },
    /// A snapshot was requested at an offset not greater than the latest snapshot.
    #[error("{store}: snapshot at offset {offset} is not greater than latest snapshot {latest}")]
    SnapshotOutOfOrder { store: &'static str, offset: i64, latest: i64 },
}

/// A single version of a value; `None` is a tombstone.
#[derive(Clone, Debug)]
struct Version<V> {
    offset: i64,
    value: Option<V>,
}

/// A map whose values are versioned by log offset.
pub struct VersionedMap<K, V> {
    /// The name of this map, used in error messages.
    name: &'static str,
    /// The version history of each key, ordered by offset.
    entries: DashMap<K, Vec<Version<V>>>,
    /// The highest offset written to this map, or covered by one of its snapshots.
    last_offset: AtomicI64,
    /// The offsets of all live snapshots.
    snapshots: Mutex<BTreeSet<i64>>,
}

impl<K, V> VersionedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a new instance.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            last_offset: AtomicI64::new(NO_OFFSET),
            snapshots: Mutex::new(BTreeSet::new()),
        }
    }

    /// The highest offset written to this map.
    pub fn last_offset(&self) -> i64 {
        self.last_offset.load(Ordering::Acquire)
    }

    /// Record a new version of `key` at `offset`.
    pub fn set(&self, key: K, offset: i64, value: V) -> Result<(), StoreError> {
        self.advance(offset)?;
        self.entries.entry(key).or_insert_with(Vec::new).push(Version { offset, value: Some(value) });
        Ok(())
    }

    /// Record a tombstone for `key` at `offset`, returning the value it replaced.
    ///
    /// Removing a key which is already absent does not create a version, but the offset is still
    /// validated and consumed.
    pub fn remove(&self, key: &K, offset: i64) -> Result<Option<V>, StoreError> {
        self.advance(offset)?;
        let mut versions = match self.entries.get_mut(key) {
            Some(versions) => versions,
            None => return Ok(None),
        };
        let previous = versions.last().and_then(|version| version.value.clone());
        if previous.is_some() {
            versions.push(Version { offset, value: None });
        }
        Ok(previous)
    }

    /// Get the latest value of `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).and_then(|versions| versions.last().and_then(|version| version.value.clone()))
    }

    /// Get the value of `key` as of the snapshot at `offset`.
    pub fn get_at(&self, key: &K, offset: i64) -> Result<Option<V>, StoreError> {
        self.ensure_snapshot(offset)?;
        let value = self.entries.get(key).and_then(|versions| resolve(&versions, offset));
        // Snapshots are deleted before their history is compacted, so if the snapshot is still
        // present after the read, the value was read from intact history.
        self.ensure_snapshot(offset)?;
        Ok(value)
    }

    /// Get all live entries of the map.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let value = entry.value().last().and_then(|version| version.value.clone())?;
                Some((entry.key().clone(), value))
            })
            .collect()
    }

    /// Get all live entries of the map as of the snapshot at `offset`.
    pub fn entries_at(&self, offset: i64) -> Result<Vec<(K, V)>, StoreError> {
        self.ensure_snapshot(offset)?;
        let entries = self
            .entries
            .iter()
            .filter_map(|entry| resolve(entry.value(), offset).map(|value| (entry.key().clone(), value)))
            .collect();
        self.ensure_snapshot(offset)?;
        Ok(entries)
    }

    /// The number of versions currently retained for `key`, tombstones included.
    pub fn history_len(&self, key: &K) -> usize {
        self.entries.get(key).map(|versions| versions.len()).unwrap_or(0)
    }

    /// Create a snapshot at `offset`.
    ///
    /// Snapshots must be created in increasing offset order. Creating a snapshot also forbids any
    /// further writes at or below its offset, as they would alter what the snapshot observes.
    pub fn snapshot(&self, offset: i64) -> Result<(), StoreError> {
        let mut snapshots = self.lock_snapshots();
        if let Some(latest) = snapshots.iter().next_back().copied() {
            if offset <= latest {
                return Err(StoreError::SnapshotOutOfOrder { store: self.name, offset, latest });
            }
        }
        snapshots.insert(offset);
        self.last_offset.fetch_max(offset, Ordering::AcqRel);
        Ok(())
    }

    /// Check if a snapshot exists at `offset`.
    pub fn has_snapshot(&self, offset: i64) -> bool {
        self.lock_snapshots().contains(&offset)
    }

    /// The offsets of all live snapshots, in ascending order.
    pub fn snapshots(&self) -> Vec<i64> {
        self.lock_snapshots().iter().copied().collect()
    }

    /// The offset of the most recent snapshot, if any.
    pub fn latest_snapshot(&self) -> Option<i64> {
        self.lock_snapshots().iter().next_back().copied()
    }

    /// Delete all snapshots with an offset below `offset`, and discard any history which is no
    /// longer reachable from the remaining snapshots or the latest state.
    pub fn delete_snapshots_up_to(&self, offset: i64) {
        let horizon = {
            let mut snapshots = self.lock_snapshots();
            let retained = snapshots.split_off(&offset);
            *snapshots = retained;
            snapshots.iter().next().copied().unwrap_or_else(|| self.last_offset())
        };
        self.entries.retain(|_, versions| {
            compact(versions, horizon);
            !versions.is_empty()
        });
    }

    /// Revert the map to the state observed by the snapshot at `offset`.
    ///
    /// All versions written after the snapshot are discarded along with any newer snapshots.
    /// The snapshot itself is retained, and writing resumes at offsets above it.
    pub fn revert_to_snapshot(&self, offset: i64) -> Result<(), StoreError> {
        {
            let mut snapshots = self.lock_snapshots();
            if !snapshots.contains(&offset) {
                return Err(StoreError::UnknownSnapshot { store: self.name, offset });
            }
            snapshots.retain(|snapshot| *snapshot <= offset);
        }
        self.entries.retain(|_, versions| {
            versions.retain(|version| version.offset <= offset);
            !versions.is_empty()
        });
        self.last_offset.store(offset, Ordering::Release);
        Ok(())
    }

    /// Validate that `offset` is greater than every offset seen so far, and record it.
    fn advance(&self, offset: i64) -> Result<(), StoreError> {
        let last = self.last_offset();
        if offset <= last {
            return Err(StoreError::NonMonotonicOffset { store: self.name, offset, last });
        }
        self.last_offset.store(offset, Ordering::Release);
        Ok(())
    }

    fn ensure_snapshot(&self, offset: i64) -> Result<(), StoreError> {
        if self.has_snapshot(offset) {
            Ok(())
        } else {
            Err(StoreError::UnknownSnapshot { store: self.name, offset })
        }
    }

    fn lock_snapshots(&self) -> MutexGuard<'_, BTreeSet<i64>> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolve the value visible at `offset` from the given version history.
fn resolve<V: Clone>(versions: &[Version<V>], offset: i64) -> Option<V> {
    versions
        .iter()
        .rev()
        .find(|version| version.offset <= offset)
        .and_then(|version| version.value.clone())
}

/// Drop every version which is shadowed at `horizon`, keeping the version visible at `horizon`
/// unless it is a tombstone.
fn compact<V>(versions: &mut Vec<Version<V>>, horizon: i64) {
    let visible = match versions.iter().rposition(|version| version.offset <= horizon) {
        Some(idx) => idx,
        None => return,
    };
    let drop_to = if versions[visible].value.is_none() { visible + 1 } else { visible };
    versions.drain(..drop_to);
}
