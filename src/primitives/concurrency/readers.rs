#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::thread::{self, ThreadId};
use std::time::Instant;

use serde::Serialize;

use crate::types::TxId;

/// Unique identifier assigned to registered snapshots for diagnostics.
pub type ReaderId = u64;

const MAX_SLOW_READER_SAMPLES: usize = 4;

/// Token returned by [`ReaderRegistry::register`]; hand it back to release the snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReaderToken {
    id: ReaderId,
    snapshot: TxId,
}

impl ReaderToken {
    /// Snapshot id pinned by this token.
    pub fn snapshot(&self) -> TxId {
        self.snapshot
    }
}

#[derive(Clone, Debug)]
struct ActiveReader {
    snapshot: TxId,
    begin_instant: Instant,
    thread_id: ThreadId,
}

/// Summary of reader activity.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ReaderSnapshot {
    /// Number of registered snapshots (readers plus the active writer's base).
    pub active: u64,
    /// Oldest pinned snapshot.
    pub oldest_snapshot: Option<u64>,
    /// Newest pinned snapshot.
    pub newest_snapshot: Option<u64>,
    /// Age of the longest-lived registration in milliseconds.
    pub max_age_ms: u64,
    /// Slowest registrations, oldest first.
    #[serde(skip)]
    pub slow_readers: Vec<ReaderSnapshotEntry>,
}

/// One registration captured in a [`ReaderSnapshot`].
#[derive(Clone, Debug)]
pub struct ReaderSnapshotEntry {
    /// Registration id.
    pub reader_id: ReaderId,
    /// Snapshot pinned by the registration.
    pub snapshot: TxId,
    /// Approximate age in milliseconds.
    pub age_ms: u64,
    /// Thread that registered.
    pub thread_id: ThreadId,
}

/// Tracks which transaction snapshots are still observable.
///
/// Freed pages and unflushed page versions are only reclaimed once no
/// registration pins a snapshot that could still see them.
#[derive(Debug, Default)]
pub struct ReaderRegistry {
    floor: BTreeMap<TxId, u32>,
    readers: HashMap<ReaderId, ActiveReader>,
    next_id: ReaderId,
}

impl ReaderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `snapshot` until the returned token is released.
    pub fn register(&mut self, snapshot: TxId, now: Instant) -> ReaderToken {
        *self.floor.entry(snapshot).or_insert(0) += 1;
        self.next_id += 1;
        let id = self.next_id;
        self.readers.insert(
            id,
            ActiveReader {
                snapshot,
                begin_instant: now,
                thread_id: thread::current().id(),
            },
        );
        ReaderToken { id, snapshot }
    }

    /// Releases a registration. Releasing twice is a no-op.
    pub fn release(&mut self, token: ReaderToken) {
        if self.readers.remove(&token.id).is_none() {
            return;
        }
        if let Some(count) = self.floor.get_mut(&token.snapshot) {
            if *count > 1 {
                *count -= 1;
            } else {
                self.floor.remove(&token.snapshot);
            }
        }
    }

    /// Oldest pinned snapshot, if any.
    pub fn oldest(&self) -> Option<TxId> {
        self.floor.keys().next().copied()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.readers.len()
    }

    /// Returns true when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Describes the live registrations.
    pub fn snapshot(&self, now: Instant) -> ReaderSnapshot {
        let mut snapshot = ReaderSnapshot {
            active: self.readers.len() as u64,
            oldest_snapshot: self.floor.keys().next().map(|tx| tx.0),
            newest_snapshot: self.floor.keys().next_back().map(|tx| tx.0),
            ..ReaderSnapshot::default()
        };
        let mut slow: Vec<ReaderSnapshotEntry> = self
            .readers
            .iter()
            .map(|(&reader_id, info)| ReaderSnapshotEntry {
                reader_id,
                snapshot: info.snapshot,
                age_ms: now
                    .saturating_duration_since(info.begin_instant)
                    .as_millis()
                    .min(u64::MAX as u128) as u64,
                thread_id: info.thread_id,
            })
            .collect();
        slow.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        slow.truncate(MAX_SLOW_READER_SAMPLES);
        snapshot.max_age_ms = slow.first().map(|entry| entry.age_ms).unwrap_or(0);
        snapshot.slow_readers = slow;
        snapshot
    }
}
