//! Snapshot types, the snapshot store contract and snapshot scheduling.
//!
//! A snapshot captures an entity's folded state at a sequence number so
//! recovery can start from it instead of replaying the whole journal. The
//! state travels as a `serde_json::Value`, which keeps [`SnapshotStore`]
//! implementations independent of the entity's state type.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SnapshotStoreError;
use crate::identity::PersistenceId;

/// Identity and position of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Entity the snapshot belongs to.
    pub persistence_id: PersistenceId,
    /// Sequence number of the last event folded into the snapshot state.
    pub sequence_nr: u64,
    /// Creation time in Unix epoch milliseconds.
    pub timestamp: u64,
}

/// A snapshot as exchanged with a [`SnapshotStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    /// Identity and position of the snapshot.
    pub metadata: SnapshotMetadata,
    /// Serialized entity state.
    pub state: serde_json::Value,
}

/// Bounds selecting snapshots to load or delete. All bounds are inclusive.
///
/// # Examples
///
/// ```
/// use entityfold::SnapshotSelectionCriteria;
///
/// let latest = SnapshotSelectionCriteria::latest();
/// assert!(latest.matches(42, 1_700_000_000_000));
///
/// let window = SnapshotSelectionCriteria::range(10, 20);
/// assert!(window.matches(10, 0));
/// assert!(!window.matches(21, 0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSelectionCriteria {
    /// Lowest sequence number selected.
    pub min_sequence_nr: u64,
    /// Highest sequence number selected.
    pub max_sequence_nr: u64,
    /// Earliest timestamp selected.
    pub min_timestamp: u64,
    /// Latest timestamp selected.
    pub max_timestamp: u64,
}

impl SnapshotSelectionCriteria {
    /// Select every snapshot; loading picks the newest.
    pub const fn latest() -> Self {
        Self {
            min_sequence_nr: 0,
            max_sequence_nr: u64::MAX,
            min_timestamp: 0,
            max_timestamp: u64::MAX,
        }
    }

    /// Select no snapshot at all; recovery then replays from the start.
    pub const fn none() -> Self {
        Self {
            min_sequence_nr: 0,
            max_sequence_nr: 0,
            min_timestamp: 0,
            max_timestamp: 0,
        }
    }

    /// Select snapshots whose sequence number lies in `min..=max`.
    pub const fn range(min_sequence_nr: u64, max_sequence_nr: u64) -> Self {
        Self {
            min_sequence_nr,
            max_sequence_nr,
            min_timestamp: 0,
            max_timestamp: u64::MAX,
        }
    }

    /// Restrict the upper sequence number bound.
    pub const fn with_max_sequence_nr(mut self, max_sequence_nr: u64) -> Self {
        self.max_sequence_nr = max_sequence_nr;
        self
    }

    /// Restrict the upper timestamp bound.
    pub const fn with_max_timestamp(mut self, max_timestamp: u64) -> Self {
        self.max_timestamp = max_timestamp;
        self
    }

    /// Whether a snapshot at `sequence_nr` taken at `timestamp` is selected.
    pub const fn matches(&self, sequence_nr: u64, timestamp: u64) -> bool {
        sequence_nr >= self.min_sequence_nr
            && sequence_nr <= self.max_sequence_nr
            && timestamp >= self.min_timestamp
            && timestamp <= self.max_timestamp
    }

    /// Whether `metadata` is selected.
    pub fn matches_metadata(&self, metadata: &SnapshotMetadata) -> bool {
        self.matches(metadata.sequence_nr, metadata.timestamp)
    }
}

impl Default for SnapshotSelectionCriteria {
    fn default() -> Self {
        Self::latest()
    }
}

/// Durable storage for entity snapshots.
///
/// Implementations must make [`save`](SnapshotStore::save) atomic: a
/// concurrent or later [`load_latest`](SnapshotStore::load_latest) sees
/// either the complete snapshot or nothing.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Store a snapshot, replacing any snapshot at the same sequence number.
    async fn save(&self, snapshot: StoredSnapshot) -> Result<(), SnapshotStoreError>;

    /// Load the newest snapshot of `persistence_id` selected by `criteria`.
    ///
    /// Returns `Ok(None)` when no snapshot matches; that is not an error.
    async fn load_latest(
        &self,
        persistence_id: &PersistenceId,
        criteria: &SnapshotSelectionCriteria,
    ) -> Result<Option<StoredSnapshot>, SnapshotStoreError>;

    /// Delete every snapshot of `persistence_id` selected by `criteria`.
    async fn delete(
        &self,
        persistence_id: &PersistenceId,
        criteria: &SnapshotSelectionCriteria,
    ) -> Result<(), SnapshotStoreError>;
}

/// Snapshot trigger evaluated for every event of a committed batch with the
/// state right after that event and its sequence number.
pub type SnapshotPredicate<S, E> = Arc<dyn Fn(&S, &E, u64) -> bool + Send + Sync>;

/// Keeps at most one snapshot write in flight per entity.
///
/// A snapshot requested while another is being written is parked; a newer
/// request replaces a parked one, since only the newest state matters.
#[derive(Debug, Default)]
pub(crate) struct SnapshotScheduler {
    in_flight: Option<u64>,
    pending: Option<StoredSnapshot>,
}

impl SnapshotScheduler {
    /// Register a snapshot request. Returns the snapshot if it should be
    /// written right away.
    pub(crate) fn request(&mut self, snapshot: StoredSnapshot) -> Option<StoredSnapshot> {
        if self.in_flight.is_some() {
            if let Some(replaced) = self.pending.replace(snapshot) {
                tracing::debug!(
                    sequence_nr = replaced.metadata.sequence_nr,
                    "superseded pending snapshot"
                );
            }
            return None;
        }
        self.in_flight = Some(snapshot.metadata.sequence_nr);
        Some(snapshot)
    }

    /// Mark the in-flight write as finished. Returns the parked snapshot, if
    /// any, which is now in flight.
    pub(crate) fn complete(&mut self) -> Option<StoredSnapshot> {
        self.in_flight = None;
        let next = self.pending.take()?;
        self.in_flight = Some(next.metadata.sequence_nr);
        Some(next)
    }

    /// Sequence number of the snapshot currently being written.
    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }
}
