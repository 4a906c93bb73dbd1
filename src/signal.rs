//! Lifecycle notifications delivered to an entity's signal handler.

use crate::error::{EntityError, JournalError, SnapshotStoreError};
use crate::snapshot::{SnapshotMetadata, SnapshotSelectionCriteria};

/// Lifecycle notification emitted by an entity.
///
/// Every signal is delivered to
/// [`EventSourcedBehavior::on_signal`](crate::EventSourcedBehavior::on_signal)
/// and published to subscribers of
/// [`EntityRef::signals`](crate::EntityRef::signals). The set is closed, so
/// handlers match on it exhaustively.
#[derive(Debug, Clone)]
pub enum Signal {
    /// Recovery finished; the entity now accepts commands.
    RecoveryCompleted {
        /// Highest sequence number known after recovery.
        highest_sequence_nr: u64,
        /// Number of events folded during replay (excludes the snapshot).
        replayed_events: u64,
    },

    /// Recovery failed; the entity terminates without processing commands.
    RecoveryFailed {
        /// Why recovery failed.
        error: EntityError,
    },

    /// A snapshot was stored.
    SnapshotCompleted {
        /// Identity and position of the stored snapshot.
        metadata: SnapshotMetadata,
    },

    /// Storing a snapshot failed. The entity keeps running.
    SnapshotFailed {
        /// Identity and position of the snapshot that was not stored.
        metadata: SnapshotMetadata,
        /// Store failure.
        error: SnapshotStoreError,
    },

    /// Superseded snapshots were deleted by the retention policy.
    DeleteSnapshotsCompleted {
        /// The deleted range.
        criteria: SnapshotSelectionCriteria,
    },

    /// Deleting superseded snapshots failed. The entity keeps running.
    DeleteSnapshotsFailed {
        /// The range that should have been deleted.
        criteria: SnapshotSelectionCriteria,
        /// Store failure.
        error: SnapshotStoreError,
    },

    /// Events up to and including `to_sequence_nr` were deleted.
    DeleteEventsCompleted {
        /// Upper bound (inclusive) of the deleted events.
        to_sequence_nr: u64,
    },

    /// Deleting superseded events failed. The entity keeps running.
    DeleteEventsFailed {
        /// Upper bound (inclusive) that should have been deleted.
        to_sequence_nr: u64,
        /// Journal failure.
        error: JournalError,
    },
}

impl Signal {
    /// Short, stable name used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RecoveryCompleted { .. } => "recovery_completed",
            Self::RecoveryFailed { .. } => "recovery_failed",
            Self::SnapshotCompleted { .. } => "snapshot_completed",
            Self::SnapshotFailed { .. } => "snapshot_failed",
            Self::DeleteSnapshotsCompleted { .. } => "delete_snapshots_completed",
            Self::DeleteSnapshotsFailed { .. } => "delete_snapshots_failed",
            Self::DeleteEventsCompleted { .. } => "delete_events_completed",
            Self::DeleteEventsFailed { .. } => "delete_events_failed",
        }
    }

    /// Whether the signal reports a failure.
    pub fn is_failure(&self) -> bool {
        match self {
            Self::RecoveryFailed { .. }
            | Self::SnapshotFailed { .. }
            | Self::DeleteSnapshotsFailed { .. }
            | Self::DeleteEventsFailed { .. } => true,
            Self::RecoveryCompleted { .. }
            | Self::SnapshotCompleted { .. }
            | Self::DeleteSnapshotsCompleted { .. }
            | Self::DeleteEventsCompleted { .. } => false,
        }
    }
}
