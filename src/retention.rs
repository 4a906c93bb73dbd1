//! Snapshot cadence and cleanup of superseded snapshots and events.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::snapshot::SnapshotSelectionCriteria;

/// How the snapshot deletion range is derived from the sequence number of
/// a freshly stored snapshot.
///
/// Both variants always retain the snapshot just written, so deleting never
/// endangers recovery. They differ when a multi-event batch straddles a
/// snapshot boundary and the snapshot lands between two multiples of
/// `snapshot_every_n_events`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionWindow {
    /// Retain the new snapshot plus the `keep_n_snapshots - 1` snapshot
    /// boundaries strictly below it, and delete everything older.
    ///
    /// With `snapshot_every_n_events = 2`, `keep_n_snapshots = 2` and a
    /// snapshot at 3, boundary 2 is retained and snapshots `0..=1` are
    /// deleted.
    #[default]
    BoundaryAligned,

    /// Retain the trailing `keep_n_snapshots * snapshot_every_n_events`
    /// events' worth of snapshots below the new one, and delete everything
    /// before that.
    ///
    /// With the settings above and a snapshot at 3, nothing is deleted
    /// until the snapshot reaches sequence number 5.
    Trailing,
}

/// What the retention manager removes after a snapshot at some sequence
/// number was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionPlan {
    /// Delete journal events up to and including this sequence number
    /// before deleting snapshots.
    pub delete_events_to: Option<u64>,
    /// Snapshots to delete.
    pub snapshots: SnapshotSelectionCriteria,
}

/// Snapshot cadence and cleanup policy.
///
/// # Examples
///
/// ```
/// use entityfold::RetentionCriteria;
///
/// let retention = RetentionCriteria::snapshot_every(2, 2)
///     .unwrap()
///     .with_delete_events_on_snapshot();
///
/// // A batch moving from 1 to 3 crosses boundary 2.
/// assert!(retention.crosses_snapshot_boundary(1, 3));
///
/// let plan = retention.deletion_plan(3).unwrap();
/// assert_eq!(plan.delete_events_to, Some(1));
/// assert_eq!(plan.snapshots.max_sequence_nr, 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionCriteria {
    /// Take a snapshot whenever a batch reaches or crosses a multiple of
    /// this many events.
    pub snapshot_every_n_events: u64,
    /// Number of snapshots to retain.
    pub keep_n_snapshots: u64,
    /// Also delete journal events older than the retained snapshots.
    #[serde(default)]
    pub delete_events_on_snapshot: bool,
    /// Arithmetic used to compute deletion ranges.
    #[serde(default)]
    pub deletion_window: DeletionWindow,
}

impl RetentionCriteria {
    /// Snapshot every `n` events and keep `keep` snapshots.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if either argument is zero.
    pub fn snapshot_every(n: u64, keep: u64) -> Result<Self, ConfigError> {
        let criteria = Self {
            snapshot_every_n_events: n,
            keep_n_snapshots: keep,
            delete_events_on_snapshot: false,
            deletion_window: DeletionWindow::default(),
        };
        criteria.validate()?;
        Ok(criteria)
    }

    /// Also delete superseded journal events.
    pub fn with_delete_events_on_snapshot(mut self) -> Self {
        self.delete_events_on_snapshot = true;
        self
    }

    /// Use a different deletion range arithmetic.
    pub fn with_deletion_window(mut self, window: DeletionWindow) -> Self {
        self.deletion_window = window;
        self
    }

    /// Check the invariants; needed for criteria that were deserialized.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the interval or the keep count is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshot_every_n_events == 0 {
            return Err(ConfigError::ZeroSnapshotInterval);
        }
        if self.keep_n_snapshots == 0 {
            return Err(ConfigError::ZeroKeepSnapshots);
        }
        Ok(())
    }

    /// Whether a batch that moved the stream from `previous_sequence_nr`
    /// (exclusive) to `last_sequence_nr` (inclusive) reached a multiple of
    /// the snapshot interval.
    pub fn crosses_snapshot_boundary(&self, previous_sequence_nr: u64, last_sequence_nr: u64) -> bool {
        let n = self.snapshot_every_n_events;
        n > 0 && last_sequence_nr / n > previous_sequence_nr / n
    }

    /// Compute what to delete after a snapshot at `snapshot_sequence_nr`
    /// was stored. Returns `None` when nothing is old enough.
    pub fn deletion_plan(&self, snapshot_sequence_nr: u64) -> Option<DeletionPlan> {
        let upper = self.deletion_upper_bound(snapshot_sequence_nr)?;
        // Always from zero: a large batch can jump past several boundaries,
        // and whatever it skipped over must not survive.
        Some(DeletionPlan {
            delete_events_to: self.delete_events_on_snapshot.then_some(upper),
            snapshots: SnapshotSelectionCriteria::range(0, upper),
        })
    }

    /// Highest sequence number that may be deleted, if any.
    fn deletion_upper_bound(&self, last: u64) -> Option<u64> {
        let n = self.snapshot_every_n_events;
        let keep = self.keep_n_snapshots;
        if n == 0 || keep == 0 || last == 0 {
            return None;
        }
        match self.deletion_window {
            DeletionWindow::BoundaryAligned => {
                let oldest_kept = if keep == 1 {
                    last
                } else {
                    let previous_boundary = ((last - 1) / n) * n;
                    previous_boundary.saturating_sub((keep - 2).saturating_mul(n))
                };
                oldest_kept.checked_sub(1).filter(|upper| *upper > 0)
            }
            DeletionWindow::Trailing => {
                let upper = last.saturating_sub(keep.saturating_mul(n));
                (upper > 0).then_some(upper)
            }
        }
    }
}
