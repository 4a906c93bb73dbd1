//! Crate-level error types for entities, backends and handles.

use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Shared, cloneable error source.
///
/// Termination reasons are broadcast to every observer of an entity, so the
/// errors they carry must be `Clone`; wrapping sources in an `Arc` keeps
/// them so without losing the original error chain.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned when constructing a [`PersistenceId`](crate::PersistenceId)
/// from malformed input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// No identity was supplied at all.
    #[error("persistence id is missing")]
    Missing,

    /// The supplied identity (or one of its parts) was empty.
    #[error("persistence id must not be empty")]
    Empty,

    /// The entity type contains the separator used to compose ids.
    #[error("entity type {entity_type:?} must not contain the '|' separator")]
    SeparatorInType {
        /// The offending entity type.
        entity_type: String,
    },
}

/// Error returned for invalid entity configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// `snapshot_every_n_events` was zero.
    #[error("snapshot interval must be at least one event")]
    ZeroSnapshotInterval,

    /// `keep_n_snapshots` was zero.
    #[error("at least one snapshot must be kept")]
    ZeroKeepSnapshots,

    /// A channel or buffer capacity was zero.
    #[error("{setting} must be at least one")]
    ZeroCapacity {
        /// Name of the offending setting.
        setting: &'static str,
    },
}

/// Error reported by a [`Journal`](crate::Journal) implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JournalError {
    /// Disk or network I/O failure inside the backend.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The batch does not continue the stream's sequence numbering.
    ///
    /// Raised when a writer believes the stream ends at a different
    /// sequence number than the journal does, e.g. because a second
    /// instance for the same identity wrote concurrently.
    #[error("sequence conflict: expected next sequence number {expected}, got {actual}")]
    SequenceConflict {
        /// The next sequence number the journal expected.
        expected: u64,
        /// The first sequence number of the rejected batch.
        actual: u64,
    },

    /// A stored record could not be parsed.
    #[error("corrupt journal record: {0}")]
    Corrupt(String),

    /// The backend refused the operation.
    #[error("journal rejected the operation: {0}")]
    Rejected(String),
}

impl From<io::Error> for JournalError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Error reported by a [`SnapshotStore`](crate::SnapshotStore)
/// implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SnapshotStoreError {
    /// Disk or network I/O failure inside the backend.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// A stored snapshot could not be parsed.
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    /// The backend refused the operation.
    #[error("snapshot store rejected the operation: {0}")]
    Rejected(String),
}

impl From<io::Error> for SnapshotStoreError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Error raised by an [`EventAdapter`](crate::EventAdapter) while
/// converting between domain events and journal payloads.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// The domain event could not be converted into a journal payload.
    #[error("failed to encode event: {0}")]
    Encode(#[source] BoxError),

    /// A journal payload could not be converted back into a domain event.
    #[error("failed to decode event of type {event_type:?}: {source}")]
    Decode {
        /// The stored event type tag.
        event_type: String,
        /// Underlying decoding failure.
        #[source]
        source: BoxError,
    },
}

/// Reason a recovery attempt failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecoveryError {
    /// The snapshot store failed to load the latest snapshot.
    #[error("loading snapshot failed: {0}")]
    SnapshotLoad(#[source] SnapshotStoreError),

    /// The loaded snapshot's state could not be deserialized.
    #[error("snapshot at sequence number {sequence_nr} could not be decoded: {source}")]
    SnapshotDecode {
        /// Sequence number the snapshot was taken at.
        sequence_nr: u64,
        /// Underlying deserialization failure.
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// The journal failed while streaming events.
    #[error("replaying events failed: {0}")]
    Replay(#[source] JournalError),

    /// A replayed record could not be turned back into a domain event.
    #[error("replayed event {sequence_nr} could not be decoded: {source}")]
    EventDecode {
        /// Sequence number of the offending record.
        sequence_nr: u64,
        /// Underlying adapter failure.
        #[source]
        source: AdapterError,
    },

    /// The journal returned events out of sequence order.
    #[error("replay out of order: expected sequence number above {previous}, got {actual}")]
    OutOfOrder {
        /// Last sequence number folded so far.
        previous: u64,
        /// The sequence number the journal returned.
        actual: u64,
    },

    /// Loading and replaying took longer than the configured deadline.
    #[error("recovery did not complete within {0:?}")]
    Timeout(Duration),
}

/// Fatal fault that terminated an entity instance.
///
/// Background faults (snapshot writes, retention deletes) never produce an
/// `EntityError`; they are reported as [`Signal`](crate::Signal)s instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EntityError {
    /// The command handler returned an error.
    #[error("command handler failed: {0}")]
    Handler(#[source] BoxError),

    /// The journal rejected or failed an append.
    #[error("persisting events {from_sequence_nr}..={to_sequence_nr} failed: {source}")]
    Persistence {
        /// First sequence number of the failed batch.
        from_sequence_nr: u64,
        /// Last sequence number of the failed batch.
        to_sequence_nr: u64,
        /// Underlying journal failure.
        #[source]
        source: JournalError,
    },

    /// The journal acknowledged different sequence numbers than written.
    #[error("journal acknowledged sequence numbers {acknowledged:?}, expected {expected:?}")]
    AcknowledgementMismatch {
        /// Sequence numbers the writer assigned.
        expected: Vec<u64>,
        /// Sequence numbers the journal reported as committed.
        acknowledged: Vec<u64>,
    },

    /// An event could not be converted for the journal.
    #[error("event adapter failed: {0}")]
    Adapter(#[from] AdapterError),

    /// Recovery could not rebuild the entity's state.
    #[error("recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    /// More commands arrived during recovery than the stash can hold.
    #[error("stash capacity of {capacity} commands exceeded")]
    StashOverflow {
        /// Configured stash capacity.
        capacity: usize,
    },
}

impl EntityError {
    /// Wrap a domain handler error.
    pub(crate) fn handler<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Handler(Arc::new(error))
    }
}

/// Error returned when a command cannot be delivered to an entity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The entity's task has exited, so no further commands are accepted.
    #[error("entity is no longer running")]
    EntityGone,
}

/// Error returned by request/response style interactions with an entity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AskError {
    /// The entity's task has exited before the command was delivered.
    #[error("entity is no longer running")]
    EntityGone,

    /// The entity dropped the reply handle without answering.
    ///
    /// Happens when the command handler did not chain a reply, or when the
    /// entity failed before the reply side effect ran.
    #[error("entity finished the command without replying")]
    NoReply,
}

impl From<SendError> for AskError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::EntityGone => Self::EntityGone,
        }
    }
}
